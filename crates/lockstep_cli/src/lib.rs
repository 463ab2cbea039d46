use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lockstep::{
    parse_json, read_command_stream, write_command_stream, ConfigError, DispatchError, EntityId,
    Session, SessionConfig, SessionError, StreamError, TickRecord, TypeRegistry, WireValue,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_ENTITY_NAMES: &[&str] = &["alpha", "beta"];

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to read script {path}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("script line {line}: {message}")]
    Script { line: usize, message: String },
    #[error("script line {line}: no live entity in slot {slot}")]
    UnknownSlot { line: usize, slot: u32 },
    #[error("failed writing output: {0}")]
    Output(#[source] io::Error),
}

/// Session settings plus the entities spawned before the first tick.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub session: SessionConfig,
    pub entities: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            entities: DEFAULT_ENTITY_NAMES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }
}

impl HostConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_json(raw)?;
        config.session.validate()?;
        if config.entities.is_empty() {
            return Err(ConfigError::Invalid {
                field: "entities",
                message: "expected at least one entity".to_string(),
            });
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json_str(&raw)?)
    }
}

/// Demo entity driven by scripts: a named integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub name: String,
    pub value: i64,
}

impl Counter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0,
        }
    }
}

pub enum CommandKind {
    Record { script: PathBuf, out: PathBuf },
    Replay { stream: PathBuf },
    Inspect { stream: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Advance { line: usize, seconds: f64 },
    Tick { line: usize },
    Command {
        line: usize,
        opcode: String,
        slot: u32,
        argument: WireValue,
    },
}

pub fn parse_script(content: &str) -> Result<Vec<ScriptStep>, CliError> {
    let mut steps = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut words = trimmed.split_whitespace();
        let head = words.next().unwrap_or_default();
        let rest = words.collect::<Vec<_>>();
        let step = match head {
            "advance" => {
                let [seconds] = rest.as_slice() else {
                    return Err(script_error(line, "advance takes exactly one value"));
                };
                let seconds = seconds
                    .parse::<f64>()
                    .map_err(|_| script_error(line, format!("invalid seconds '{seconds}'")))?;
                ScriptStep::Advance { line, seconds }
            }
            "tick" => {
                if !rest.is_empty() {
                    return Err(script_error(line, "tick takes no arguments"));
                }
                ScriptStep::Tick { line }
            }
            opcode => {
                let Some((slot, argument)) = rest.split_first() else {
                    return Err(script_error(
                        line,
                        format!("{opcode} requires a slot and an argument"),
                    ));
                };
                let slot = slot
                    .parse::<u32>()
                    .map_err(|_| script_error(line, format!("invalid slot '{slot}'")))?;
                if argument.is_empty() {
                    return Err(script_error(line, format!("{opcode} requires an argument")));
                }
                ScriptStep::Command {
                    line,
                    opcode: opcode.to_string(),
                    slot,
                    argument: parse_argument(&argument.join(" ")),
                }
            }
        };
        steps.push(step);
    }
    Ok(steps)
}

fn parse_argument(raw: &str) -> WireValue {
    match raw {
        "null" => WireValue::Null,
        "true" => WireValue::Bool(true),
        "false" => WireValue::Bool(false),
        _ => match raw.parse::<i64>() {
            Ok(value) => WireValue::Int(value),
            Err(_) => WireValue::text(raw),
        },
    }
}

fn script_error(line: usize, message: impl Into<String>) -> CliError {
    CliError::Script {
        line,
        message: message.into(),
    }
}

/// Session over `Counter` entities with the `add`, `set` and `rename`
/// opcodes, spawned in config order.
pub fn build_world(config: &HostConfig) -> Result<Session<Counter>, CliError> {
    let mut session = Session::new(&config.session)?;
    session.register_handler("add", |counter: &mut Counter, command, _context| {
        let amount = int_payload(&command.payload, "add")?;
        counter.value = counter
            .value
            .checked_add(amount)
            .ok_or_else(|| DispatchError::rejected("add overflows"))?;
        Ok(())
    });
    session.register_handler("set", |counter: &mut Counter, command, _context| {
        counter.value = int_payload(&command.payload, "set")?;
        Ok(())
    });
    session.register_handler("rename", |counter: &mut Counter, command, _context| {
        let name = command
            .payload
            .as_text()
            .ok_or_else(|| DispatchError::rejected("rename needs text"))?;
        counter.name = name.to_string();
        Ok(())
    });

    for name in &config.entities {
        session.spawn(Counter::named(name.clone()));
    }
    Ok(session)
}

fn int_payload(payload: &WireValue, opcode: &str) -> Result<i64, DispatchError> {
    payload
        .as_int()
        .ok_or_else(|| DispatchError::rejected(format!("{opcode} needs an int")))
}

/// Runs script steps, then commits anything still queued so no command is
/// left out of the recording.
pub fn run_script(session: &mut Session<Counter>, steps: &[ScriptStep]) -> Result<(), CliError> {
    for step in steps {
        match step {
            ScriptStep::Advance { seconds, .. } => {
                session.advance(*seconds)?;
            }
            ScriptStep::Tick { .. } => {
                session.fire(session.current_tick_id())?;
            }
            ScriptStep::Command {
                line,
                opcode,
                slot,
                argument,
            } => {
                let target = resolve_slot(session, *slot, *line)?;
                session.queue(target, opcode.clone(), argument.clone())?;
            }
        }
    }
    if !session.pending_commands().is_empty() {
        session.fire(session.current_tick_id())?;
    }
    Ok(())
}

fn resolve_slot(session: &Session<Counter>, slot: u32, line: usize) -> Result<EntityId, CliError> {
    session
        .entities()
        .handle_at(slot)
        .ok_or(CliError::UnknownSlot { line, slot })
}

pub fn run<W: Write>(kind: CommandKind, config: &HostConfig, stdout: &mut W) -> Result<(), CliError> {
    match kind {
        CommandKind::Record { script, out } => {
            let content = fs::read_to_string(&script).map_err(|source| CliError::ReadScript {
                path: script.clone(),
                source,
            })?;
            let steps = parse_script(&content)?;

            let mut recording = config.clone();
            recording.session.record_commands = true;
            let mut session = build_world(&recording)?;
            run_script(&mut session, &steps)?;

            let records = session.take_recording();
            write_command_stream(&out, &records, session.types())?;
            info!(
                script = %script.display(),
                out = %out.display(),
                ticks = records.len(),
                "script_recorded"
            );
            writeln!(stdout, "recorded {} ticks to {}", records.len(), out.display())
                .map_err(CliError::Output)?;
            write_state(stdout, &session)
        }
        CommandKind::Replay { stream } => {
            let mut replaying = config.clone();
            replaying.session.record_commands = false;
            let mut session = build_world(&replaying)?;
            let records = read_command_stream(&stream, session.types())?;
            session.replay(&records)?;
            writeln!(stdout, "replayed {} ticks from {}", records.len(), stream.display())
                .map_err(CliError::Output)?;
            write_state(stdout, &session)
        }
        CommandKind::Inspect { stream } => {
            let records = read_command_stream(&stream, &TypeRegistry::with_core_types())?;
            write_records(stdout, &records)
        }
    }
}

fn write_state<W: Write>(stdout: &mut W, session: &Session<Counter>) -> Result<(), CliError> {
    for (id, counter) in session.entities().iter() {
        writeln!(stdout, "entity {id} {} {}", counter.name, counter.value)
            .map_err(CliError::Output)?;
    }
    writeln!(stdout, "digest {}", session.digest_hex()).map_err(CliError::Output)
}

fn write_records<W: Write>(stdout: &mut W, records: &[TickRecord]) -> Result<(), CliError> {
    for record in records {
        writeln!(
            stdout,
            "tick {}: {} commands",
            record.tick_id,
            record.commands.len()
        )
        .map_err(CliError::Output)?;
        for command in &record.commands {
            writeln!(
                stdout,
                "  {} {} {}",
                command.target,
                command.opcode,
                describe(&command.payload)
            )
            .map_err(CliError::Output)?;
        }
    }
    Ok(())
}

fn describe(value: &WireValue) -> String {
    match value {
        WireValue::Null => "null".to_string(),
        WireValue::Bool(flag) => flag.to_string(),
        WireValue::Int(number) => number.to_string(),
        WireValue::BigInt(number) => number.to_string(),
        WireValue::Text(text) => format!("{text:?}"),
        other => format!("{other:?}"),
    }
}
