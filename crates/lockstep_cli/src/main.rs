use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use lockstep_cli::{run, CommandKind, HostConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn run_cli() -> Result<(), String> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage_text());
    }
    if args[0] == "-h" || args[0] == "--help" {
        print_usage();
        return Ok(());
    }

    let mut config_path = None::<PathBuf>;
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
                index += 2;
            }
            _ => break,
        }
    }

    let command = args
        .get(index)
        .ok_or_else(|| "missing subcommand".to_string())?
        .as_str();
    let command_args = &args[(index + 1)..];

    let kind = match command {
        "record" => match command_args {
            [script, out] => CommandKind::Record {
                script: PathBuf::from(script),
                out: PathBuf::from(out),
            },
            _ => return Err("record requires <script> <out>".to_string()),
        },
        "replay" => match command_args {
            [stream] => CommandKind::Replay {
                stream: PathBuf::from(stream),
            },
            _ => return Err("replay requires <stream>".to_string()),
        },
        "inspect" => match command_args {
            [stream] => CommandKind::Inspect {
                stream: PathBuf::from(stream),
            },
            _ => return Err("inspect requires <stream>".to_string()),
        },
        other => return Err(format!("unknown subcommand '{other}'")),
    };

    let config = match &config_path {
        Some(path) => HostConfig::load(path).map_err(|error| error.to_string())?,
        None => HostConfig::default(),
    };
    let config_label = config_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    info!(
        config = %config_label,
        tick_rate = config.session.tick_rate,
        entities = config.entities.len(),
        "host_started"
    );

    run(kind, &config, &mut io::stdout()).map_err(|error| error.to_string())
}

fn print_usage() {
    println!("{}", usage_text());
}

fn usage_text() -> String {
    [
        "lockstep_cli - record, replay and inspect lockstep command streams",
        "",
        "Usage:",
        "  lockstep_cli [--config <json>] record <script> <out>",
        "  lockstep_cli [--config <json>] replay <stream>",
        "  lockstep_cli [--config <json>] inspect <stream>",
        "",
        "Script lines:",
        "  # comment",
        "  advance <seconds>",
        "  tick",
        "  <opcode> <slot> <argument>    (opcodes: add, set, rename)",
    ]
    .join("\n")
}
