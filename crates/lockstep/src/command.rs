use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CodecError, WireEncodable, WireValue};
use crate::entity::{EntityError, EntityId, EntityRegistry};
use crate::events::{CoreEvent, EventBus};

/// Identifies the participant a command came from. Local metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: EntityId,
    pub opcode: String,
    pub payload: WireValue,
    pub origin: Option<PeerId>,
}

impl Command {
    pub fn new(target: EntityId, opcode: impl Into<String>, payload: impl Into<WireValue>) -> Self {
        Self {
            target,
            opcode: opcode.into(),
            payload: payload.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: PeerId) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl WireEncodable for Command {
    const TYPE_NAME: &'static str = "Command";
    const FIELDS: &'static [&'static str] = &["target", "opcode", "payload"];

    fn to_fields(&self) -> Vec<WireValue> {
        vec![
            self.target.to_wire(),
            WireValue::text(self.opcode.clone()),
            self.payload.clone(),
        ]
    }

    fn from_fields(fields: Vec<WireValue>) -> Result<Self, CodecError> {
        let [target, opcode, payload]: [WireValue; 3] =
            fields.try_into().map_err(|_| CodecError::TypeMismatch {
                expected: Self::TYPE_NAME,
                found: "wrong field count".to_string(),
            })?;
        let opcode = match opcode {
            WireValue::Text(opcode) => opcode,
            other => {
                return Err(CodecError::FieldType {
                    type_name: Self::TYPE_NAME,
                    field: "opcode",
                    expected: "text",
                    found: other.kind(),
                })
            }
        };
        Ok(Self {
            target: EntityId::from_wire(target)?,
            opcode,
            payload,
            origin: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    Open,
    Closed,
    Executing,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub id: u64,
    pub state: TickState,
    pub commands: Vec<Command>,
}

impl Tick {
    fn open(id: u64, commands: Vec<Command>) -> Self {
        Self {
            id,
            state: TickState::Open,
            commands,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandLogError {
    #[error("tick {tick} is already closed; current open tick is {current}")]
    TickClosed { tick: u64, current: u64 },
    #[error("tick {requested} is not the open tick {current}")]
    UnknownTick { requested: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("target is not live: {0}")]
    DeadTarget(#[from] EntityError),
    #[error("no handler registered for opcode {0:?}")]
    UnknownOpcode(String),
    #[error("handler rejected command: {reason}")]
    Rejected { reason: String },
    #[error("malformed payload: {0}")]
    Payload(#[from] CodecError),
}

impl DispatchError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Handed to dispatch handlers while a tick executes.
pub struct DispatchContext<'a> {
    tick: u64,
    next: &'a mut Tick,
}

impl DispatchContext<'_> {
    /// Id of the tick being executed.
    pub fn tick_id(&self) -> u64 {
        self.tick
    }

    pub fn next_tick_id(&self) -> u64 {
        self.next.id
    }

    /// Follow-up commands always land in the next open tick.
    pub fn queue(&mut self, command: Command) {
        self.next.commands.push(command);
    }
}

type Handler<E> =
    Box<dyn FnMut(&mut E, &Command, &mut DispatchContext<'_>) -> Result<(), DispatchError>>;

/// Opcode to handler map applied to resolved entities.
pub struct DispatchTable<E> {
    handlers: BTreeMap<String, Handler<E>>,
}

impl<E> Default for DispatchTable<E> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<E> fmt::Debug for DispatchTable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("opcodes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E> DispatchTable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an earlier handler for `opcode` was replaced.
    pub fn register<F>(&mut self, opcode: impl Into<String>, handler: F) -> bool
    where
        F: FnMut(&mut E, &Command, &mut DispatchContext<'_>) -> Result<(), DispatchError>
            + 'static,
    {
        self.handlers
            .insert(opcode.into(), Box::new(handler))
            .is_some()
    }

    pub fn contains(&self, opcode: &str) -> bool {
        self.handlers.contains_key(opcode)
    }

    pub fn opcodes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn dispatch(
        &mut self,
        entity: &mut E,
        command: &Command,
        context: &mut DispatchContext<'_>,
    ) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get_mut(&command.opcode)
            .ok_or_else(|| DispatchError::UnknownOpcode(command.opcode.clone()))?;
        handler(entity, command, context)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub index: usize,
    pub error: DispatchError,
}

/// Outcome of one `fire`: the committed tick and what happened to each command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    pub executed: usize,
    pub failures: Vec<CommandFailure>,
}

impl TickReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Per-tick command batches. Exactly one tick is open at any time.
#[derive(Debug)]
pub struct CommandLog {
    open: Tick,
    future: BTreeMap<u64, Vec<Command>>,
}

impl Default for CommandLog {
    fn default() -> Self {
        Self {
            open: Tick::open(0, Vec::new()),
            future: BTreeMap::new(),
        }
    }
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick_id(&self) -> u64 {
        self.open.id
    }

    pub fn open_tick(&self) -> &Tick {
        &self.open
    }

    /// Commands buffered for ticks that have not opened yet.
    pub fn scheduled(&self) -> usize {
        self.future.values().map(Vec::len).sum()
    }

    pub fn queue(
        &mut self,
        target: EntityId,
        opcode: impl Into<String>,
        payload: impl Into<WireValue>,
    ) -> u64 {
        self.queue_command(Command::new(target, opcode, payload))
    }

    /// Appends to the open tick and returns its id.
    pub fn queue_command(&mut self, command: Command) -> u64 {
        self.open.commands.push(command);
        self.open.id
    }

    /// Empties the open tick, returning what it held.
    pub fn take_open_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.open.commands)
    }

    /// Keeps only the open-tick commands `keep` accepts; returns how many
    /// were removed.
    pub fn retain_open_commands(&mut self, mut keep: impl FnMut(&Command) -> bool) -> usize {
        let before = self.open.commands.len();
        self.open.commands.retain(|command| keep(command));
        before - self.open.commands.len()
    }

    pub fn queue_at(&mut self, tick_id: u64, command: Command) -> Result<(), CommandLogError> {
        let current = self.open.id;
        if tick_id < current {
            return Err(CommandLogError::TickClosed {
                tick: tick_id,
                current,
            });
        }
        if tick_id == current {
            self.open.commands.push(command);
        } else {
            self.future.entry(tick_id).or_default().push(command);
        }
        Ok(())
    }

    /// Closes the open tick and opens its successor, pulling in anything
    /// scheduled for it.
    fn open_next(&mut self) -> Tick {
        let next_id = self.open.id + 1;
        let scheduled = self.future.remove(&next_id).unwrap_or_default();
        let mut closed = std::mem::replace(&mut self.open, Tick::open(next_id, scheduled));
        closed.state = TickState::Closed;
        debug!(
            tick = closed.id,
            commands = closed.commands.len(),
            next_tick = next_id,
            "tick_closed"
        );
        closed
    }

    pub fn fire<E>(
        &mut self,
        tick_id: u64,
        entities: &mut EntityRegistry<E>,
        dispatch: &mut DispatchTable<E>,
        bus: &mut EventBus<CoreEvent>,
    ) -> Result<TickReport, CommandLogError> {
        if tick_id != self.open.id {
            return Err(CommandLogError::UnknownTick {
                requested: tick_id,
                current: self.open.id,
            });
        }

        let mut tick = self.open_next();
        tick.state = TickState::Executing;

        let mut executed = 0;
        let mut failures = Vec::new();
        for (index, command) in tick.commands.iter().enumerate() {
            let mut context = DispatchContext {
                tick: tick.id,
                next: &mut self.open,
            };
            let outcome = match entities.resolve_mut(command.target) {
                Ok(entity) => dispatch.dispatch(entity, command, &mut context),
                Err(error) => Err(DispatchError::DeadTarget(error)),
            };

            match outcome {
                Ok(()) => {
                    executed += 1;
                    debug!(
                        tick = tick.id,
                        index,
                        target = %command.target,
                        opcode = command.opcode.as_str(),
                        "command_executed"
                    );
                    bus.publish(&CoreEvent::CommandExecuted {
                        tick: tick.id,
                        index,
                        target: command.target,
                        opcode: command.opcode.clone(),
                    });
                }
                Err(error) => {
                    warn!(
                        tick = tick.id,
                        index,
                        target = %command.target,
                        opcode = command.opcode.as_str(),
                        error = %error,
                        "command_failed"
                    );
                    bus.publish(&CoreEvent::CommandFailed {
                        tick: tick.id,
                        index,
                        target: command.target,
                        opcode: command.opcode.clone(),
                        reason: error.to_string(),
                    });
                    failures.push(CommandFailure { index, error });
                }
            }
        }

        tick.state = TickState::Committed;
        debug!(
            tick = tick.id,
            executed,
            failed = failures.len(),
            "tick_committed"
        );
        bus.publish(&CoreEvent::TickCommitted {
            tick: tick.id,
            executed,
            failed: failures.len(),
        });

        Ok(TickReport {
            tick,
            executed,
            failures,
        })
    }
}
