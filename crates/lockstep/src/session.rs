use thiserror::Error;
use tracing::{debug, info, warn};

use crate::callbacks::Callback;
use crate::clock::{ClockError, TickClock};
use crate::codec::{encode, CodecError, TypeRegistry, WireEncodable, WireValue};
use crate::command::{
    Command, CommandLog, CommandLogError, DispatchContext, DispatchError, DispatchTable,
    TickReport,
};
use crate::config::{ConfigError, SessionConfig};
use crate::entity::{EntityError, EntityId, EntityRegistry};
use crate::events::{CoreEvent, EventBus, EventBusError};
use crate::hashing::{chain_tick, to_hex_lower, DIGEST_LEN};
use crate::stream::{encode_command_batch, TickRecord};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    CommandLog(#[from] CommandLogError),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Events(#[from] EventBusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("advance stopped after committing {} ticks: {source}", .committed.len())]
    AdvanceInterrupted {
        committed: Vec<TickReport>,
        #[source]
        source: Box<SessionError>,
    },
}

/// One lockstep simulation: everything a peer needs to turn a command
/// stream into state, with nothing shared between sessions.
#[derive(Debug)]
pub struct Session<E> {
    clock: TickClock,
    log: CommandLog,
    entities: EntityRegistry<E>,
    bus: EventBus<CoreEvent>,
    dispatch: DispatchTable<E>,
    types: TypeRegistry,
    digest: [u8; DIGEST_LEN],
    committed: u64,
    recording: Option<Vec<TickRecord>>,
}

impl<E> Session<E> {
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let clock = TickClock::new(config.tick_rate)?
            .with_max_ticks_per_advance(config.max_ticks_per_advance);
        info!(
            tick_rate = config.tick_rate,
            max_ticks_per_advance = ?config.max_ticks_per_advance,
            record_commands = config.record_commands,
            "session_started"
        );
        Ok(Self {
            clock,
            log: CommandLog::new(),
            entities: EntityRegistry::new(),
            bus: EventBus::new(config.message_types()),
            dispatch: DispatchTable::new(),
            types: TypeRegistry::with_core_types(),
            digest: [0u8; DIGEST_LEN],
            committed: 0,
            recording: config.record_commands.then(Vec::new),
        })
    }

    pub fn register_type<T: WireEncodable>(&mut self) -> Result<(), SessionError> {
        self.types.register::<T>()?;
        Ok(())
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn register_handler<F>(&mut self, opcode: impl Into<String>, handler: F) -> bool
    where
        F: FnMut(&mut E, &Command, &mut DispatchContext<'_>) -> Result<(), DispatchError>
            + 'static,
    {
        self.dispatch.register(opcode, handler)
    }

    pub fn subscribe(
        &mut self,
        message_type: &str,
        callback: Callback<CoreEvent>,
    ) -> Result<(), SessionError> {
        self.bus.subscribe(message_type, callback)?;
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        message_type: &str,
        callback: &Callback<CoreEvent>,
    ) -> Result<(), SessionError> {
        self.bus.unsubscribe(message_type, callback)?;
        Ok(())
    }

    pub fn bus_mut(&mut self) -> &mut EventBus<CoreEvent> {
        &mut self.bus
    }

    pub fn spawn(&mut self, entity: E) -> EntityId {
        let id = self.entities.allocate(entity);
        debug!(entity = %id, "entity_allocated");
        self.bus.publish(&CoreEvent::EntityAllocated { id });
        id
    }

    pub fn despawn(&mut self, id: EntityId) -> Result<E, SessionError> {
        let entity = self.entities.release(id)?;
        debug!(entity = %id, "entity_released");
        self.bus.publish(&CoreEvent::EntityReleased { id });
        Ok(entity)
    }

    pub fn resolve(&self, id: EntityId) -> Result<&E, EntityError> {
        self.entities.resolve(id)
    }

    pub fn entities(&self) -> &EntityRegistry<E> {
        &self.entities
    }

    pub fn current_tick_id(&self) -> u64 {
        self.log.current_tick_id()
    }

    /// Commands waiting in the open tick.
    pub fn pending_commands(&self) -> &[Command] {
        &self.log.open_tick().commands
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Queues into the open tick and returns its id. Commands the type
    /// registry cannot encode are refused and never enter the log.
    pub fn queue(
        &mut self,
        target: EntityId,
        opcode: impl Into<String>,
        payload: impl Into<WireValue>,
    ) -> Result<u64, SessionError> {
        self.queue_command(Command::new(target, opcode, payload))
    }

    pub fn queue_command(&mut self, command: Command) -> Result<u64, SessionError> {
        self.check_encodable(&command)?;
        Ok(self.log.queue_command(command))
    }

    pub fn queue_at(&mut self, tick_id: u64, command: Command) -> Result<(), SessionError> {
        self.check_encodable(&command)?;
        self.log.queue_at(tick_id, command)?;
        Ok(())
    }

    fn check_encodable(&self, command: &Command) -> Result<(), CodecError> {
        encode(&command.to_wire(), &self.types).map(|_| ())
    }

    /// Commits the open tick. The batch is encoded before execution, so a
    /// payload the type registry cannot carry leaves the tick open.
    pub fn fire(&mut self, tick_id: u64) -> Result<TickReport, SessionError> {
        if tick_id != self.log.current_tick_id() {
            return Err(CommandLogError::UnknownTick {
                requested: tick_id,
                current: self.log.current_tick_id(),
            }
            .into());
        }
        let batch = encode_command_batch(&self.log.open_tick().commands, &self.types)?;
        let report = self
            .log
            .fire(tick_id, &mut self.entities, &mut self.dispatch, &mut self.bus)?;

        self.digest = chain_tick(&self.digest, report.tick.id, &batch);
        self.committed += 1;
        if let Some(recording) = self.recording.as_mut() {
            recording.push(TickRecord::from(&report.tick));
        }

        let types = &self.types;
        let dropped = self
            .log
            .retain_open_commands(|command| encode(&command.to_wire(), types).is_ok());
        if dropped > 0 {
            warn!(
                tick = report.tick.id,
                next_tick = self.log.current_tick_id(),
                dropped,
                "unencodable_follow_ups_dropped"
            );
        }
        Ok(report)
    }

    /// Feeds frame time to the clock and commits one tick per boundary it
    /// reports. If a commit fails, the ticks not yet committed go back to
    /// the clock as owed and the error carries the reports already made.
    pub fn advance(&mut self, elapsed: f64) -> Result<Vec<TickReport>, SessionError> {
        let span = self.clock.advance(elapsed)?;
        let mut reports = Vec::new();
        for fired in 0..span.count {
            let tick_id = self.log.current_tick_id();
            match self.fire(tick_id) {
                Ok(report) => reports.push(report),
                Err(error) => {
                    let unfired = span.count - fired;
                    self.clock.defer(unfired);
                    warn!(
                        tick = tick_id,
                        committed = fired,
                        deferred = unfired,
                        error = %error,
                        "advance_interrupted"
                    );
                    return Err(SessionError::AdvanceInterrupted {
                        committed: reports,
                        source: Box::new(error),
                    });
                }
            }
        }
        Ok(reports)
    }

    pub fn set_rate(&mut self, rate: f64) -> Result<(), SessionError> {
        self.clock.set_rate(rate)?;
        info!(tick_rate = rate, "tick_rate_changed");
        Ok(())
    }

    /// Running digest over every committed tick; equal across peers that
    /// executed the same stream.
    pub fn digest(&self) -> [u8; DIGEST_LEN] {
        self.digest
    }

    pub fn digest_hex(&self) -> String {
        to_hex_lower(&self.digest)
    }

    pub fn committed_ticks(&self) -> u64 {
        self.committed
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recorded(&self) -> &[TickRecord] {
        self.recording.as_deref().unwrap_or(&[])
    }

    pub fn take_recording(&mut self) -> Vec<TickRecord> {
        self.recording.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Re-queues and fires each record in order. Every record must name the
    /// tick that is open when it is reached. A record is the complete batch
    /// for its tick, so follow-ups generated while replaying the previous
    /// tick are superseded by it.
    pub fn replay(&mut self, records: &[TickRecord]) -> Result<Vec<TickReport>, SessionError> {
        let mut reports = Vec::with_capacity(records.len());
        for record in records {
            let current = self.log.current_tick_id();
            if record.tick_id != current {
                return Err(CommandLogError::UnknownTick {
                    requested: record.tick_id,
                    current,
                }
                .into());
            }
            encode_command_batch(&record.commands, &self.types)?;
            let superseded = self.log.take_open_commands();
            if !superseded.is_empty() {
                debug!(
                    tick = current,
                    superseded = superseded.len(),
                    "replay_superseded_open_commands"
                );
            }
            for command in &record.commands {
                self.log.queue_command(command.clone());
            }
            reports.push(self.fire(current)?);
        }
        info!(
            ticks = records.len(),
            digest = %self.digest_hex(),
            "replay_finished"
        );
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tempfile::TempDir;

    use super::*;
    use crate::codec::WireObject;
    use crate::events::{ENTITY_ALLOCATED, ENTITY_RELEASED};
    use crate::stream::{read_command_stream, write_command_stream};

    #[derive(Debug, Default, PartialEq)]
    struct Counter {
        value: i64,
    }

    fn counter_session(config: &SessionConfig) -> Session<Counter> {
        let mut session = Session::new(config).expect("session");
        session.register_handler("add", |counter: &mut Counter, command, _context| {
            let amount = command
                .payload
                .as_int()
                .ok_or_else(|| DispatchError::rejected("add needs an int"))?;
            counter.value += amount;
            Ok(())
        });
        session.register_handler("double_later", |_counter: &mut Counter, command, context| {
            context.queue(Command::new(command.target, "add", 100));
            Ok(())
        });
        session
    }

    fn recording_config() -> SessionConfig {
        SessionConfig {
            tick_rate: 10.0,
            record_commands: true,
            ..SessionConfig::default()
        }
    }

    fn play_script(session: &mut Session<Counter>) -> EntityId {
        let a = session.spawn(Counter::default());
        let b = session.spawn(Counter::default());
        session.queue(a, "add", 5).expect("queue");
        session.queue(b, "double_later", WireValue::Null).expect("queue");
        session.advance(0.1).expect("advance");
        session.queue(a, "add", -2).expect("queue");
        session.queue(b, "add", "oops").expect("queue");
        session.advance(0.25).expect("advance");
        a
    }

    #[derive(Default)]
    struct Lifecycle {
        events: Vec<CoreEvent>,
    }

    impl Lifecycle {
        fn record(&mut self, event: &CoreEvent) {
            self.events.push(event.clone());
        }
    }

    #[test]
    fn advance_commits_one_tick_per_boundary() {
        let mut session = counter_session(&recording_config());
        let unit = session.spawn(Counter::default());
        session.queue(unit, "add", 3).expect("queue");

        let reports = session.advance(0.25).expect("advance");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].tick.id, 0);
        assert_eq!(reports[0].executed, 1);
        assert_eq!(reports[1].tick.id, 1);
        assert_eq!(session.current_tick_id(), 2);
        assert_eq!(session.committed_ticks(), 2);
        assert_eq!(session.resolve(unit).expect("unit").value, 3);
    }

    #[test]
    fn identical_inputs_produce_identical_digests() {
        let mut left = counter_session(&recording_config());
        let mut right = counter_session(&SessionConfig::default());
        right.set_rate(10.0).expect("rate");
        play_script(&mut left);
        play_script(&mut right);
        assert_eq!(left.digest_hex(), right.digest_hex());
        assert_eq!(left.digest_hex().len(), 64);

        let mut diverged = counter_session(&recording_config());
        let unit = diverged.spawn(Counter::default());
        diverged.queue(unit, "add", 6).expect("queue");
        diverged.advance(0.1).expect("advance");
        assert_ne!(diverged.digest(), left.digest());
    }

    #[test]
    fn spawn_and_despawn_are_broadcast() {
        let mut session = counter_session(&SessionConfig::default());
        let listener = Rc::new(RefCell::new(Lifecycle::default()));
        for message_type in [ENTITY_ALLOCATED, ENTITY_RELEASED] {
            session
                .subscribe(message_type, Callback::bind(&listener, Lifecycle::record))
                .expect("subscribe");
        }

        let id = session.spawn(Counter { value: 9 });
        let released = session.despawn(id).expect("despawn");
        assert_eq!(released.value, 9);
        assert!(matches!(
            session.despawn(id),
            Err(SessionError::Entity(EntityError::StaleHandle(_)))
        ));
        assert_eq!(
            listener.borrow().events,
            vec![
                CoreEvent::EntityAllocated { id },
                CoreEvent::EntityReleased { id }
            ]
        );
    }

    #[test]
    fn unknown_subscription_type_is_rejected() {
        let mut session = counter_session(&SessionConfig::default());
        let listener = Rc::new(RefCell::new(Lifecycle::default()));
        let error = session
            .subscribe("chat", Callback::bind(&listener, Lifecycle::record))
            .expect_err("not in vocabulary");
        assert!(matches!(
            error,
            SessionError::Events(EventBusError::UnknownMessageType(_))
        ));

        let mut extended = counter_session(&SessionConfig {
            extra_message_types: vec!["chat".to_string()],
            ..SessionConfig::default()
        });
        extended
            .subscribe("chat", Callback::bind(&listener, Lifecycle::record))
            .expect("configured type");
    }

    #[test]
    fn recorded_stream_replays_to_same_digest_and_state() {
        let temp = TempDir::new().expect("temp");
        let path = temp.path().join("match.lscs");

        let mut live = counter_session(&recording_config());
        let a = play_script(&mut live);
        assert_eq!(live.recorded().len(), 3);
        let records = live.take_recording();
        write_command_stream(&path, &records, live.types()).expect("write");

        let mut replica = counter_session(&SessionConfig::default());
        replica.spawn(Counter::default());
        replica.spawn(Counter::default());
        let loaded = read_command_stream(&path, replica.types()).expect("read");
        let reports = replica.replay(&loaded).expect("replay");

        assert_eq!(reports.len(), 3);
        assert_eq!(replica.digest_hex(), live.digest_hex());
        assert_eq!(
            replica.resolve(a).expect("a").value,
            live.resolve(a).expect("a").value
        );
        assert_eq!(replica.resolve(a).expect("a").value, 3);
    }

    #[test]
    fn replay_rejects_records_for_other_ticks() {
        let mut session = counter_session(&SessionConfig::default());
        let records = vec![TickRecord {
            tick_id: 3,
            commands: Vec::new(),
        }];
        let error = session.replay(&records).expect_err("wrong tick");
        assert!(matches!(
            error,
            SessionError::CommandLog(CommandLogError::UnknownTick {
                requested: 3,
                current: 0
            })
        ));
        assert_eq!(session.committed_ticks(), 0);
    }

    fn secret() -> WireObject {
        WireObject::new("Secret").with_field("x", 1i64)
    }

    #[test]
    fn unencodable_payload_is_refused_when_queued() {
        let mut session = counter_session(&SessionConfig {
            tick_rate: 10.0,
            ..SessionConfig::default()
        });
        let unit = session.spawn(Counter::default());

        let error = session.queue(unit, "add", secret()).expect_err("unregistered type");
        assert!(matches!(
            error,
            SessionError::Codec(CodecError::UnregisteredType { .. })
        ));
        assert!(session
            .queue_at(3, Command::new(unit, "add", secret()))
            .is_err());
        assert!(session.pending_commands().is_empty());

        session.queue(unit, "add", 4).expect("queue");
        let reports = session.advance(0.3).expect("advance");
        assert_eq!(reports.len(), 3);
        assert_eq!(session.clock().next_sequence(), session.current_tick_id());
        assert_eq!(session.resolve(unit).expect("unit").value, 4);
    }

    #[test]
    fn unencodable_batch_leaves_tick_open() {
        let mut session = counter_session(&SessionConfig::default());
        let unit = session.spawn(Counter::default());
        session.log.queue(unit, "add", secret());

        let error = session.fire(0).expect_err("unregistered payload type");
        assert!(matches!(
            error,
            SessionError::Codec(CodecError::UnregisteredType { .. })
        ));
        assert_eq!(session.current_tick_id(), 0);
        assert_eq!(session.committed_ticks(), 0);
    }

    #[test]
    fn failed_commit_hands_unfired_ticks_back_to_clock() {
        let mut session = counter_session(&SessionConfig {
            tick_rate: 10.0,
            ..SessionConfig::default()
        });
        let unit = session.spawn(Counter::default());
        session.queue(unit, "add", 1).expect("queue");
        session.types = TypeRegistry::new();

        let error = session.advance(0.3).expect_err("Command type missing");
        match error {
            SessionError::AdvanceInterrupted { committed, source } => {
                assert!(committed.is_empty());
                assert!(matches!(
                    *source,
                    SessionError::Codec(CodecError::UnregisteredType { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.current_tick_id(), 0);
        assert_eq!(session.clock().next_sequence(), 0);
        assert_eq!(session.clock().backlog(), 3);

        session.types = TypeRegistry::with_core_types();
        let reports = session.advance(0.0).expect("owed ticks");
        let ids: Vec<u64> = reports.iter().map(|report| report.tick.id).collect();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(session.clock().next_sequence(), session.current_tick_id());
        assert_eq!(session.resolve(unit).expect("unit").value, 1);
    }

    #[test]
    fn unencodable_follow_ups_are_dropped() {
        let mut session = counter_session(&SessionConfig {
            tick_rate: 10.0,
            ..SessionConfig::default()
        });
        session.register_handler("leak", |_counter: &mut Counter, command, context| {
            context.queue(Command::new(command.target, "add", secret()));
            context.queue(Command::new(command.target, "add", 2));
            Ok(())
        });
        let unit = session.spawn(Counter::default());
        session.queue(unit, "leak", WireValue::Null).expect("queue");

        let reports = session.advance(0.2).expect("advance");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].executed, 1);
        assert!(reports[1].failures.is_empty());
        assert_eq!(session.resolve(unit).expect("unit").value, 2);
    }

    #[test]
    fn queue_at_future_tick_executes_when_reached() {
        let mut session = counter_session(&SessionConfig {
            tick_rate: 1.0,
            max_ticks_per_advance: Some(2),
            ..SessionConfig::default()
        });
        let unit = session.spawn(Counter::default());
        session
            .queue_at(2, Command::new(unit, "add", 7))
            .expect("schedule");

        assert_eq!(session.advance(5.0).expect("advance").len(), 2);
        assert_eq!(session.resolve(unit).expect("unit").value, 0);
        assert_eq!(session.advance(0.0).expect("drain").len(), 2);
        assert_eq!(session.resolve(unit).expect("unit").value, 7);
        assert_eq!(session.clock().backlog(), 1);
    }
}
