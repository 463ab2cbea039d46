//! Deterministic lockstep core: ticks, per-tick command batches, generation
//! checked entity handles and a canonical byte codec, so that peers fed the
//! same command stream reach the same state.

mod atomic_io;
pub mod callbacks;
pub mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod entity;
pub mod events;
mod hashing;
pub mod session;
pub mod stream;

pub use callbacks::{Callback, CallbackError, CallbackRegistry, Observer};
pub use clock::{ClockError, TickClock, TickSpan};
pub use codec::{
    decode, decode_all, encode, encode_into, BigInt, CodecError, TypeRegistry, TypeSchema,
    WireEncodable, WireObject, WireValue, MAX_DEPTH,
};
pub use command::{
    Command, CommandFailure, CommandLog, CommandLogError, DispatchContext, DispatchError,
    DispatchTable, PeerId, Tick, TickReport, TickState,
};
pub use config::{parse_json, ConfigError, SessionConfig, DEFAULT_TICK_RATE};
pub use entity::{EntityError, EntityId, EntityRegistry};
pub use events::{
    CoreEvent, EventBus, EventBusError, COMMAND_EXECUTED, COMMAND_FAILED, CORE_MESSAGE_TYPES,
    ENTITY_ALLOCATED, ENTITY_RELEASED, TICK_COMMITTED,
};
pub use session::{Session, SessionError};
pub use stream::{
    decode_command_batch, encode_command_batch, read_command_stream, write_command_stream,
    StreamError, TickRecord, STREAM_FORMAT_VERSION,
};
