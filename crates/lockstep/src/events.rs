use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::callbacks::{Callback, CallbackRegistry};
use crate::entity::EntityId;

pub const COMMAND_EXECUTED: &str = "command_executed";
pub const COMMAND_FAILED: &str = "command_failed";
pub const TICK_COMMITTED: &str = "tick_committed";
pub const ENTITY_ALLOCATED: &str = "entity_allocated";
pub const ENTITY_RELEASED: &str = "entity_released";

pub const CORE_MESSAGE_TYPES: &[&str] = &[
    COMMAND_EXECUTED,
    COMMAND_FAILED,
    TICK_COMMITTED,
    ENTITY_ALLOCATED,
    ENTITY_RELEASED,
];

/// Notifications the core publishes about tick commits and entity lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    CommandExecuted {
        tick: u64,
        index: usize,
        target: EntityId,
        opcode: String,
    },
    CommandFailed {
        tick: u64,
        index: usize,
        target: EntityId,
        opcode: String,
        reason: String,
    },
    TickCommitted {
        tick: u64,
        executed: usize,
        failed: usize,
    },
    EntityAllocated {
        id: EntityId,
    },
    EntityReleased {
        id: EntityId,
    },
}

impl CoreEvent {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CommandExecuted { .. } => COMMAND_EXECUTED,
            Self::CommandFailed { .. } => COMMAND_FAILED,
            Self::TickCommitted { .. } => TICK_COMMITTED,
            Self::EntityAllocated { .. } => ENTITY_ALLOCATED,
            Self::EntityReleased { .. } => ENTITY_RELEASED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("callback is already subscribed to {0:?}")]
    DuplicateSubscription(String),
    #[error("callback is not subscribed to {0:?}")]
    NotSubscribed(String),
}

/// Publish/subscribe over a vocabulary fixed at construction.
///
/// `subscribe` is strict so typos surface early; `broadcast` to a type
/// outside the vocabulary is silently ignored.
#[derive(Debug)]
pub struct EventBus<A> {
    known: BTreeSet<String>,
    subscriptions: BTreeMap<String, CallbackRegistry<A>>,
}

impl<A> EventBus<A> {
    pub fn new<I, S>(message_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: message_types.into_iter().map(Into::into).collect(),
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn is_known(&self, message_type: &str) -> bool {
        self.known.contains(message_type)
    }

    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    pub fn subscribe(
        &mut self,
        message_type: &str,
        callback: Callback<A>,
    ) -> Result<(), EventBusError> {
        if !self.is_known(message_type) {
            return Err(EventBusError::UnknownMessageType(message_type.to_string()));
        }
        let registry = self
            .subscriptions
            .entry(message_type.to_string())
            .or_default();
        if !registry.add(callback) {
            return Err(EventBusError::DuplicateSubscription(
                message_type.to_string(),
            ));
        }
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        message_type: &str,
        callback: &Callback<A>,
    ) -> Result<(), EventBusError> {
        if self.discard(message_type, callback) {
            Ok(())
        } else {
            Err(EventBusError::NotSubscribed(message_type.to_string()))
        }
    }

    /// Non-failing `unsubscribe`; returns whether anything was removed.
    pub fn discard(&mut self, message_type: &str, callback: &Callback<A>) -> bool {
        self.subscriptions
            .get_mut(message_type)
            .is_some_and(|registry| registry.remove(callback))
    }

    pub fn subscriber_count(&self, message_type: &str) -> usize {
        self.subscriptions
            .get(message_type)
            .map_or(0, CallbackRegistry::len)
    }

    /// Returns how many subscribers ran.
    pub fn broadcast(&mut self, message_type: &str, args: &A) -> usize {
        match self.subscriptions.get_mut(message_type) {
            Some(registry) => registry.invoke_all(args),
            None => 0,
        }
    }
}

impl EventBus<CoreEvent> {
    pub fn with_core_types() -> Self {
        Self::new(CORE_MESSAGE_TYPES.iter().copied())
    }

    pub fn publish(&mut self, event: &CoreEvent) -> usize {
        self.broadcast(event.message_type(), event)
    }
}
