//! Listener references that never keep their receivers alive.
//!
//! A [`Callback`] pairs a plain function with an [`Observer`] of its
//! receiver. Liveness is checked on every invocation, not at bind time;
//! batch invocation through [`CallbackRegistry`] skips and prunes entries
//! whose receiver is gone.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("callback receiver has been dropped")]
    DeadReference,
    #[error("callback receiver is already borrowed")]
    Busy,
}

/// Weak handle to a shared receiver.
#[derive(Debug)]
pub struct Observer<R> {
    target: Weak<RefCell<R>>,
}

impl<R> Observer<R> {
    pub fn new(target: &Rc<RefCell<R>>) -> Self {
        Self {
            target: Rc::downgrade(target),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    pub fn resolve(&self) -> Option<Rc<RefCell<R>>> {
        self.target.upgrade()
    }

    fn address(&self) -> usize {
        self.target.as_ptr() as *const () as usize
    }
}

impl<R> Clone for Observer<R> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
        }
    }
}

trait Target<A> {
    fn is_alive(&self) -> bool;
    fn receiver_address(&self) -> Option<usize>;
    fn function_address(&self) -> usize;
    fn call(&self, args: &A) -> Result<(), CallbackError>;
}

struct BoundMethod<R, A> {
    observer: Observer<R>,
    method: fn(&mut R, &A),
}

impl<R, A> Target<A> for BoundMethod<R, A> {
    fn is_alive(&self) -> bool {
        self.observer.is_alive()
    }

    fn receiver_address(&self) -> Option<usize> {
        Some(self.observer.address())
    }

    fn function_address(&self) -> usize {
        self.method as usize
    }

    fn call(&self, args: &A) -> Result<(), CallbackError> {
        let receiver = self.observer.resolve().ok_or(CallbackError::DeadReference)?;
        let mut guard = receiver.try_borrow_mut().map_err(|_| CallbackError::Busy)?;
        (self.method)(&mut *guard, args);
        Ok(())
    }
}

struct BoundMethodWith<R, C, A> {
    observer: Observer<R>,
    method: fn(&mut R, &C, &A),
    captured: C,
}

impl<R, C, A> Target<A> for BoundMethodWith<R, C, A> {
    fn is_alive(&self) -> bool {
        self.observer.is_alive()
    }

    fn receiver_address(&self) -> Option<usize> {
        Some(self.observer.address())
    }

    fn function_address(&self) -> usize {
        self.method as usize
    }

    fn call(&self, args: &A) -> Result<(), CallbackError> {
        let receiver = self.observer.resolve().ok_or(CallbackError::DeadReference)?;
        let mut guard = receiver.try_borrow_mut().map_err(|_| CallbackError::Busy)?;
        (self.method)(&mut *guard, &self.captured, args);
        Ok(())
    }
}

struct FreeFunction<A> {
    function: fn(&A),
}

impl<A> Target<A> for FreeFunction<A> {
    fn is_alive(&self) -> bool {
        true
    }

    fn receiver_address(&self) -> Option<usize> {
        None
    }

    fn function_address(&self) -> usize {
        self.function as usize
    }

    fn call(&self, args: &A) -> Result<(), CallbackError> {
        (self.function)(args);
        Ok(())
    }
}

/// A function plus an optional weakly-held receiver.
///
/// Two callbacks are equal when they wrap the same function and the same
/// receiver (or both have none); captured arguments do not take part.
pub struct Callback<A> {
    target: Rc<dyn Target<A>>,
}

impl<A: 'static> Callback<A> {
    pub fn bind<R: 'static>(receiver: &Rc<RefCell<R>>, method: fn(&mut R, &A)) -> Self {
        Self::observe(Observer::new(receiver), method)
    }

    pub fn observe<R: 'static>(observer: Observer<R>, method: fn(&mut R, &A)) -> Self {
        Self {
            target: Rc::new(BoundMethod { observer, method }),
        }
    }

    pub fn bind_with<R: 'static, C: 'static>(
        receiver: &Rc<RefCell<R>>,
        method: fn(&mut R, &C, &A),
        captured: C,
    ) -> Self {
        Self {
            target: Rc::new(BoundMethodWith {
                observer: Observer::new(receiver),
                method,
                captured,
            }),
        }
    }

    pub fn function(function: fn(&A)) -> Self {
        Self {
            target: Rc::new(FreeFunction { function }),
        }
    }
}

impl<A> Callback<A> {
    pub fn is_alive(&self) -> bool {
        self.target.is_alive()
    }

    /// Calls through if the receiver is still alive; returns whether it ran.
    pub fn invoke(&self, args: &A) -> bool {
        self.target.call(args).is_ok()
    }

    pub fn invoke_strict(&self, args: &A) -> Result<(), CallbackError> {
        self.target.call(args)
    }
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Self {
            target: Rc::clone(&self.target),
        }
    }
}

impl<A> PartialEq for Callback<A> {
    fn eq(&self, other: &Self) -> bool {
        self.target.function_address() == other.target.function_address()
            && self.target.receiver_address() == other.target.receiver_address()
    }
}

impl<A> Eq for Callback<A> {}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("function", &self.target.function_address())
            .field("receiver", &self.target.receiver_address())
            .field("alive", &self.target.is_alive())
            .finish()
    }
}

/// De-duplicated set of callbacks, invoked in registration order.
pub struct CallbackRegistry<A> {
    entries: Vec<Callback<A>>,
}

impl<A> Default for CallbackRegistry<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A> fmt::Debug for CallbackRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.entries).finish()
    }
}

impl<A> CallbackRegistry<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if an equal callback is already registered.
    pub fn add(&mut self, callback: Callback<A>) -> bool {
        if self.contains(&callback) {
            return false;
        }
        self.entries.push(callback);
        true
    }

    pub fn remove(&mut self, callback: &Callback<A>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry != callback);
        self.entries.len() != before
    }

    pub fn contains(&self, callback: &Callback<A>) -> bool {
        self.entries.iter().any(|entry| entry == callback)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invokes every live entry and prunes the dead ones it finds. Returns
    /// how many callbacks ran.
    pub fn invoke_all(&mut self, args: &A) -> usize {
        let mut invoked = 0;
        let mut found_dead = false;
        for entry in &self.entries {
            match entry.invoke_strict(args) {
                Ok(()) => invoked += 1,
                Err(CallbackError::DeadReference) => found_dead = true,
                Err(CallbackError::Busy) => {
                    warn!(callback = ?entry, "callback_skipped_busy_receiver");
                }
            }
        }
        if found_dead {
            self.prune_dead();
        }
        invoked
    }

    pub fn prune_dead(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(Callback::is_alive);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, "dead_callbacks_pruned");
        }
        pruned
    }
}
