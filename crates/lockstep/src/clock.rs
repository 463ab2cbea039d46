use std::ops::Range;

use thiserror::Error;
use tracing::warn;

/// Absorbs float rounding so that e.g. three advances of 0.1 at rate 10
/// still cross three boundaries.
const BOUNDARY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ClockError {
    #[error("tick rate must be finite and positive, got {0}")]
    InvalidRate(f64),
    #[error("elapsed time must be finite and non-negative, got {0}")]
    InvalidElapsed(f64),
}

/// Contiguous run of tick sequence numbers fired by one `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSpan {
    pub first: u64,
    pub count: u64,
}

impl TickSpan {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn sequence(&self) -> Range<u64> {
        self.first..self.first + self.count
    }
}

impl IntoIterator for TickSpan {
    type Item = u64;
    type IntoIter = Range<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.sequence()
    }
}

/// Converts elapsed time into discrete, numbered tick events.
///
/// Progress is kept in tick units rather than time units, so crossing a
/// boundary never depends on subtracting an inexact interval repeatedly.
#[derive(Debug, Clone)]
pub struct TickClock {
    rate: f64,
    progress: f64,
    next_sequence: u64,
    max_ticks_per_advance: Option<u64>,
}

impl TickClock {
    pub fn new(rate: f64) -> Result<Self, ClockError> {
        Ok(Self {
            rate: validate_rate(rate)?,
            progress: 0.0,
            next_sequence: 0,
            max_ticks_per_advance: None,
        })
    }

    /// Bounds how many ticks a single `advance` fires. Boundaries past the
    /// cap are deferred to later calls, never dropped.
    pub fn with_max_ticks_per_advance(mut self, cap: Option<u64>) -> Self {
        self.max_ticks_per_advance = cap.map(|value| value.max(1));
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Time units per tick.
    pub fn interval(&self) -> f64 {
        1.0 / self.rate
    }

    /// Sequence number the next fired tick will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Elapsed time not yet converted into a tick. Can exceed one interval
    /// while a capped backlog is being worked off.
    pub fn unconsumed(&self) -> f64 {
        self.progress / self.rate
    }

    /// Whole ticks already owed but not yet fired because of the cap.
    pub fn backlog(&self) -> u64 {
        whole_ticks(self.progress)
    }

    /// Applies to ticks after the call: the partially elapsed interval is
    /// discarded and the next boundary lies one new interval from now.
    pub fn set_rate(&mut self, rate: f64) -> Result<(), ClockError> {
        self.rate = validate_rate(rate)?;
        self.progress = whole_ticks(self.progress) as f64;
        Ok(())
    }

    pub fn advance(&mut self, elapsed: f64) -> Result<TickSpan, ClockError> {
        if !elapsed.is_finite() || elapsed < 0.0 {
            return Err(ClockError::InvalidElapsed(elapsed));
        }
        let progress = self.progress + elapsed * self.rate;
        if !progress.is_finite() {
            return Err(ClockError::InvalidElapsed(elapsed));
        }
        self.progress = progress;

        let remaining = u64::MAX - self.next_sequence;
        let crossed = whole_ticks(self.progress).min(remaining);
        let count = match self.max_ticks_per_advance {
            Some(cap) if crossed > cap => {
                warn!(
                    crossed,
                    cap,
                    deferred = crossed - cap,
                    "tick_backlog_deferred"
                );
                cap
            }
            _ => crossed,
        };

        self.progress = (self.progress - count as f64).max(0.0);
        if self.progress < BOUNDARY_EPSILON {
            self.progress = 0.0;
        }
        let span = TickSpan {
            first: self.next_sequence,
            count,
        };
        self.next_sequence += count;
        Ok(span)
    }

    /// Hands the last `count` fired sequence numbers back as owed ticks, so
    /// the next `advance` fires them again.
    pub fn defer(&mut self, count: u64) {
        let count = count.min(self.next_sequence);
        self.next_sequence -= count;
        self.progress += count as f64;
    }
}

fn whole_ticks(progress: f64) -> u64 {
    (progress + BOUNDARY_EPSILON).floor() as u64
}

fn validate_rate(rate: f64) -> Result<f64, ClockError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(ClockError::InvalidRate(rate))
    }
}
