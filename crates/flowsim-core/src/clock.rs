//! Virtual clock for discrete-event simulation.
//!
//! The [`SimClock`] tracks simulation time independently of wall-clock time,
//! advancing only when events are processed.

use serde::{Deserialize, Serialize};

/// Convert seconds to whole microseconds, rounding to nearest.
pub fn secs_to_us(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1e6).round() as u64
}

/// Convert microseconds to seconds.
pub fn us_to_secs(us: u64) -> f64 {
    us as f64 / 1e6
}

/// Virtual simulation clock with microsecond resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    current_us: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self { current_us: 0 }
    }

    /// Create a clock starting at `us`.
    pub fn starting_at_us(us: u64) -> Self {
        Self { current_us: us }
    }

    pub fn now_us(&self) -> u64 {
        self.current_us
    }

    pub fn now_secs(&self) -> f64 {
        us_to_secs(self.current_us)
    }

    /// Advance the clock to `us`.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `us` is in the past.
    pub fn advance_to_us(&mut self, us: u64) {
        debug_assert!(
            us >= self.current_us,
            "Cannot move clock backwards: current={}us, target={}us",
            self.current_us,
            us,
        );
        self.current_us = us;
    }
}
