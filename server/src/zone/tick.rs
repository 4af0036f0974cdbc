//! Fixed-timestep accumulator.

use log::warn;
use std::time::Duration;

/// How many ticks to run for the time that has passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickBudget {
    pub run: u32,
    /// Ticks owed but skipped because the backlog passed the ceiling.
    pub dropped: u32,
}

#[derive(Debug)]
pub struct FixedTimestep {
    step: Duration,
    accumulated: Duration,
    max_catchup: u32,
    dropped_total: u64,
}

impl FixedTimestep {
    pub fn new(step: Duration, max_catchup: u32) -> Self {
        Self {
            step,
            accumulated: Duration::ZERO,
            max_catchup: max_catchup.max(1),
            dropped_total: 0,
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Adds wall time and returns the ticks it pays for.
    ///
    /// A backlog deeper than the catch-up ceiling is discarded rather than
    /// simulated, so a stalled zone recovers instead of spiralling.
    pub fn accumulate(&mut self, elapsed: Duration) -> TickBudget {
        if self.step.is_zero() {
            return TickBudget::default();
        }
        self.accumulated += elapsed;
        let owed = (self.accumulated.as_nanos() / self.step.as_nanos()) as u64;
        let run = owed.min(self.max_catchup as u64) as u32;
        let dropped = owed - run as u64;

        self.accumulated -= self.step * run;
        if dropped > 0 {
            // Keep the fractional remainder, forget the whole ticks.
            self.accumulated = Duration::from_nanos(
                (self.accumulated.as_nanos() % self.step.as_nanos()) as u64,
            );
            self.dropped_total += dropped;
            warn!(
                "Tick overrun: {} ticks behind, running {} and dropping {}",
                owed, run, dropped
            );
        }
        TickBudget {
            run,
            dropped: dropped.min(u32::MAX as u64) as u32,
        }
    }
}
