// src/clock.rs
//
// Monotonic microsecond clock. Every timing rule in the state machine and the
// dispatch log compares values from one injected clock, so tests can drive
// time by hand instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic timestamp in microseconds since the clock's origin.
pub type Micros = u64;

pub const MICROS_PER_MS: u64 = 1_000;

pub trait Clock: Send + Sync {
    fn now_micros(&self) -> Micros;
}

/// Wall-independent clock backed by `Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> Micros {
        self.origin.elapsed().as_micros() as Micros
    }
}

/// Hand-driven clock for tests and offline replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Micros) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, micros: Micros) {
        self.now.store(micros, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * MICROS_PER_MS, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn ms_to_micros(ms: u64) -> Micros {
    ms.saturating_mul(MICROS_PER_MS)
}
