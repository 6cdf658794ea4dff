//! Deterministic environment for simulation.
//!
//! Randomness comes from a seeded ChaCha stream so correlation ids repeat
//! across runs. The wall clock is manual: it only moves when a test moves
//! it. Sleeps go through tokio so `start_paused` tests control timers.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Wall clock a fresh [`SimEnv`] starts at (2024-01-01T00:00:00Z).
pub const DEFAULT_START_MS: u64 = 1_704_067_200_000;

/// Seeded, manually clocked [`Environment`].
///
/// Clones share the clock and the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    clock_ms: Arc<AtomicU64>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Seed 0, clock at [`DEFAULT_START_MS`].
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            clock_ms: Arc::new(AtomicU64::new(DEFAULT_START_MS)),
        }
    }

    /// Move the wall clock forward.
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.clock_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the wall clock.
    pub fn set_wall_clock_ms(&self, ms: u64) {
        self.clock_ms.store(ms, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    fn wall_clock_ms(&self) -> u64 {
        self.clock_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
