//! Simulated environment: virtual clock and seeded randomness.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ensemble_core::env::Environment;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

struct Clock {
    epoch: Instant,
    elapsed: Duration,
}

/// Deterministic [`Environment`].
///
/// Clones share the clock and the RNG stream, so every component of one
/// simulation draws from the same seeded sequence.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    clock: Arc<Mutex<Clock>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        tracing::debug!(seed, "simulation environment");
        Self {
            seed,
            clock: Arc::new(Mutex::new(Clock { epoch: Instant::now(), elapsed: Duration::ZERO })),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Seed this environment was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.lock().elapsed += duration;
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        self.clock.lock().elapsed
    }

    /// Bernoulli draw from the shared stream, used for fault injection.
    pub fn chance(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        let draw = self.rng.lock().next_u64();
        #[allow(clippy::cast_precision_loss)]
        let unit = draw as f64 / u64::MAX as f64;
        unit < probability
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        let clock = self.clock.lock();
        clock.epoch + clock.elapsed
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().fill_bytes(buffer);
    }
}
