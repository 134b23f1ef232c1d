use rand::{Rng, SeedableRng};

/// Injectable randomness source
///
/// Endpoint selection takes its random source as an explicit argument so the
/// weighted pick is deterministic given a seeded implementation. Never reach
/// for a hidden process-global generator in selection code.
pub trait RandomSource: Send {
    /// Draw a value uniformly from `[0, upper)`. `upper` must be > 0.
    fn next_below(&mut self, upper: u64) -> u64;
}

/// Random source backed by the thread-local OS-seeded generator
#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_below(&mut self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Deterministic random source for tests and reproducible runs
#[derive(Debug)]
pub struct SeededRandom(rand::rngs::StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(rand::rngs::StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn next_below(&mut self, upper: u64) -> u64 {
        self.0.gen_range(0..upper)
    }
}
