//! Deterministic pseudo-random number generator.
//!
//! A simple xorshift64 PRNG with no external dependencies. Scheduling
//! strategies own one of these, seeded from the test configuration, so the
//! same seed always yields the same schedule. The production runtime keeps a
//! single runtime-scoped instance for its nondeterministic-choice surface.

/// A deterministic pseudo-random number generator using xorshift64.
///
/// NOT cryptographically secure; determinism is the only requirement.
#[derive(Debug, Clone)]
pub struct DetRng {
    state: u64,
}

impl DetRng {
    /// Creates a new PRNG with the given seed.
    ///
    /// A zero seed is replaced with 1 (xorshift has a fixed point at zero).
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generates the next pseudo-random u64 value.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generates a pseudo-random usize in `[0, bound)`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_usize(&mut self, bound: usize) -> usize {
        assert!(bound > 0, "bound must be non-zero");
        (self.next_u64() as usize) % bound
    }

    /// Generates a pseudo-random u32 in `[0, bound)`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_bounded_u32(&mut self, bound: u32) -> u32 {
        assert!(bound > 0, "bound must be non-zero");
        (self.next_u64() % u64::from(bound)) as u32
    }

    /// Generates a pseudo-random boolean with probability `1/max` of `true`.
    ///
    /// `max == 2` is a fair coin. This mirrors the choice surface exposed to
    /// state machine actions.
    pub fn next_bool(&mut self, max: u32) -> bool {
        if max <= 1 {
            return true;
        }
        self.next_bounded_u32(max) == 0
    }

    /// Forks an independent stream derived from this one.
    ///
    /// Used to give each iteration of a schedule exploration its own stream
    /// without correlating consecutive iterations.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64() ^ 0x9e37_79b9_7f4a_7c15)
    }
}
