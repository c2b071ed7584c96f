//! Deterministic pseudo-random number generator.
//!
//! A simple xorshift64 PRNG with no external dependencies. Used to randomize
//! steal-victim selection so that idle workers do not all converge on the
//! same queue; given the same seed the sequence is identical, which keeps
//! scheduler tests reproducible.

/// A deterministic pseudo-random number generator using xorshift64.
///
/// Intentionally simple and fast. NOT cryptographically secure.
#[derive(Debug, Clone)]
pub struct DetRng {
    state: u64,
}

impl DetRng {
    /// Creates a new PRNG with the given seed.
    ///
    /// The seed must be non-zero. If zero is provided, it is replaced with 1.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generates the next pseudo-random u64 value.
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generates a pseudo-random usize value in the range `[0, bound)`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is zero.
    pub fn next_usize(&mut self, bound: usize) -> usize {
        assert!(bound > 0, "bound must be non-zero");
        (self.next_u64() as usize) % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_sequence() {
        let mut rng1 = DetRng::new(42);
        let mut rng2 = DetRng::new(42);
        for _ in 0..32 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn zero_seed_is_replaced() {
        let mut rng = DetRng::new(0);
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn bounded_values_stay_in_range() {
        let mut rng = DetRng::new(7);
        for _ in 0..100 {
            assert!(rng.next_usize(5) < 5);
        }
    }
}
