//! The linear-congruential generator backing the `Rand` instruction
//! (§4.6). Deliberately not the `rand` crate: the sequence is part of
//! the instruction's specified semantics, not an implementation
//! detail, so a script that seeds and reads it must see the same
//! numbers this runtime produces.

use std::time::{SystemTime, UNIX_EPOCH};

const MULTIPLIER: u32 = 25173;
const INCREMENT: u32 = 13849;

/// `prev = 25173*prev + 13849; dst = prev mod (range+1)`.
#[derive(Clone, Copy, Debug)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    pub fn seeded(seed: u32) -> Lcg {
        Lcg { state: seed }
    }

    /// Seeds from the system clock, matching the reference runtime's
    /// "seeded at VM start from system time."
    pub fn from_system_time() -> Lcg {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(0);
        Lcg::seeded(seed)
    }

    /// Advances the generator and returns a value in `[0, range]`. A
    /// negative or zero `range` yields `0` rather than panicking on
    /// the modulus.
    pub fn next_in_range(&mut self, range: i32) -> i32 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        if range <= 0 {
            return 0;
        }
        (self.state % (range as u32 + 1)) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_deterministic_given_a_seed() {
        let mut a = Lcg::seeded(1);
        let mut b = Lcg::seeded(1);
        for _ in 0..10 {
            assert_eq!(a.next_in_range(100), b.next_in_range(100));
        }
    }

    #[test]
    fn stays_within_requested_range() {
        let mut rng = Lcg::seeded(42);
        for _ in 0..1000 {
            let value = rng.next_in_range(9);
            assert!((0..=9).contains(&value));
        }
    }

    #[test]
    fn matches_the_reference_recurrence() {
        let mut rng = Lcg::seeded(7);
        let expected = 7u32.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        rng.next_in_range(i32::MAX);
        assert_eq!(rng.state, expected);
    }
}
