//! PCG32 (XSH-RR variant, 64-bit state, 32-bit output).
//!
//! Both peers seed one of these from the handshake's shared seed and then draw
//! from it in lockstep, so the output must be identical on every platform. That
//! rules out anything that depends on `usize` width or floating point.
//!
//! Reference: <https://www.pcg-random.org/>
//!
//! ```
//! use rollback_link::rng::{Pcg32, Rng};
//!
//! let mut a = Pcg32::new(42, 54);
//! let mut b = Pcg32::new(42, 54);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG32 generator. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Seeds from 16 bytes: the first eight are the state, the next eight the stream,
    /// both little-endian.
    #[must_use]
    pub fn from_seed(seed: &[u8; 16]) -> Self {
        let mut state = [0u8; 8];
        let mut stream = [0u8; 8];
        state.copy_from_slice(&seed[..8]);
        stream.copy_from_slice(&seed[8..]);
        Self::new(u64::from_le_bytes(state), u64::from_le_bytes(stream))
    }
}

/// Random number generation on top of a 32-bit source.
pub trait Rng {
    /// Returns the next 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// Returns the next 64-bit value, high half drawn first.
    fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }

    /// Returns a value in `[range.start, range.end)` by rejection sampling.
    ///
    /// An empty range is reported as a violation and yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return range.start.wrapping_add(value % span);
            }
        }
    }

    /// Returns `true` or `false` with equal probability.
    fn gen_bool(&mut self) -> bool {
        self.gen_range(0..2) == 1
    }

    /// Fills `dest` with random bytes, four at a time, little-endian.
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(4);
        for chunk in chunks.by_ref() {
            chunk.copy_from_slice(&self.next_u32().to_le_bytes());
        }
        let remainder = chunks.into_remainder();
        if !remainder.is_empty() {
            let bytes = self.next_u32().to_le_bytes();
            if let Some(head) = bytes.get(..remainder.len()) {
                remainder.copy_from_slice(head);
            }
        }
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::{Pcg32, Rng};
    use proptest::prelude::*;

    #[test]
    fn matches_reference_output() {
        // First outputs of the reference pcg32 demo (seed 42, stream 54).
        let mut rng = Pcg32::new(42, 54);
        let expected = [
            0xa15c02b7, 0x7b47f409, 0xba1d3330, 0x83d2f293, 0xbfa4784b, 0xcbed606e,
        ];
        for value in expected {
            assert_eq!(rng.next_u32(), value);
        }
    }

    #[test]
    fn from_seed_splits_state_and_stream() {
        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&42u64.to_le_bytes());
        seed[8..].copy_from_slice(&54u64.to_le_bytes());
        assert_eq!(Pcg32::from_seed(&seed), Pcg32::new(42, 54));
    }

    #[test]
    fn empty_range_returns_start() {
        let mut rng = Pcg32::new(1, 1);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    #[test]
    fn fill_bytes_handles_partial_words() {
        let mut a = Pcg32::new(7, 3);
        let mut b = a.clone();
        let mut buf = [0u8; 7];
        a.fill_bytes(&mut buf);
        assert_eq!(&buf[..4], &b.next_u32().to_le_bytes());
        assert_eq!(&buf[4..], &b.next_u32().to_le_bytes()[..3]);
    }

    proptest! {
        #[test]
        fn gen_range_stays_in_bounds(state: u64, stream: u64, start in 0u32..1000, len in 1u32..1000) {
            let mut rng = Pcg32::new(state, stream);
            for _ in 0..16 {
                let value = rng.gen_range(start..start + len);
                prop_assert!(value >= start && value < start + len);
            }
        }

        #[test]
        fn same_seed_same_sequence(state: u64, stream: u64) {
            let mut a = Pcg32::new(state, stream);
            let mut b = Pcg32::new(state, stream);
            for _ in 0..32 {
                prop_assert_eq!(a.next_u32(), b.next_u32());
            }
        }
    }
}
