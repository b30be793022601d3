//! Fuzz target for the replay reader.
//!
//! Inputs are prefixed with a valid magic and version about half the time so
//! the fuzzer gets past the header check quickly.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary or truncated replays
//! - Every read pair is tick-aligned and has an RNG state

#![no_main]

use libfuzzer_sys::fuzz_target;
use rollback_link::replay::{REPLAY_MAGIC, REPLAY_VERSION};
use rollback_link::Replay;

fuzz_target!(|data: &[u8]| {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    if data.first().is_some_and(|b| b & 1 == 1) {
        bytes.extend_from_slice(&REPLAY_MAGIC);
        bytes.push(REPLAY_VERSION);
    }
    bytes.extend_from_slice(data);

    if let Ok(replay) = Replay::read(bytes.as_slice()) {
        assert_eq!(replay.input_pairs.len(), replay.rng_states.len());
        for pair in &replay.input_pairs {
            assert!(pair.check_aligned().is_ok());
        }
    }
});
