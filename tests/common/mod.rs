//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a deterministic stub simulation, its CPU and memory layout
//! - helpers for building inputs, pairs and ready-to-record replay writers
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::stubs::{StubLayout, StubSimulation};
//! use common::{pair, ready_replay};
//! ```

pub mod stubs;

use rollback_link::{Input, InputPair, PlayerIndex, ReplayWriter, Tick};

/// Size of the init blobs written by [`ready_replay`].
#[allow(dead_code)]
pub const INIT_LEN: usize = 0x100;

/// An input for `tick` with the given joypad flags and no aux state.
#[allow(dead_code)]
#[must_use]
pub fn input(tick: u32, joyflags: u16) -> Input {
    Input::new(Tick::new(tick), Tick::ZERO, joyflags, 0)
}

/// A pair for `tick` with player 1 and player 2 flags.
#[allow(dead_code)]
#[must_use]
pub fn pair(tick: u32, p1: u16, p2: u16) -> InputPair {
    InputPair::new(input(tick, p1), input(tick, p2))
}

/// `count` pairs starting at `first`, with flags that differ per tick.
#[allow(dead_code)]
#[must_use]
pub fn pairs(first: u32, count: u32) -> Vec<InputPair> {
    (first..first + count)
        .map(|tick| pair(tick, 0xfc00 | (tick as u16 & 0xff), 0xfc00 | ((tick as u16 * 7) & 0xff)))
        .collect()
}

/// An in-memory replay writer past its header, ready for input records.
#[allow(dead_code)]
#[must_use]
pub fn ready_replay(local_player: PlayerIndex) -> ReplayWriter<Vec<u8>> {
    let mut writer = ReplayWriter::new(Vec::new()).unwrap();
    writer.write_state(local_player, b"checkpoint").unwrap();
    writer.write_init(PlayerIndex::P1, &[0x11; INIT_LEN]).unwrap();
    writer.write_init(PlayerIndex::P2, &[0x22; INIT_LEN]).unwrap();
    writer
}

/// Installs a `tracing` subscriber that writes through the test harness.
/// Safe to call from every test.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
