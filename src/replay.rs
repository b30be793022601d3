//! Append-only replay log of a battle and its reader.
//!
//! A replay is everything needed to re-simulate a battle offline: the starting
//! snapshot, both players' init blobs, and every confirmed input pair in tick
//! order.
//!
//! ```text
//! header:  b"TOOT", u8 version, u8 local player, u32 state length, state
//! init x2: u8 player, u32 length, bytes
//! records: u32 tick, u32 rng state,
//!          u16 p1 joyflags, u8 p1 aux, u16 p2 joyflags, u8 p2 aux,
//!          u8 turn flags (bit 0 = p1, bit 1 = p2),
//!          then 0x100 bytes per flagged turn
//! ```
//!
//! All integers are little-endian. The writer flushes after every section and
//! record, so a crash loses at most the record being written; the reader keeps
//! every complete record of a truncated file.

mod player;
mod reader;
mod writer;

pub use player::Replayer;
pub use reader::Replay;
pub use writer::{FileReplayWriter, ReplayWriter};

use serde::{Deserialize, Serialize};

/// File magic.
pub const REPLAY_MAGIC: [u8; 4] = *b"TOOT";

/// Format version written after the magic.
pub const REPLAY_VERSION: u8 = 0x04;

/// Extension of replay files created by a session.
pub const REPLAY_EXTENSION: &str = "tangoreplay";

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const TURN_FLAG_P1: u8 = 0b01;
const TURN_FLAG_P2: u8 = 0b10;

/// Fixed part of an input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RecordHeader {
    tick: u32,
    rng_state: u32,
    p1_joyflags: u16,
    p1_aux_state: u8,
    p2_joyflags: u16,
    p2_aux_state: u8,
    turn_flags: u8,
}

const RECORD_HEADER_LEN: usize = 15;

/// Length-prefixed section header shared by the state and init sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SectionHeader {
    player: u8,
    len: u32,
}

const SECTION_HEADER_LEN: usize = 5;
