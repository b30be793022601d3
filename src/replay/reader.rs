use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use super::{
    RecordHeader, SectionHeader, RECORD_HEADER_LEN, REPLAY_MAGIC, REPLAY_VERSION,
    SECTION_HEADER_LEN, TURN_FLAG_P1, TURN_FLAG_P2, ZSTD_MAGIC,
};
use crate::error::{bad_player_index, LinkError};
use crate::input::{Input, InputPair, TurnData, TURN_DATA_LEN};
use crate::network::codec::{self, CodecError, CodecOperation};
use crate::telemetry::{
    TracingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{PlayerIndex, Tick};

/// A fully read replay.
///
/// Remote ticks are not recorded; both halves of every pair carry the record's
/// tick as their `local_tick` and [`Tick::ZERO`] as their `remote_tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    /// The seat of the peer that recorded the replay.
    pub local_player: PlayerIndex,
    /// Snapshot the battle started from.
    pub state: Vec<u8>,
    /// Init blobs, indexed by player.
    pub init: [Vec<u8>; 2],
    /// Every confirmed pair, in tick order.
    pub input_pairs: Vec<InputPair>,
    /// Game RNG state recorded alongside each pair.
    pub rng_states: Vec<u32>,
    /// Whether the record stream ended mid-record.
    pub truncated: bool,
}

enum Fill {
    Complete,
    Empty,
    Partial,
}

impl Replay {
    /// Reads an uncompressed replay.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidReplay`] for a bad magic or version, a truncated header
    /// or init section, a bad or repeated player index, or unknown turn-flag bits.
    /// A record stream that stops partway through a record is not an error.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, LinkError> {
        let mut magic = [0u8; 5];
        read_section_bytes(&mut reader, &mut magic, "header")?;
        if magic[..4] != REPLAY_MAGIC {
            return Err(LinkError::invalid_replay("bad magic"));
        }
        if magic[4] != REPLAY_VERSION {
            return Err(LinkError::invalid_replay(format!(
                "unsupported replay version: {:02x} vs {:02x}",
                magic[4], REPLAY_VERSION
            )));
        }

        let (local_player, state) = read_section(&mut reader, "state")?;

        let mut init: [Option<Vec<u8>>; 2] = [None, None];
        for _ in 0..2 {
            let (player, marshaled) = read_section(&mut reader, "init")?;
            let slot = &mut init[player.as_usize()];
            if slot.is_some() {
                return Err(bad_player_index(player.as_u8()));
            }
            *slot = Some(marshaled);
        }
        let [Some(p1_init), Some(p2_init)] = init else {
            return Err(LinkError::invalid_replay("missing init"));
        };

        let mut input_pairs = Vec::new();
        let mut rng_states = Vec::new();
        let truncated = loop {
            match read_record(&mut reader)? {
                Record::Complete(rng_state, pair) => {
                    rng_states.push(rng_state);
                    input_pairs.push(pair);
                },
                Record::End => break false,
                Record::Truncated => break true,
            }
        };
        if truncated {
            let violation = Violation::new(
                ViolationSeverity::Warning,
                ViolationKind::Replay,
                "replay ends inside a record, keeping the complete ones",
                concat!(file!(), ":", line!()),
            )
            .with_context("records", input_pairs.len().to_string());
            TracingObserver.on_violation(&violation);
        }

        Ok(Self {
            local_player,
            state,
            init: [p1_init, p2_init],
            input_pairs,
            rng_states,
            truncated,
        })
    }

    /// Reads a zstd-compressed replay.
    pub fn read_compressed<R: BufRead>(reader: R) -> Result<Self, LinkError> {
        let decoder = zstd::Decoder::with_buffer(reader)
            .map_err(|err| LinkError::io("starting replay decompression", &err))?;
        Self::read(decoder)
    }

    /// Reads a replay file, detecting compression from its first bytes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| LinkError::io(&format!("opening {}", path.display()), &err))?;
        let mut reader = BufReader::new(file);
        let compressed = reader
            .fill_buf()
            .map_err(|err| LinkError::io("reading replay", &err))?
            .starts_with(&ZSTD_MAGIC);
        if compressed {
            Self::read_compressed(reader)
        } else {
            Self::read(reader)
        }
    }

    /// The recording peer's opponent.
    #[must_use]
    pub const fn remote_player(&self) -> PlayerIndex {
        self.local_player.opponent()
    }
}

enum Record {
    Complete(u32, InputPair),
    End,
    Truncated,
}

fn read_record<R: Read>(reader: &mut R) -> Result<Record, LinkError> {
    let mut header_bytes = [0u8; RECORD_HEADER_LEN];
    match fill(reader, &mut header_bytes)? {
        Fill::Complete => {},
        Fill::Empty => return Ok(Record::End),
        Fill::Partial => return Ok(Record::Truncated),
    }
    let header: RecordHeader = codec::decode_value(&header_bytes).map_err(|err| {
        CodecError::decode(err.to_string(), CodecOperation::DecodeRecord)
    })?;

    if header.turn_flags & !(TURN_FLAG_P1 | TURN_FLAG_P2) != 0 {
        return Err(LinkError::invalid_replay(format!(
            "unknown turn flags {:#04x}",
            header.turn_flags
        )));
    }

    let tick = Tick::new(header.tick);
    let mut p1 = Input::new(tick, Tick::ZERO, header.p1_joyflags, header.p1_aux_state);
    let mut p2 = Input::new(tick, Tick::ZERO, header.p2_joyflags, header.p2_aux_state);
    for (flag, input) in [(TURN_FLAG_P1, &mut p1), (TURN_FLAG_P2, &mut p2)] {
        if header.turn_flags & flag == 0 {
            continue;
        }
        let mut turn = [0u8; TURN_DATA_LEN];
        match fill(reader, &mut turn)? {
            Fill::Complete => input.turn = Some(TurnData::new(turn)),
            Fill::Empty | Fill::Partial => return Ok(Record::Truncated),
        }
    }
    Ok(Record::Complete(header.rng_state, InputPair::new(p1, p2)))
}

fn read_section<R: Read>(reader: &mut R, what: &str) -> Result<(PlayerIndex, Vec<u8>), LinkError> {
    let mut header_bytes = [0u8; SECTION_HEADER_LEN];
    read_section_bytes(reader, &mut header_bytes, what)?;
    let header: SectionHeader = codec::decode_value(&header_bytes).map_err(|err| {
        CodecError::decode(err.to_string(), CodecOperation::DecodeRecord)
    })?;
    let player = PlayerIndex::new(header.player).ok_or_else(|| bad_player_index(header.player))?;

    let mut bytes = Vec::new();
    reader
        .take(u64::from(header.len))
        .read_to_end(&mut bytes)
        .map_err(|err| LinkError::io("reading replay", &err))?;
    if bytes.len() != header.len as usize {
        return Err(LinkError::invalid_replay(format!("truncated {}", what)));
    }
    Ok((player, bytes))
}

fn read_section_bytes<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), LinkError> {
    match fill(reader, buf)? {
        Fill::Complete => Ok(()),
        Fill::Empty | Fill::Partial => {
            Err(LinkError::invalid_replay(format!("truncated {}", what)))
        },
    }
}

/// Reads until `buf` is full or the stream ends.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<Fill, LinkError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
            // A compressed stream cut mid-frame reports the cut this way.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(LinkError::io("reading replay", &err)),
        }
    }
    Ok(match read {
        0 => Fill::Empty,
        n if n == buf.len() => Fill::Complete,
        _ => Fill::Partial,
    })
}
