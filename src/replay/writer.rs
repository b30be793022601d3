use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, trace};

use super::{
    RecordHeader, SectionHeader, REPLAY_MAGIC, REPLAY_VERSION, TURN_FLAG_P1, TURN_FLAG_P2,
};
use crate::error::LinkError;
use crate::input::InputPair;
use crate::network::codec::{self, CodecError, CodecOperation};
use crate::PlayerIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    State,
    Init { written: [bool; 2] },
    Records,
}

/// Writes a replay section by section, flushing after each one.
///
/// Sections must come in file order: [`write_state`](Self::write_state), then
/// [`write_init`](Self::write_init) once per player, then any number of
/// [`write_input`](Self::write_input) calls. Anything else is an
/// [`LinkError::InvalidRequest`].
///
/// ```
/// use rollback_link::{Input, InputPair, PlayerIndex, ReplayWriter, Tick};
///
/// let mut writer = ReplayWriter::new(Vec::new())?;
/// writer.write_state(PlayerIndex::P1, b"snapshot")?;
/// writer.write_init(PlayerIndex::P1, &[1; 0x100])?;
/// writer.write_init(PlayerIndex::P2, &[2; 0x100])?;
/// let input = Input::new(Tick::ZERO, Tick::ZERO, 0xfc00, 0);
/// writer.write_input(0x1234, &InputPair::new(input.clone(), input))?;
/// assert_eq!(writer.records_written(), 1);
/// # Ok::<(), rollback_link::LinkError>(())
/// ```
#[derive(Debug)]
pub struct ReplayWriter<W: Write> {
    inner: W,
    phase: Phase,
    records: u64,
}

/// A replay writer over a file, compressed or not.
pub type FileReplayWriter = ReplayWriter<Box<dyn Write + Send>>;

impl<W: Write> ReplayWriter<W> {
    /// Writes the magic and version to `inner`.
    pub fn new(mut inner: W) -> Result<Self, LinkError> {
        inner
            .write_all(&REPLAY_MAGIC)
            .and_then(|()| inner.write_all(&[REPLAY_VERSION]))
            .and_then(|()| inner.flush())
            .map_err(|err| LinkError::io("writing replay header", &err))?;
        Ok(Self {
            inner,
            phase: Phase::State,
            records: 0,
        })
    }

    /// Writes the local player index and the battle's starting snapshot.
    pub fn write_state(&mut self, local_player: PlayerIndex, state: &[u8]) -> Result<(), LinkError> {
        if self.phase != Phase::State {
            return Err(LinkError::invalid_request("replay state already written"));
        }
        self.write_section(local_player, state)?;
        self.phase = Phase::Init {
            written: [false; 2],
        };
        debug!(%local_player, len = state.len(), "replay state written");
        Ok(())
    }

    /// Writes one player's init blob. Each player must be written exactly once.
    pub fn write_init(&mut self, player: PlayerIndex, marshaled: &[u8]) -> Result<(), LinkError> {
        let mut written = match self.phase {
            Phase::Init { written } => written,
            Phase::State => {
                return Err(LinkError::invalid_request(
                    "replay init written before state",
                ))
            },
            Phase::Records => {
                return Err(LinkError::invalid_request("both replay inits already written"))
            },
        };
        if written[player.as_usize()] {
            return Err(LinkError::invalid_request(format!(
                "replay init for {} already written",
                player
            )));
        }
        self.write_section(player, marshaled)?;
        written[player.as_usize()] = true;
        self.phase = if written == [true; 2] {
            Phase::Records
        } else {
            Phase::Init { written }
        };
        Ok(())
    }

    /// Appends one confirmed input pair and the game RNG state at its tick.
    pub fn write_input(&mut self, rng_state: u32, pair: &InputPair) -> Result<(), LinkError> {
        if self.phase != Phase::Records {
            return Err(LinkError::invalid_request(
                "replay inputs written before both inits",
            ));
        }
        let tick = pair.check_aligned()?;
        let (p1, p2) = (pair.p1(), pair.p2());

        let mut turn_flags = 0;
        if p1.turn.is_some() {
            turn_flags |= TURN_FLAG_P1;
        }
        if p2.turn.is_some() {
            turn_flags |= TURN_FLAG_P2;
        }

        let header = RecordHeader {
            tick: tick.as_u32(),
            rng_state,
            p1_joyflags: p1.joyflags,
            p1_aux_state: p1.aux_state,
            p2_joyflags: p2.joyflags,
            p2_aux_state: p2.aux_state,
            turn_flags,
        };
        let mut record = codec::encode(&header).map_err(|err| record_error(&err))?;
        for turn in [&p1.turn, &p2.turn].into_iter().flatten() {
            record.extend_from_slice(turn.as_bytes());
        }

        self.inner
            .write_all(&record)
            .and_then(|()| self.inner.flush())
            .map_err(|err| LinkError::io("writing replay record", &err))?;
        self.records += 1;
        trace!(%tick, turn_flags, "replay record written");
        Ok(())
    }

    /// Number of input records written so far.
    #[must_use]
    pub const fn records_written(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(mut self) -> Result<W, LinkError> {
        self.inner
            .flush()
            .map_err(|err| LinkError::io("flushing replay", &err))?;
        Ok(self.inner)
    }

    fn write_section(&mut self, player: PlayerIndex, bytes: &[u8]) -> Result<(), LinkError> {
        let len = u32::try_from(bytes.len())
            .map_err(|err| LinkError::invalid_request(format!("replay section too long: {err}")))?;
        let header = SectionHeader {
            player: player.as_u8(),
            len,
        };
        let mut section = codec::encode(&header).map_err(|err| record_error(&err))?;
        section.extend_from_slice(bytes);
        self.inner
            .write_all(&section)
            .and_then(|()| self.inner.flush())
            .map_err(|err| LinkError::io("writing replay section", &err))
    }
}

impl FileReplayWriter {
    /// Creates (or truncates) an uncompressed replay file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let file = create_file(path.as_ref())?;
        Self::new(Box::new(BufWriter::new(file)))
    }

    /// Creates (or truncates) a zstd-compressed replay file. Each flush ends a
    /// zstd block, so a crash still leaves a readable prefix.
    pub fn create_compressed(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let file = create_file(path.as_ref())?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), 0)
            .map_err(|err| LinkError::io("starting replay compression", &err))?
            .auto_finish();
        Self::new(Box::new(encoder))
    }
}

fn create_file(path: &Path) -> Result<File, LinkError> {
    debug!(path = %path.display(), "creating replay file");
    File::create(path)
        .map_err(|err| LinkError::io(&format!("creating {}", path.display()), &err))
}

fn record_error(err: &CodecError) -> LinkError {
    CodecError::encode(err.to_string(), CodecOperation::EncodeRecord).into()
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::input::{Input, TurnData};
    use crate::Tick;

    fn ready_writer() -> ReplayWriter<Vec<u8>> {
        let mut writer = ReplayWriter::new(Vec::new()).unwrap();
        writer.write_state(PlayerIndex::P2, &[0xaa; 3]).unwrap();
        writer.write_init(PlayerIndex::P2, &[2; 4]).unwrap();
        writer.write_init(PlayerIndex::P1, &[1; 4]).unwrap();
        writer
    }

    #[test]
    fn header_and_sections_layout() {
        let bytes = ready_writer().into_inner().unwrap();
        let mut expected = b"TOOT\x04".to_vec();
        expected.extend_from_slice(&[1, 3, 0, 0, 0, 0xaa, 0xaa, 0xaa]);
        expected.extend_from_slice(&[1, 4, 0, 0, 0, 2, 2, 2, 2]);
        expected.extend_from_slice(&[0, 4, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn record_layout() {
        let mut writer = ready_writer();
        let p1 = Input::new(Tick::new(0x0102), Tick::ZERO, 0xfc10, 7);
        let p2 = Input::new(Tick::new(0x0102), Tick::ZERO, 0xfc20, 9)
            .with_turn(TurnData::new([0x5c; crate::TURN_DATA_LEN]));
        writer
            .write_input(0xdead_beef, &InputPair::new(p1, p2))
            .unwrap();
        let bytes = writer.into_inner().unwrap();
        let record = &bytes[bytes.len() - (15 + crate::TURN_DATA_LEN)..];
        assert_eq!(
            &record[..15],
            &[
                0x02, 0x01, 0, 0, 0xef, 0xbe, 0xad, 0xde, 0x10, 0xfc, 7, 0x20, 0xfc, 9, 0b10
            ]
        );
        assert!(record[15..].iter().all(|&b| b == 0x5c));
    }

    #[test]
    fn sections_must_come_in_order() {
        let mut writer = ReplayWriter::new(Vec::new()).unwrap();
        let pair = InputPair::new(Input::neutral(), Input::neutral());
        assert!(matches!(
            writer.write_input(0, &pair),
            Err(LinkError::InvalidRequest { .. })
        ));
        assert!(matches!(
            writer.write_init(PlayerIndex::P1, &[]),
            Err(LinkError::InvalidRequest { .. })
        ));
        writer.write_state(PlayerIndex::P1, &[]).unwrap();
        assert!(matches!(
            writer.write_state(PlayerIndex::P1, &[]),
            Err(LinkError::InvalidRequest { .. })
        ));
        writer.write_init(PlayerIndex::P1, &[]).unwrap();
        assert!(matches!(
            writer.write_init(PlayerIndex::P1, &[]),
            Err(LinkError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn misaligned_pair_is_not_written() {
        let mut writer = ready_writer();
        let pair = InputPair::new(
            Input::new(Tick::new(1), Tick::ZERO, 0, 0),
            Input::new(Tick::new(2), Tick::ZERO, 0, 0),
        );
        assert!(writer.write_input(0, &pair).unwrap_err().is_desync());
        assert_eq!(writer.records_written(), 0);
    }
}
