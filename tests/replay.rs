//! Replay files on disk: round trips, compression and damaged input.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use std::fs;

use common::{pairs, INIT_LEN};
use rollback_link::replay::{REPLAY_MAGIC, REPLAY_VERSION};
use rollback_link::{
    FileReplayWriter, InputPair, LinkError, PlayerIndex, Replay, ReplayWriter, Tick, TurnData,
    TURN_DATA_LEN,
};

fn with_turn(pair: InputPair, player: PlayerIndex, fill: u8) -> InputPair {
    let [mut p1, mut p2] = pair.into_inner();
    let turn = TurnData::new([fill; TURN_DATA_LEN]);
    if player.is_p2() {
        p2.turn = Some(turn);
    } else {
        p1.turn = Some(turn);
    }
    InputPair::new(p1, p2)
}

fn battle() -> Vec<InputPair> {
    let mut pairs = pairs(0, 6);
    pairs[2] = with_turn(pairs[2].clone(), PlayerIndex::P2, 0x33);
    pairs[4] = with_turn(pairs[4].clone(), PlayerIndex::P1, 0x44);
    pairs
}

fn write_battle<W: std::io::Write>(mut writer: ReplayWriter<W>) -> W {
    writer.write_state(PlayerIndex::P2, b"snapshot").unwrap();
    writer.write_init(PlayerIndex::P1, &[1; INIT_LEN]).unwrap();
    writer.write_init(PlayerIndex::P2, &[2; INIT_LEN]).unwrap();
    for (rng_state, pair) in battle().iter().enumerate() {
        writer.write_input(rng_state as u32 * 10, pair).unwrap();
    }
    writer.into_inner().unwrap()
}

fn assert_battle(replay: &Replay) {
    assert_eq!(replay.local_player, PlayerIndex::P2);
    assert_eq!(replay.remote_player(), PlayerIndex::P1);
    assert_eq!(replay.state, b"snapshot");
    assert_eq!(replay.init, [vec![1; INIT_LEN], vec![2; INIT_LEN]]);
    assert_eq!(replay.rng_states, vec![0, 10, 20, 30, 40, 50]);
    let expected = battle();
    assert_eq!(replay.input_pairs.len(), expected.len());
    for (read, written) in replay.input_pairs.iter().zip(&expected) {
        assert_eq!(read.check_aligned(), written.check_aligned());
        for player in PlayerIndex::ALL {
            let (read, written) = (read.get(player), written.get(player));
            assert_eq!(read.joyflags, written.joyflags);
            assert_eq!(read.aux_state, written.aux_state);
            assert_eq!(read.turn, written.turn);
            assert_eq!(read.remote_tick, Tick::ZERO);
        }
    }
}

#[test]
fn uncompressed_file_round_trip() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("battle.tangoreplay");
    let writer = FileReplayWriter::create(&path).unwrap();
    drop(write_battle(writer));

    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], &REPLAY_MAGIC);
    assert_eq!(bytes[4], REPLAY_VERSION);

    let replay = Replay::open(&path).unwrap();
    assert!(!replay.truncated);
    assert_battle(&replay);
}

#[test]
fn compressed_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("battle.tangoreplay");
    let writer = FileReplayWriter::create_compressed(&path).unwrap();
    drop(write_battle(writer));

    let bytes = fs::read(&path).unwrap();
    assert_ne!(&bytes[..4], &REPLAY_MAGIC);

    let replay = Replay::open(&path).unwrap();
    assert!(!replay.truncated);
    assert_battle(&replay);
}

#[test]
fn truncated_record_keeps_complete_prefix() {
    let bytes = write_battle(ReplayWriter::new(Vec::new()).unwrap());
    // Cut into the turn blob of the third record.
    let header_len = 5 + 5 + 8 + 2 * (5 + INIT_LEN);
    let cut = header_len + 2 * 15 + 15 + 10;

    let replay = Replay::read(&bytes[..cut]).unwrap();
    assert!(replay.truncated);
    assert_eq!(replay.input_pairs.len(), 2);
    assert_eq!(replay.rng_states, vec![0, 10]);
}

#[test]
fn every_cut_inside_records_reads() {
    let bytes = write_battle(ReplayWriter::new(Vec::new()).unwrap());
    let header_len = 5 + 5 + 8 + 2 * (5 + INIT_LEN);
    let mut last = 0;
    for cut in header_len..=bytes.len() {
        let replay = Replay::read(&bytes[..cut]).unwrap();
        assert!(replay.input_pairs.len() >= last);
        last = replay.input_pairs.len();
    }
    assert_eq!(last, 6);
}

#[test]
fn truncated_header_is_an_error() {
    let bytes = write_battle(ReplayWriter::new(Vec::new()).unwrap());
    for cut in [0, 3, 7, 20, 5 + 5 + 8 + 5 + 10] {
        assert!(
            matches!(
                Replay::read(&bytes[..cut]),
                Err(LinkError::InvalidReplay { .. })
            ),
            "cut at {cut}"
        );
    }
}

#[test]
fn bad_magic_and_version_are_rejected() {
    let mut bytes = write_battle(ReplayWriter::new(Vec::new()).unwrap());
    bytes[4] = REPLAY_VERSION + 1;
    let err = Replay::read(bytes.as_slice()).unwrap_err();
    assert!(err.to_string().contains("version"), "{err}");

    bytes[0] = b'X';
    assert!(matches!(
        Replay::read(bytes.as_slice()),
        Err(LinkError::InvalidReplay { .. })
    ));
}

#[test]
fn repeated_init_player_is_rejected() {
    let mut writer = ReplayWriter::new(Vec::new()).unwrap();
    writer.write_state(PlayerIndex::P1, &[]).unwrap();
    writer.write_init(PlayerIndex::P1, &[1; 4]).unwrap();
    writer.write_init(PlayerIndex::P2, &[2; 4]).unwrap();
    let mut bytes = writer.into_inner().unwrap();
    // Second init section's player byte.
    let second_init = 5 + 5 + (5 + 4);
    bytes[second_init] = 0;
    assert!(matches!(
        Replay::read(bytes.as_slice()),
        Err(LinkError::InvalidReplay { .. })
    ));
}

#[test]
fn unknown_turn_flags_are_rejected() {
    let mut bytes = write_battle(ReplayWriter::new(Vec::new()).unwrap());
    let header_len = 5 + 5 + 8 + 2 * (5 + INIT_LEN);
    // Turn flags are the last byte of the first record header.
    bytes[header_len + 14] = 0b100;
    let err = Replay::read(bytes.as_slice()).unwrap_err();
    assert!(err.to_string().contains("turn flags"), "{err}");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Replay::open(dir.path().join("nope.tangoreplay")).unwrap_err();
    assert!(matches!(err, LinkError::Io { .. }));
}
