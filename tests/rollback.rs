//! Rollback engine tests against the stub simulation.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::stubs::{StubLayout, StubSimulation, StubState};
use common::{input, pair, pairs, ready_replay};
use rollback_link::input::keys;
use rollback_link::{
    BlankPrediction, DesyncKind, Fastforwarder, Input, InputPair, LinkError, PlayerIndex, Replay,
    Tick, TurnData, TURN_DATA_LEN,
};

fn fastforwarder() -> Fastforwarder<StubSimulation, StubLayout> {
    Fastforwarder::new(StubSimulation::new(), StubLayout)
}

#[test]
fn batch_and_single_commits_agree() {
    common::init_tracing();
    let confirmed = pairs(0, 5);
    let remote = Input::neutral();

    let mut batched = fastforwarder();
    let mut batched_replay = ready_replay(PlayerIndex::P1);
    let batch = batched
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            confirmed.clone(),
            &remote,
            &[],
            &mut batched_replay,
        )
        .unwrap();

    let mut stepped = fastforwarder();
    let mut stepped_replay = ready_replay(PlayerIndex::P1);
    let mut checkpoint = StubState::default();
    for single in confirmed {
        checkpoint = stepped
            .fastforward(
                checkpoint,
                PlayerIndex::P1,
                vec![single],
                &remote,
                &[],
                &mut stepped_replay,
            )
            .unwrap()
            .checkpoint;
    }

    assert_eq!(batch.checkpoint, checkpoint);
    assert_eq!(batch.checkpoint.tick(), 5);
    assert_eq!(batched_replay.records_written(), 5);
    assert_eq!(
        batched_replay.into_inner().unwrap(),
        stepped_replay.into_inner().unwrap()
    );
}

#[test]
fn nothing_to_run_returns_checkpoint_untouched() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let checkpoint = StubState::default();
    let outcome = ff
        .fastforward(
            checkpoint.clone(),
            PlayerIndex::P1,
            Vec::new(),
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap();
    assert_eq!(outcome.checkpoint, checkpoint);
    assert_eq!(outcome.dirty, checkpoint);
    assert!(outcome.last_predicted.is_none());
    assert_eq!(ff.simulation().loads, 0);
    assert_eq!(replay.records_written(), 0);
}

#[test]
fn predictions_alone_keep_the_checkpoint() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let backlog = [input(0, 0xfc10), input(1, 0xfc10), input(2, 0xfc10)];
    let checkpoint = StubState::default();
    let outcome = ff
        .fastforward(
            checkpoint.clone(),
            PlayerIndex::P1,
            Vec::new(),
            &Input::neutral(),
            &backlog,
            &mut replay,
        )
        .unwrap();

    assert_eq!(outcome.checkpoint, checkpoint);
    // The newest prediction is left for the live simulation.
    assert_eq!(outcome.dirty.tick(), 2);
    let last = outcome.last_predicted.unwrap();
    assert_eq!(last.check_aligned(), Ok(Tick::new(2)));
    assert_eq!(last.p1().joyflags, 0xfc10);
    assert_eq!(replay.records_written(), 0);
}

#[test]
fn single_backlog_input_leaves_dirty_at_checkpoint() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P2);
    let outcome = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P2,
            pairs(0, 2),
            &Input::neutral(),
            &[input(2, 0xfc40)],
            &mut replay,
        )
        .unwrap();
    assert_eq!(outcome.checkpoint.tick(), 2);
    assert_eq!(outcome.dirty, outcome.checkpoint);
    let last = outcome.last_predicted.unwrap();
    // Local input sits in player 2's seat.
    assert_eq!(last.p2().joyflags, 0xfc40);
}

#[test]
fn remote_prediction_holds_only_a_and_b() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let remote = Input::new(Tick::new(4), Tick::ZERO, keys::NEUTRAL | keys::A | keys::LEFT, 3);
    let outcome = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            Vec::new(),
            &remote,
            &[input(0, 0xfc00)],
            &mut replay,
        )
        .unwrap();
    let predicted = outcome.last_predicted.unwrap();
    assert_eq!(predicted.p2().joyflags, keys::A);
    assert_eq!(predicted.p2().aux_state, 3);
    assert_eq!(predicted.p2().local_tick, Tick::ZERO);
}

#[test]
fn prediction_strategy_is_replaceable() {
    let mut ff = fastforwarder().with_prediction(BlankPrediction);
    let mut replay = ready_replay(PlayerIndex::P1);
    let remote = Input::new(Tick::ZERO, Tick::ZERO, keys::NEUTRAL | keys::B, 9);
    let outcome = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            Vec::new(),
            &remote,
            &[input(0, 0xfc00)],
            &mut replay,
        )
        .unwrap();
    let predicted = outcome.last_predicted.unwrap();
    assert_eq!(predicted.p2().joyflags, keys::NEUTRAL);
    assert_eq!(predicted.p2().aux_state, 0);
}

#[test]
fn predicted_inputs_change_dirty_but_not_checkpoint() {
    let mut quiet = fastforwarder();
    let mut loud = fastforwarder();
    let mut replay_a = ready_replay(PlayerIndex::P1);
    let mut replay_b = ready_replay(PlayerIndex::P1);
    let quiet_backlog = [input(3, 0xfc00), input(4, 0xfc00), input(5, 0xfc00)];
    let loud_backlog = [input(3, 0xfc01), input(4, 0xfc02), input(5, 0xfc00)];

    let a = quiet
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 3),
            &Input::neutral(),
            &quiet_backlog,
            &mut replay_a,
        )
        .unwrap();
    let b = loud
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 3),
            &Input::neutral(),
            &loud_backlog,
            &mut replay_b,
        )
        .unwrap();

    assert_eq!(a.checkpoint, b.checkpoint);
    assert_ne!(a.dirty, b.dirty);
    assert_eq!(a.dirty.tick(), 5);
}

#[test]
fn confirmed_pairs_are_logged_with_rng_state() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let turn = TurnData::new([3; TURN_DATA_LEN]);
    let mut confirmed = pairs(0, 3);
    let [p1, p2] = confirmed.remove(1).into_inner();
    confirmed.insert(1, InputPair::new(p1.with_turn(turn.clone()), p2));

    let outcome = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            confirmed.clone(),
            &Input::neutral(),
            &[input(3, 0xfc00), input(4, 0xfc00)],
            &mut replay,
        )
        .unwrap();
    assert_eq!(outcome.checkpoint.turns_seen(PlayerIndex::P1), 1);
    assert_eq!(outcome.checkpoint.turn_sum(PlayerIndex::P1), 3 * TURN_DATA_LEN as u32);
    assert_eq!(outcome.checkpoint.turns_seen(PlayerIndex::P2), 0);

    let bytes = replay.into_inner().unwrap();
    let read = Replay::read(bytes.as_slice()).unwrap();
    assert!(!read.truncated);
    assert_eq!(read.input_pairs.len(), 3);
    // The stub's RNG starts at zero and steps once per tick.
    assert_eq!(read.rng_states, vec![0, 12_345, 12_345u32.wrapping_mul(1_103_515_245).wrapping_add(12_345)]);
    for (written, read) in confirmed.iter().zip(&read.input_pairs) {
        assert_eq!(written.p1().joyflags, read.p1().joyflags);
        assert_eq!(written.p2().joyflags, read.p2().joyflags);
        assert_eq!(written.p1().turn, read.p1().turn);
    }
}

#[test]
fn side_query_is_answered_with_local_seat() {
    for local in PlayerIndex::ALL {
        let mut ff = fastforwarder();
        let mut replay = ready_replay(local);
        let outcome = ff
            .fastforward(
                StubState::default(),
                local,
                pairs(0, 1),
                &Input::neutral(),
                &[],
                &mut replay,
            )
            .unwrap();
        assert_eq!(outcome.checkpoint.registers[0], u32::from(local.as_u8()));
    }
}

#[test]
fn misaligned_pair_is_a_desync() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let bad = InputPair::new(input(0, 0xfc00), input(1, 0xfc00));
    let err = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            vec![bad],
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinkError::Desync {
            kind: DesyncKind::PairTickMismatch {
                p1: Tick::new(0),
                p2: Tick::new(1)
            }
        }
    );
    assert_eq!(replay.records_written(), 0);
}

#[test]
fn pair_for_wrong_tick_is_a_desync() {
    let mut ff = fastforwarder();
    let mut replay = ready_replay(PlayerIndex::P1);
    let err = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            vec![pair(7, 0xfc00, 0xfc00)],
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinkError::Desync {
            kind: DesyncKind::SimulationTickMismatch {
                input: Tick::new(7),
                simulation: Tick::ZERO
            }
        }
    );
}

#[test]
fn failed_load_and_save_are_desyncs() {
    let mut sim = StubSimulation::new();
    sim.fail_load = true;
    let mut ff = Fastforwarder::new(sim, StubLayout);
    let mut replay = ready_replay(PlayerIndex::P1);
    let err = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 1),
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinkError::Desync {
            kind: DesyncKind::StateLoadFailed
        }
    );

    let mut sim = StubSimulation::new();
    sim.fail_save = true;
    let mut ff = Fastforwarder::new(sim, StubLayout);
    let err = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 1),
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinkError::Desync {
            kind: DesyncKind::StateSaveFailed
        }
    );
}

#[test]
fn slow_commits_still_fit_the_frame_budget() {
    let mut sim = StubSimulation::new();
    sim.commit_every = 3;
    let mut ff = Fastforwarder::new(sim, StubLayout);
    let mut replay = ready_replay(PlayerIndex::P1);
    let outcome = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 4),
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap();
    assert_eq!(outcome.checkpoint.tick(), 4);
}

#[test]
fn missing_intercept_starves() {
    let mut sim = StubSimulation::new();
    sim.starve = true;
    let mut ff = Fastforwarder::new(sim, StubLayout).with_max_frames_per_tick(4);
    let mut replay = ready_replay(PlayerIndex::P1);
    let err = ff
        .fastforward(
            StubState::default(),
            PlayerIndex::P1,
            pairs(0, 1),
            &Input::neutral(),
            &[],
            &mut replay,
        )
        .unwrap_err();
    assert_eq!(
        err,
        LinkError::Desync {
            kind: DesyncKind::InterceptStarved { frames: 4 }
        }
    );
    assert_eq!(ff.simulation().state.frames, 4);
}
