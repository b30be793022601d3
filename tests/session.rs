//! Two sessions talking over an in-memory transport.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::stubs::{StubLayout, StubSimulation, StubState};
use rollback_link::handshake::Handshake;
use rollback_link::network::messages::{Hello2, PROTOCOL_VERSION};
use rollback_link::rng::Rng;
use rollback_link::telemetry::{CollectingObserver, ViolationKind};
use rollback_link::{
    negotiate, CancellationToken, ConnectionSide, Fastforwarder, HandshakeParams,
    InterceptHandler, LinkConfig, LinkError, Match, MemoryTransport, Message, MismatchKind,
    PlayerIndex, Replay, Simulation, Tick, Transport,
};

const TITLE: &str = "MEGAMAN6_FXX";
const CRC: u32 = 0xdee6_f2a9;

fn params(side: ConnectionSide) -> HandshakeParams {
    HandshakeParams::new(TITLE, CRC, 0, side)
}

fn config(dir: &Path) -> LinkConfig {
    LinkConfig {
        input_delay: 0,
        replay_dir: dir.to_path_buf(),
        handshake_timeout: Duration::from_secs(5),
        ping_interval: Duration::from_millis(10),
        ..LinkConfig::default()
    }
}

type Session = Arc<Match<MemoryTransport>>;

fn negotiated_pair(dir: &Path) -> (Session, Session) {
    let (ta, tb) = MemoryTransport::pair();
    let a = Match::new(ta, params(ConnectionSide::Offerer), config(dir)).unwrap();
    let b = Match::new(tb, params(ConnectionSide::Answerer), config(dir)).unwrap();
    negotiate_both(a, b)
}

/// Like [`negotiated_pair`], with violations of the first session collected.
fn observed_pair(dir: &Path, observer: Arc<CollectingObserver>) -> (Session, Session) {
    let (ta, tb) = MemoryTransport::pair();
    let a = Match::new(ta, params(ConnectionSide::Offerer), config(dir))
        .unwrap()
        .with_observer(observer);
    let b = Match::new(tb, params(ConnectionSide::Answerer), config(dir)).unwrap();
    negotiate_both(a, b)
}

fn negotiate_both(a: Match<MemoryTransport>, b: Match<MemoryTransport>) -> (Session, Session) {
    let (a, b) = (Arc::new(a), Arc::new(b));
    let answerer = {
        let b = Arc::clone(&b);
        thread::spawn(move || b.negotiate())
    };
    a.negotiate().unwrap();
    answerer.join().unwrap().unwrap();
    (a, b)
}

fn spawn_receiver(session: &Session) -> thread::JoinHandle<Result<(), LinkError>> {
    let session = Arc::clone(session);
    thread::spawn(move || session.run_receive_loop())
}

#[test]
fn negotiation_gives_opposite_seats_and_one_stream() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = negotiated_pair(dir.path());
    assert!(a.is_ready() && b.is_ready());
    assert_ne!(a.won_last_battle(), b.won_last_battle());

    let draws_a: Vec<u32> = a
        .with_shared_rng(|rng| (0..8).map(|_| rng.gen_range(0..0x44)).collect())
        .unwrap();
    let draws_b: Vec<u32> = b
        .with_shared_rng(|rng| (0..8).map(|_| rng.gen_range(0..0x44)).collect())
        .unwrap();
    assert_eq!(draws_a, draws_b);
}

#[test]
fn forged_reveal_is_rejected() {
    let (ours, theirs) = MemoryTransport::pair();
    let cheater = thread::spawn(move || {
        let token = CancellationToken::new();
        let mut honest = Handshake::with_nonce(params(ConnectionSide::Answerer), [1; 16]);
        theirs.send(&honest.hello().unwrap().encode().unwrap()).unwrap();
        let _hello = theirs.recv(&token).unwrap();
        // Reveal a nonce other than the one committed to.
        let forged = Message::Hello2(Hello2 { rng_nonce: [2; 16] });
        theirs.send(&forged.encode().unwrap()).unwrap();
        let _hello2 = theirs.recv(&token);
        theirs
    });

    let err = negotiate(
        &ours,
        params(ConnectionSide::Offerer),
        &CancellationToken::with_timeout(Duration::from_secs(5)),
    )
    .unwrap_err();
    assert_eq!(err, LinkError::CommitmentMismatch);
    drop(cheater.join().unwrap());
}

#[test]
fn different_games_do_not_match() {
    let (ta, tb) = MemoryTransport::pair();
    let other = thread::spawn(move || {
        negotiate(
            &tb,
            HandshakeParams::new("MEGAMAN6_GXX", CRC, 0, ConnectionSide::Answerer),
            &CancellationToken::with_timeout(Duration::from_secs(5)),
        )
    });
    let err = negotiate(
        &ta,
        params(ConnectionSide::Offerer),
        &CancellationToken::with_timeout(Duration::from_secs(5)),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LinkError::ProtocolMismatch {
            kind: MismatchKind::GameTitle { .. }
        }
    ));
    assert!(other.join().unwrap().is_err());
}

#[test]
fn old_protocol_version_is_reported() {
    let (ours, theirs) = MemoryTransport::pair();
    let peer = thread::spawn(move || {
        let mut handshake = Handshake::with_nonce(params(ConnectionSide::Answerer), [5; 16]);
        let Message::Hello(mut hello) = handshake.hello().unwrap() else {
            panic!("expected Hello");
        };
        hello.protocol_version = PROTOCOL_VERSION - 1;
        theirs.send(&Message::Hello(hello).encode().unwrap()).unwrap();
        theirs
    });
    let err = negotiate(
        &ours,
        params(ConnectionSide::Offerer),
        &CancellationToken::with_timeout(Duration::from_secs(5)),
    )
    .unwrap_err();
    assert_eq!(
        err,
        LinkError::ProtocolMismatch {
            kind: MismatchKind::ProtocolVersion {
                local: PROTOCOL_VERSION,
                remote: PROTOCOL_VERSION - 1
            }
        }
    );
    drop(peer.join().unwrap());
}

#[test]
fn silent_peer_times_out_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, _silent) = MemoryTransport::pair();
    let session = Match::new(
        transport,
        params(ConnectionSide::Offerer),
        LinkConfig {
            handshake_timeout: Duration::from_millis(50),
            ..config(dir.path())
        },
    )
    .unwrap();
    let err = session.negotiate().unwrap_err();
    assert!(err.is_connection_loss(), "{err}");
    assert!(!session.is_ready());
}

/// Drives one peer's tick loop: enqueue ten local inputs, then fastforward
/// until every tick is confirmed.
fn play_ten_ticks(session: &Session, local: PlayerIndex) -> StubState {
    let joyflags = if local == PlayerIndex::P1 { 0xfc10 } else { 0xfc20 };
    let token = CancellationToken::with_timeout(Duration::from_secs(5));
    for tick in 0..10 {
        session
            .add_local_input(Tick::new(tick), joyflags, 0, &token)
            .unwrap();
    }

    let mut ff = Fastforwarder::new(StubSimulation::new(), StubLayout);
    let mut checkpoint = StubState::default();
    let deadline = Instant::now() + Duration::from_secs(5);
    while checkpoint.tick() < 10 {
        assert!(Instant::now() < deadline, "peer inputs never arrived");
        checkpoint = session.fastforward(&mut ff, checkpoint).unwrap().checkpoint;
        thread::sleep(Duration::from_millis(2));
    }
    checkpoint
}

#[test]
fn ten_ticks_confirm_identically_on_both_peers() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = negotiated_pair(dir.path());
    let receivers = [spawn_receiver(&a), spawn_receiver(&b)];

    let seat_a = a.new_battle().unwrap();
    let seat_b = b.new_battle().unwrap();
    assert_eq!(seat_a.opponent(), seat_b);

    a.send_init(&[0xaa; 0x100]).unwrap();
    b.send_init(&[0xbb; 0x100]).unwrap();
    let token = CancellationToken::with_timeout(Duration::from_secs(5));
    assert_eq!(a.remote_init(&token).unwrap()[0], 0xbb);
    assert_eq!(b.remote_init(&token).unwrap()[0], 0xaa);
    a.record_battle_start(b"start").unwrap();
    b.record_battle_start(b"start").unwrap();

    let player_b = {
        let b = Arc::clone(&b);
        thread::spawn(move || play_ten_ticks(&b, seat_b))
    };
    let final_a = play_ten_ticks(&a, seat_a);
    let final_b = player_b.join().unwrap();

    assert_eq!(final_a.digest, final_b.digest);
    assert_eq!(final_a.memory, final_b.memory);

    let last = a.last_committed_remote().unwrap();
    assert_eq!(last.local_tick, Tick::new(9));

    let path_a = a.replay_path_of_current_battle().unwrap();
    a.end_battle().unwrap();
    b.end_battle().unwrap();

    let replay = Replay::open(&path_a).unwrap();
    assert_eq!(replay.local_player, seat_a);
    assert_eq!(replay.state, b"start");
    assert_eq!(replay.init[seat_a.as_usize()], vec![0xaa; 0x100]);
    assert_eq!(replay.init[seat_b.as_usize()], vec![0xbb; 0x100]);
    assert_eq!(replay.input_pairs.len(), 10);
    for (tick, pair) in replay.input_pairs.iter().enumerate() {
        assert_eq!(pair.check_aligned(), Ok(Tick::new(tick as u32)));
        assert_eq!(pair.p1().joyflags, 0xfc10);
        assert_eq!(pair.p2().joyflags, 0xfc20);
    }

    a.close().unwrap();
    b.close().unwrap();
    for receiver in receivers {
        // Whichever side closes second may see the hangup first.
        let result = receiver.join().unwrap();
        assert!(
            matches!(result, Ok(()) | Err(LinkError::Disconnected)),
            "{result:?}"
        );
    }
}

#[test]
fn lag_is_reported_for_both_seats() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = negotiated_pair(dir.path());
    let receivers = [spawn_receiver(&a), spawn_receiver(&b)];
    let seat_a = a.new_battle().unwrap();
    let seat_b = b.new_battle().unwrap();

    let token = CancellationToken::with_timeout(Duration::from_secs(5));
    for tick in 0..3 {
        a.add_local_input(Tick::new(tick), 0xfc00, 0, &token).unwrap();
    }
    assert_eq!(a.lag(seat_a), Some(-3));
    assert_eq!(a.lag(seat_b), Some(3));
    assert_eq!(a.remote_lag(), Some(3));

    let deadline = Instant::now() + Duration::from_secs(5);
    while b.lag(seat_b) != Some(3) {
        assert!(Instant::now() < deadline, "inputs never reached the peer");
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(b.lag(seat_a), Some(-3));
    assert_eq!(b.remote_lag(), Some(-3));

    a.close().unwrap();
    b.close().unwrap();
    for receiver in receivers {
        let result = receiver.join().unwrap();
        assert!(
            matches!(result, Ok(()) | Err(LinkError::Disconnected)),
            "{result:?}"
        );
    }
}

/// Pauses inside its first frame until released.
struct GatedSimulation {
    inner: StubSimulation,
    gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl Simulation for GatedSimulation {
    type State = StubState;

    fn save_state(&mut self) -> Option<StubState> {
        self.inner.save_state()
    }

    fn load_state(&mut self, state: &StubState) -> bool {
        self.inner.load_state(state)
    }

    fn register_intercept(&mut self, address: u32) {
        self.inner.register_intercept(address);
    }

    fn run_frame(&mut self, handler: &mut dyn InterceptHandler) {
        if let Some((started, release)) = self.gate.take() {
            started.send(()).unwrap();
            release.recv().unwrap();
        }
        self.inner.run_frame(handler);
    }
}

#[test]
fn remote_input_is_queued_while_fastforward_runs() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(CollectingObserver::new());
    let (a, b) = observed_pair(dir.path(), observer.clone());
    let receivers = [spawn_receiver(&a), spawn_receiver(&b)];
    a.new_battle().unwrap();
    b.new_battle().unwrap();
    a.send_init(&[0xaa; 0x100]).unwrap();
    b.send_init(&[0xbb; 0x100]).unwrap();
    let token = CancellationToken::with_timeout(Duration::from_secs(5));
    a.remote_init(&token).unwrap();
    a.record_battle_start(b"start").unwrap();

    a.add_local_input(Tick::new(0), 0xfc10, 0, &token).unwrap();
    b.add_local_input(Tick::new(0), 0xfc20, 0, &token).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while a.remote_lag() != Some(0) {
        assert!(Instant::now() < deadline, "first remote input never arrived");
        thread::sleep(Duration::from_millis(2));
    }

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let simulation = GatedSimulation {
        inner: StubSimulation::new(),
        gate: Some((started_tx, release_rx)),
    };
    let runner = {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            let mut ff = Fastforwarder::new(simulation, StubLayout);
            a.fastforward(&mut ff, StubState::default())
                .map(|outcome| outcome.checkpoint)
        })
    };

    started_rx.recv().unwrap();
    b.add_local_input(Tick::new(1), 0xfc20, 0, &token).unwrap();
    while a.remote_lag() != Some(-1) {
        assert!(Instant::now() < deadline, "remote input stalled behind fastforward");
        thread::sleep(Duration::from_millis(2));
    }
    // Overrun the 60 fps tick budget.
    thread::sleep(Duration::from_millis(40));
    release_tx.send(()).unwrap();
    let checkpoint = runner.join().unwrap().unwrap();
    assert_eq!(checkpoint.tick(), 1);

    let overruns: Vec<_> = observer
        .violations()
        .into_iter()
        .filter(|violation| violation.kind == ViolationKind::Timing)
        .collect();
    assert_eq!(overruns.len(), 1);
    assert_eq!(overruns[0].tick, Some(Tick::ZERO));
    assert!(overruns[0].context.contains_key("elapsed_us"));

    let path = a.replay_path_of_current_battle().unwrap();
    a.end_battle().unwrap();
    assert_eq!(Replay::open(&path).unwrap().input_pairs.len(), 1);

    a.close().unwrap();
    b.close().unwrap();
    for receiver in receivers {
        let result = receiver.join().unwrap();
        assert!(
            matches!(result, Ok(()) | Err(LinkError::Disconnected)),
            "{result:?}"
        );
    }
}

#[test]
fn input_without_battle_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(CollectingObserver::new());
    let (ta, tb) = MemoryTransport::pair();
    let a = Arc::new(
        Match::new(ta, params(ConnectionSide::Offerer), config(dir.path()))
            .unwrap()
            .with_observer(observer.clone()),
    );
    let receiver = spawn_receiver(&a);

    let stray = Message::Input(rollback_link::network::messages::InputMessage {
        battle_number: 1,
        local_tick: Tick::new(3),
        remote_tick: Tick::ZERO,
        joyflags: 0xfc00,
        aux_state: 0,
        trailer: Vec::new(),
    });
    tb.send(&stray.encode().unwrap()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while observer.is_empty() {
        assert!(Instant::now() < deadline, "violation never reported");
        thread::sleep(Duration::from_millis(2));
    }
    assert!(observer.has_violation(ViolationKind::NetworkProtocol));

    a.close().unwrap();
    receiver.join().unwrap().unwrap();
}

#[test]
fn peer_hangup_ends_receive_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (ta, tb) = MemoryTransport::pair();
    let a = Arc::new(Match::new(ta, params(ConnectionSide::Offerer), config(dir.path())).unwrap());
    let receiver = spawn_receiver(&a);
    drop(tb);
    assert_eq!(receiver.join().unwrap(), Err(LinkError::Disconnected));
}

#[test]
fn pings_are_answered_and_loops_stop_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = negotiated_pair(dir.path());
    let receivers = [spawn_receiver(&a), spawn_receiver(&b)];
    let pinger = {
        let a = Arc::clone(&a);
        thread::spawn(move || a.run_ping_loop())
    };

    thread::sleep(Duration::from_millis(60));
    // A same-process round trip is far below one tick.
    assert_eq!(a.runahead_ticks_allowed(), 1);

    a.close().unwrap();
    pinger.join().unwrap().unwrap();
    b.close().unwrap();
    for receiver in receivers {
        // Whichever side closes second may see the hangup first.
        let result = receiver.join().unwrap();
        assert!(
            matches!(result, Ok(()) | Err(LinkError::Disconnected)),
            "{result:?}"
        );
    }
}
