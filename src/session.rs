//! The session controller.
//!
//! A [`Match`] ties one peer connection to a sequence of battles. It is shared
//! (behind an `Arc`) by three contexts:
//!
//! - the tick driver, which calls [`Match::add_local_input`],
//!   [`Match::fastforward`] and the pacing queries once per tick,
//! - the receive loop ([`Match::run_receive_loop`]), which routes incoming
//!   messages into the current battle,
//! - the ping loop ([`Match::run_ping_loop`]), which feeds the latency window.
//!
//! # Battle lifecycle
//!
//! ```text
//! negotiate -> new_battle -> send_init -> remote_init -> record_battle_start
//!           -> (add_local_input, fastforward)* -> end_battle -> new_battle ...
//! ```
//!
//! The local seat alternates with the outcome of the previous battle: the
//! winner plays as player 1. The first battle's "winner" is drawn from the
//! shared RNG during negotiation.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use web_time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::LinkConfig;
use crate::error::{CancelReason, LinkError};
use crate::fastforward::{FastforwardOutcome, Fastforwarder};
use crate::handshake::{self, HandshakeParams, SharedRng};
use crate::input::{Input, InputPair, TurnData};
use crate::input_queue::{CancellationToken, InputQueue, Wake};
use crate::network::codec::{CodecError, CodecOperation};
use crate::network::messages::{Init, InputMessage, Message, INIT_LEN};
use crate::network::transport::Transport;
use crate::replay::{FileReplayWriter, REPLAY_EXTENSION};
use crate::simulation::{GameLayout, Simulation};
use crate::telemetry::{
    report_to_observer, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{report_violation_to, PlayerIndex, Tick};

/// What the tick driver should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickPacing {
    /// We are too far ahead of the peer; skip this tick.
    Stall {
        /// Local buffered inputs minus remote buffered inputs.
        lag: isize,
        /// The lag at which stalling starts.
        limit: isize,
    },
    /// Run at this rate until the next query.
    Run {
        /// Target tick rate.
        ticks_per_second: u32,
    },
}

#[derive(Debug)]
struct PendingTurn {
    turn: TurnData,
    ticks_left: u32,
}

struct Battle {
    number: u8,
    local_player: PlayerIndex,
    queue: Arc<InputQueue>,
    replay: Option<FileReplayWriter>,
    replay_path: PathBuf,
    last_committed_remote: Input,
    latest_remote_tick: Tick,
    pending_turn: Option<PendingTurn>,
    local_init: Option<Box<[u8; INIT_LEN]>>,
    remote_init: Option<Box<[u8; INIT_LEN]>>,
}

impl Battle {
    fn replay_mut(&mut self) -> Result<&mut FileReplayWriter, LinkError> {
        self.replay
            .as_mut()
            .ok_or_else(|| LinkError::invalid_request("replay already closed"))
    }

    /// Counts down the pending turn and hands it out on the tick it is due.
    fn take_due_turn(&mut self) -> Option<TurnData> {
        let pending = self.pending_turn.as_mut()?;
        pending.ticks_left = pending.ticks_left.saturating_sub(1);
        if pending.ticks_left > 0 {
            return None;
        }
        self.pending_turn.take().map(|pending| pending.turn)
    }

    fn finish(&mut self) -> Result<(), LinkError> {
        if let Some(replay) = self.replay.take() {
            let records = replay.records_written();
            close_replay(replay)?;
            info!(
                battle = self.number,
                records,
                path = %self.replay_path.display(),
                "replay closed"
            );
        }
        Ok(())
    }
}

fn close_replay(replay: FileReplayWriter) -> Result<(), LinkError> {
    let mut inner = replay.into_inner()?;
    inner
        .flush()
        .map_err(|err| LinkError::io("closing replay", &err))
}

/// Wakes [`Match::remote_init`] waiters, under the session lock.
struct InitSignal {
    state: Arc<Mutex<MatchState>>,
    arrived: Condvar,
}

impl Wake for InitSignal {
    fn wake(&self) {
        let _held = self.state.lock();
        self.arrived.notify_all();
    }
}

struct MatchState {
    rng: Option<SharedRng>,
    won_last_battle: bool,
    battle_number: u8,
    battle: Option<Battle>,
    pending_remote_init: Option<Init>,
}

/// One peer-to-peer session: handshake, message routing, and a sequence of battles.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::thread;
/// use rollback_link::{ConnectionSide, HandshakeParams, LinkConfig, Match, MemoryTransport};
///
/// let (transport, _peer) = MemoryTransport::pair();
/// let params = HandshakeParams::new("MEGAMAN6_FXX", 0xdee6_f2a9, 0, ConnectionSide::Offerer);
/// let session = Arc::new(Match::new(transport, params, LinkConfig::default())?);
/// session.negotiate()?;
///
/// let receiver = Arc::clone(&session);
/// thread::spawn(move || receiver.run_receive_loop());
/// let pinger = Arc::clone(&session);
/// thread::spawn(move || pinger.run_ping_loop());
///
/// let local_player = session.new_battle()?;
/// # Ok::<(), rollback_link::LinkError>(())
/// ```
pub struct Match<T: Transport> {
    config: LinkConfig,
    transport: T,
    params: HandshakeParams,
    shutdown: CancellationToken,
    state: Arc<Mutex<MatchState>>,
    init_arrived: Arc<InitSignal>,
    round_trips: Mutex<VecDeque<Duration>>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Transport> std::fmt::Debug for Match<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Match")
            .field("config", &self.config)
            .field("params", &self.params)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Match<T> {
    /// Creates a session over an already connected transport.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] if `config` does not validate.
    pub fn new(transport: T, params: HandshakeParams, config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let rtt_window = config.rtt_window;
        let state = Arc::new(Mutex::new(MatchState {
            rng: None,
            won_last_battle: false,
            battle_number: 0,
            battle: None,
            pending_remote_init: None,
        }));
        Ok(Self {
            config,
            transport,
            params,
            shutdown: CancellationToken::new(),
            state: Arc::clone(&state),
            init_arrived: Arc::new(InitSignal {
                state,
                arrived: Condvar::new(),
            }),
            round_trips: Mutex::new(VecDeque::with_capacity(rtt_window)),
            observer: None,
        })
    }

    /// Routes protocol violations to `observer` instead of `tracing`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The configuration this session was created with.
    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// A clone of the token that fires on [`close`](Self::close).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the handshake, bounded by the configured handshake timeout.
    ///
    /// Must complete before the receive loop starts, since both read from the
    /// same transport.
    ///
    /// # Errors
    ///
    /// Anything [`handshake::negotiate`] returns.
    pub fn negotiate(&self) -> Result<(), LinkError> {
        let cancel = self
            .shutdown
            .child_with_timeout(self.config.handshake_timeout);
        let negotiated = handshake::negotiate(&self.transport, self.params.clone(), &cancel)?;
        let mut state = self.state.lock();
        state.rng = Some(negotiated.rng);
        state.won_last_battle = negotiated.won_last_battle;
        Ok(())
    }

    /// Whether [`negotiate`](Self::negotiate) has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().rng.is_some()
    }

    /// Receives and dispatches messages until [`close`](Self::close) is called.
    ///
    /// # Errors
    ///
    /// Transport and decode errors end the loop, as does a remote input that
    /// cannot be queued. A clean shutdown returns `Ok(())`.
    pub fn run_receive_loop(&self) -> Result<(), LinkError> {
        loop {
            let result = self
                .transport
                .recv(&self.shutdown)
                .and_then(|frame| Message::decode(&frame))
                .and_then(|message| self.handle_message(message));
            match result {
                Ok(()) => {},
                Err(err) if self.is_shutdown(&err) => {
                    debug!("receive loop stopped");
                    return Ok(());
                },
                Err(err) => {
                    warn!(error = %err, "receive loop failed");
                    return Err(err);
                },
            }
        }
    }

    /// Sends a latency ping every configured interval until [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// The first failed send.
    pub fn run_ping_loop(&self) -> Result<(), LinkError> {
        loop {
            let ping = Message::Ping {
                timestamp_micros: unix_micros(),
            };
            match self.transport.send(&ping.encode()?) {
                Ok(()) => {},
                Err(_) if self.shutdown.is_cancelled() => return Ok(()),
                Err(err) => return Err(err),
            }

            self.shutdown
                .child_with_timeout(self.config.ping_interval)
                .park();
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
        }
    }

    fn is_shutdown(&self, err: &LinkError) -> bool {
        self.shutdown.is_cancelled()
            && matches!(
                err,
                LinkError::Cancelled {
                    reason: CancelReason::Aborted
                } | LinkError::Disconnected
            )
    }

    fn handle_message(&self, message: Message) -> Result<(), LinkError> {
        match message {
            Message::Ping { timestamp_micros } => {
                self.transport
                    .send(&Message::Pong { timestamp_micros }.encode()?)
            },
            Message::Pong { timestamp_micros } => {
                let elapsed = unix_micros().saturating_sub(timestamp_micros);
                self.record_round_trip(Duration::from_micros(elapsed));
                Ok(())
            },
            Message::Init(init) => {
                self.handle_init(init);
                Ok(())
            },
            Message::Input(input) => self.handle_input(input),
            other @ (Message::Hello(_) | Message::Hello2(_)) => {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "{} received after negotiation, dropping it",
                    other.name()
                );
                Ok(())
            },
        }
    }

    fn record_round_trip(&self, round_trip: Duration) {
        let mut round_trips = self.round_trips.lock();
        while round_trips.len() >= self.config.rtt_window {
            round_trips.pop_front();
        }
        round_trips.push_back(round_trip);
    }

    fn handle_init(&self, init: Init) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.battle.as_mut() {
            Some(battle) if battle.number == init.battle_number => {
                if battle.remote_init.is_some() {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "duplicate init for battle {}, keeping the first",
                        init.battle_number
                    );
                    return;
                }
                debug!(battle = battle.number, "remote init received");
                battle.remote_init = Some(init.marshaled);
                self.init_arrived.arrived.notify_all();
            },
            Some(battle) if battle.number.wrapping_add(1) == init.battle_number => {
                info!(
                    battle = battle.number,
                    next = init.battle_number,
                    "init for the next battle received early, holding it"
                );
                state.pending_remote_init = Some(init);
            },
            Some(battle) => {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "init for battle {} received during battle {}, dropping it",
                    init.battle_number,
                    battle.number
                );
            },
            None => {
                info!(
                    battle = init.battle_number,
                    "init received before the battle started, holding it"
                );
                state.pending_remote_init = Some(init);
            },
        }
    }

    fn handle_input(&self, message: InputMessage) -> Result<(), LinkError> {
        let turn = match message.trailer.len() {
            0 => None,
            _ => Some(TurnData::from_slice(&message.trailer).ok_or_else(|| {
                CodecError::decode(
                    format!("turn trailer of {} bytes", message.trailer.len()),
                    CodecOperation::DecodeMessage,
                )
            })?),
        };

        let (queue, remote_player) = {
            let mut state = self.state.lock();
            let Some(battle) = state.battle.as_mut() else {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "input for tick {} received with no battle in progress, dropping it",
                    message.local_tick
                );
                return Ok(());
            };
            if battle.number != message.battle_number {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "input for battle {} received during battle {}, dropping it",
                    message.battle_number,
                    battle.number
                );
                return Ok(());
            }
            battle.latest_remote_tick = message.local_tick;
            (Arc::clone(&battle.queue), battle.local_player.opponent())
        };

        let mut input = Input::new(
            message.local_tick,
            message.remote_tick,
            message.joyflags,
            message.aux_state,
        );
        input.turn = turn;
        queue.add_input(remote_player, input, &self.shutdown)
    }

    /// Starts the next battle and opens its replay file.
    ///
    /// Returns the local seat: player 1 if we won the last battle.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] before negotiation or while a battle is in
    /// progress; [`LinkError::Io`] if the replay file cannot be created.
    pub fn new_battle(&self) -> Result<PlayerIndex, LinkError> {
        let mut state = self.state.lock();
        if state.rng.is_none() {
            return Err(LinkError::invalid_request("new_battle called before negotiation"));
        }
        if state.battle.is_some() {
            return Err(LinkError::invalid_request("battle already started"));
        }

        let number = state.battle_number.wrapping_add(1);
        let local_player = if state.won_last_battle {
            PlayerIndex::P1
        } else {
            PlayerIndex::P2
        };
        let queue = InputQueue::new(
            self.config.queue_capacity,
            local_player,
            self.config.input_delay,
        )?;

        let replay_path = self.replay_path(local_player);
        info!(path = %replay_path.display(), "writing replay");
        let replay = if self.config.compress_replays {
            FileReplayWriter::create_compressed(&replay_path)?
        } else {
            FileReplayWriter::create(&replay_path)?
        };

        let remote_init = match state.pending_remote_init.take() {
            Some(init) if init.battle_number == number => Some(init.marshaled),
            Some(init) => {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "held init was for battle {}, not {}; discarding it",
                    init.battle_number,
                    number
                );
                None
            },
            None => None,
        };

        state.battle_number = number;
        state.battle = Some(Battle {
            number,
            local_player,
            queue: Arc::new(queue),
            replay: Some(replay),
            replay_path,
            last_committed_remote: Input::neutral(),
            latest_remote_tick: Tick::ZERO,
            pending_turn: None,
            local_init: None,
            remote_init,
        });
        info!(
            battle = number,
            won_last_battle = state.won_last_battle,
            %local_player,
            "battle started"
        );
        Ok(local_player)
    }

    fn replay_path(&self, local_player: PlayerIndex) -> PathBuf {
        let dir: &Path = &self.config.replay_dir;
        if let Err(err) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %err, "could not create replay directory");
        }
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        dir.join(format!(
            "{}_p{}.{}",
            stamp,
            local_player.as_u8() + 1,
            REPLAY_EXTENSION
        ))
    }

    /// Number of the current (or last) battle; 0 before the first one.
    #[must_use]
    pub fn battle_number(&self) -> u8 {
        self.state.lock().battle_number
    }

    /// The local seat in the current battle.
    #[must_use]
    pub fn local_player(&self) -> Option<PlayerIndex> {
        self.state
            .lock()
            .battle
            .as_ref()
            .map(|battle| battle.local_player)
    }

    /// Path of the current battle's replay file.
    #[must_use]
    pub fn replay_path_of_current_battle(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .battle
            .as_ref()
            .map(|battle| battle.replay_path.clone())
    }

    /// Sends our init blob for the current battle and keeps it for the replay.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress or if the init
    /// was already sent; transport errors.
    pub fn send_init(&self, marshaled: &[u8; INIT_LEN]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        let battle = current_battle(&mut state)?;
        if battle.local_init.is_some() {
            return Err(LinkError::invalid_request("init already sent for this battle"));
        }
        let message = Message::Init(Init {
            battle_number: battle.number,
            marshaled: Box::new(*marshaled),
        });
        self.transport.send(&message.encode()?)?;
        battle.local_init = Some(Box::new(*marshaled));
        debug!(battle = battle.number, "local init sent");
        Ok(())
    }

    /// Waits for the peer's init blob for the current battle.
    ///
    /// # Errors
    ///
    /// [`LinkError::Cancelled`] if `cancel` fires first; [`LinkError::InvalidRequest`]
    /// with no battle in progress.
    pub fn remote_init(&self, cancel: &CancellationToken) -> Result<Box<[u8; INIT_LEN]>, LinkError> {
        cancel.register(&self.init_arrived);
        self.shutdown.register(&self.init_arrived);
        let mut state = self.state.lock();
        loop {
            let battle = current_battle(&mut state)?;
            if let Some(init) = &battle.remote_init {
                return Ok(init.clone());
            }
            cancel.check()?;
            self.shutdown.check()?;
            cancel.wait(&self.init_arrived.arrived, &mut state);
        }
    }

    /// Writes the replay header: the starting snapshot and both init blobs in
    /// seat order. Call once both inits are known, before the first fastforward.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] if either init is missing or the header was
    /// already written; replay I/O errors.
    pub fn record_battle_start(&self, snapshot: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        let battle = current_battle(&mut state)?;
        let (Some(local_init), Some(remote_init)) = (&battle.local_init, &battle.remote_init) else {
            return Err(LinkError::invalid_request(
                "both inits are needed before the replay header",
            ));
        };
        let local_player = battle.local_player;
        let mut inits = [&local_init[..], &remote_init[..]];
        if local_player.is_p2() {
            inits.swap(0, 1);
        }
        let (p1_init, p2_init) = (inits[0].to_vec(), inits[1].to_vec());

        let replay = battle.replay_mut()?;
        replay.write_state(local_player, snapshot)?;
        replay.write_init(PlayerIndex::P1, &p1_init)?;
        replay.write_init(PlayerIndex::P2, &p2_init)?;
        Ok(())
    }

    /// Queues a turn blob to ride on a local input once the configured commit
    /// delay has passed. Replaces any turn still waiting.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress.
    pub fn add_local_pending_turn(&self, turn: TurnData) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        let battle = current_battle(&mut state)?;
        if battle.pending_turn.is_some() {
            warn!(battle = battle.number, "replacing a turn that was never sent");
        }
        battle.pending_turn = Some(PendingTurn {
            turn,
            ticks_left: self.config.turn_commit_delay,
        });
        Ok(())
    }

    /// Sends the local input for `tick` to the peer and queues it.
    ///
    /// A pending turn that comes due on this tick is attached to the input.
    /// Blocks while the local buffer is full.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress, transport errors,
    /// and [`LinkError::Cancelled`] if `cancel` fires while blocked.
    pub fn add_local_input(
        &self,
        tick: Tick,
        joyflags: u16,
        aux_state: u8,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        let (queue, local_player, message, input) = {
            let mut state = self.state.lock();
            let battle = current_battle(&mut state)?;
            let turn = battle.take_due_turn();
            if turn.is_some() {
                debug!(battle = battle.number, %tick, "sending local turn");
            }
            let mut input = Input::new(tick, battle.latest_remote_tick, joyflags, aux_state);
            let message = Message::Input(InputMessage {
                battle_number: battle.number,
                local_tick: tick,
                remote_tick: input.remote_tick,
                joyflags,
                aux_state,
                trailer: turn
                    .as_ref()
                    .map(|turn| turn.as_bytes().to_vec())
                    .unwrap_or_default(),
            });
            input.turn = turn;
            (Arc::clone(&battle.queue), battle.local_player, message, input)
        };

        self.transport.send(&message.encode()?)?;
        queue.add_input(local_player, input, cancel)
    }

    /// Takes every newly confirmed pair and peeks the unconfirmed local inputs.
    ///
    /// Updates the last confirmed remote input, which prediction starts from.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress;
    /// [`LinkError::Desync`] if a pair's halves disagree on the tick.
    pub fn consume_inputs(&self) -> Result<(Vec<InputPair>, Vec<Input>), LinkError> {
        let mut state = self.state.lock();
        let battle = current_battle(&mut state)?;
        self.consume_locked(battle)
    }

    fn consume_locked(&self, battle: &mut Battle) -> Result<(Vec<InputPair>, Vec<Input>), LinkError> {
        let (pairs, backlog) = battle.queue.consume_and_peek_local();
        for pair in &pairs {
            if let Err(kind) = pair.check_aligned() {
                report_violation_to!(
                    &self.observer,
                    ViolationSeverity::Critical,
                    ViolationKind::InputQueue,
                    "battle {}: {}",
                    battle.number,
                    kind
                );
                return Err(kind.into());
            }
        }
        if let Some(last) = pairs.last() {
            battle.last_committed_remote = last.get(battle.local_player.opponent()).clone();
        }
        Ok((pairs, backlog))
    }

    /// The newest confirmed remote input of the current battle.
    #[must_use]
    pub fn last_committed_remote(&self) -> Option<Input> {
        self.state
            .lock()
            .battle
            .as_ref()
            .map(|battle| battle.last_committed_remote.clone())
    }

    /// Consumes the confirmed pairs and runs them, plus the predicted backlog,
    /// through `fastforwarder` from `checkpoint`. Confirmed pairs are logged to
    /// the replay.
    ///
    /// The caller owns the checkpoint; store the returned one for the next call.
    /// The session lock is released while the simulation runs, so the receive
    /// loop keeps queueing remote input meanwhile.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress, before
    /// [`record_battle_start`](Self::record_battle_start) or while another
    /// fastforward holds the replay; any [`Fastforwarder::fastforward`] error.
    /// Desyncs are also reported to the observer.
    pub fn fastforward<S: Simulation, L: GameLayout>(
        &self,
        fastforwarder: &mut Fastforwarder<S, L>,
        checkpoint: S::State,
    ) -> Result<FastforwardOutcome<S::State>, LinkError> {
        let (number, local_player, pairs, backlog, last_committed_remote, mut replay) = {
            let mut state = self.state.lock();
            let battle = current_battle(&mut state)?;
            if battle.replay.is_none() {
                return Err(LinkError::invalid_request(
                    "replay is closed or in use by another fastforward",
                ));
            }
            let (pairs, backlog) = self.consume_locked(battle)?;
            (
                battle.number,
                battle.local_player,
                pairs,
                backlog,
                battle.last_committed_remote.clone(),
                battle.replay.take(),
            )
        };
        let first_tick = pairs.first().map(InputPair::tick);

        let started = Instant::now();
        let result = match replay.as_mut() {
            Some(replay) => fastforwarder.fastforward(
                checkpoint,
                local_player,
                pairs,
                &last_committed_remote,
                &backlog,
                replay,
            ),
            None => Err(LinkError::invalid_request("replay already closed")),
        };
        let elapsed = started.elapsed();
        self.return_replay(number, replay)?;

        let budget = Duration::from_secs(1) / self.config.expected_fps;
        if result.is_ok() && elapsed > budget {
            let mut violation = Violation::new(
                ViolationSeverity::Warning,
                ViolationKind::Timing,
                format!("fastforward in battle {number} took longer than one tick"),
                concat!(file!(), ":", line!()),
            )
            .with_context("elapsed_us", elapsed.as_micros().to_string())
            .with_context("budget_us", budget.as_micros().to_string());
            if let Some(tick) = first_tick {
                violation = violation.with_tick(tick);
            }
            report_to_observer(self.observer.as_ref(), &violation);
        }

        if let Err(err @ LinkError::Desync { .. }) = &result {
            report_violation_to!(
                &self.observer,
                ViolationSeverity::Critical,
                ViolationKind::Fastforward,
                "battle {} desynced (first confirmed tick {:?}): {}",
                number,
                first_tick,
                err
            );
        }
        result
    }

    /// Hands a replay borrowed by [`fastforward`](Self::fastforward) back to its
    /// battle, or closes it if that battle ended in the meantime.
    fn return_replay(&self, number: u8, replay: Option<FileReplayWriter>) -> Result<(), LinkError> {
        let Some(replay) = replay else {
            return Ok(());
        };
        let mut state = self.state.lock();
        match state.battle.as_mut() {
            Some(battle) if battle.number == number && battle.replay.is_none() => {
                battle.replay = Some(replay);
                Ok(())
            },
            _ => {
                drop(state);
                debug!(battle = number, "battle ended during fastforward, closing its replay");
                close_replay(replay)
            },
        }
    }

    /// How far `player` trails the other seat in the current battle: the other
    /// seat's buffered inputs minus `player`'s.
    #[must_use]
    pub fn lag(&self, player: PlayerIndex) -> Option<isize> {
        self.state
            .lock()
            .battle
            .as_ref()
            .map(|battle| battle.queue.lag(player))
    }

    /// [`lag`](Self::lag) of the remote seat, positive when we are ahead of the peer.
    #[must_use]
    pub fn remote_lag(&self) -> Option<isize> {
        self.state
            .lock()
            .battle
            .as_ref()
            .map(|battle| battle.queue.lag(battle.local_player.opponent()))
    }

    /// Median of the recent round-trip samples; zero before the first pong.
    #[must_use]
    pub fn median_round_trip_delay(&self) -> Duration {
        let mut samples: Vec<Duration> = self.round_trips.lock().iter().copied().collect();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let middle = samples.len() / 2;
        let (_, median, _) = samples.select_nth_unstable(middle);
        *median
    }

    /// How many ticks ahead of the peer we may expect to run: half a round trip
    /// in ticks, plus one.
    #[must_use]
    pub fn runahead_ticks_allowed(&self) -> u32 {
        let median = self.median_round_trip_delay().as_micros();
        let ticks = median * u128::from(self.config.expected_fps) / 2 / 1_000_000 + 1;
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }

    /// Paces the tick driver: stall when we are at least twice the allowed
    /// runahead ahead of the peer, otherwise slow down one tick per second for
    /// every tick of excess lag.
    #[must_use]
    pub fn target_ticks_per_second(&self) -> TickPacing {
        let expected_fps = self.config.expected_fps;
        let Some(lag) = self.remote_lag() else {
            return TickPacing::Run {
                ticks_per_second: expected_fps,
            };
        };
        let expected = isize::try_from(self.runahead_ticks_allowed()).unwrap_or(isize::MAX);
        let limit = expected.saturating_mul(2);
        if lag >= limit {
            return TickPacing::Stall { lag, limit };
        }
        let fps = isize::try_from(expected_fps).unwrap_or(isize::MAX);
        let ticks_per_second = fps.saturating_sub(lag).saturating_add(expected).max(1);
        TickPacing::Run {
            ticks_per_second: u32::try_from(ticks_per_second).unwrap_or(u32::MAX),
        }
    }

    /// Whether we won the last battle (and so play the next one as player 1).
    #[must_use]
    pub fn won_last_battle(&self) -> bool {
        self.state.lock().won_last_battle
    }

    /// Records a battle outcome; call before [`new_battle`](Self::new_battle).
    pub fn set_won_last_battle(&self, won: bool) {
        self.state.lock().won_last_battle = won;
    }

    /// Draws from the shared RNG. Both peers must make the same draws in the
    /// same order.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] before negotiation.
    pub fn with_shared_rng<R>(&self, draw: impl FnOnce(&mut SharedRng) -> R) -> Result<R, LinkError> {
        let mut state = self.state.lock();
        let rng = state
            .rng
            .as_mut()
            .ok_or_else(|| LinkError::invalid_request("shared RNG used before negotiation"))?;
        Ok(draw(rng))
    }

    /// Ends the current battle and closes its replay.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] with no battle in progress; replay I/O errors.
    pub fn end_battle(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        let mut battle = state
            .battle
            .take()
            .ok_or_else(|| LinkError::invalid_request("no battle in progress"))?;
        info!(
            battle = battle.number,
            won_last_battle = state.won_last_battle,
            "battle ended"
        );
        drop(state);
        battle.finish()
    }

    /// Stops both loops, closes any open replay and the transport.
    ///
    /// # Errors
    ///
    /// Replay I/O errors.
    pub fn close(&self) -> Result<(), LinkError> {
        self.shutdown.cancel();
        self.transport.close();
        let battle = self.state.lock().battle.take();
        self.init_arrived.arrived.notify_all();
        match battle {
            Some(mut battle) => battle.finish(),
            None => Ok(()),
        }
    }
}

fn current_battle(state: &mut MatchState) -> Result<&mut Battle, LinkError> {
    state
        .battle
        .as_mut()
        .ok_or_else(|| LinkError::invalid_request("no battle in progress"))
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_micros()).unwrap_or(u64::MAX))
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
    use crate::handshake::ConnectionSide;
    use crate::network::transport::MemoryTransport;
    use crate::rng::Rng;
    use crate::telemetry::CollectingObserver;

    fn config(dir: &Path) -> LinkConfig {
        LinkConfig {
            input_delay: 0,
            replay_dir: dir.to_path_buf(),
            compress_replays: false,
            ..LinkConfig::default()
        }
    }

    fn ready_match(dir: &Path, won_last_battle: bool) -> (Match<MemoryTransport>, MemoryTransport) {
        let (transport, peer) = MemoryTransport::pair();
        let params = HandshakeParams::new("TEST", 1, 0, ConnectionSide::Offerer);
        let session = Match::new(transport, params, config(dir)).unwrap();
        {
            let mut state = session.state.lock();
            state.rng = Some(SharedRng::from_seed(&[7; 32]));
            state.won_last_battle = won_last_battle;
        }
        (session, peer)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (transport, _peer) = MemoryTransport::pair();
        let params = HandshakeParams::new("TEST", 1, 0, ConnectionSide::Offerer);
        let config = LinkConfig {
            expected_fps: 0,
            ..LinkConfig::default()
        };
        assert!(Match::new(transport, params, config).is_err());
    }

    #[test]
    fn battle_requires_negotiation() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _peer) = MemoryTransport::pair();
        let params = HandshakeParams::new("TEST", 1, 0, ConnectionSide::Offerer);
        let session = Match::new(transport, params, config(dir.path())).unwrap();
        assert!(matches!(
            session.new_battle(),
            Err(LinkError::InvalidRequest { .. })
        ));
        assert!(session.with_shared_rng(|rng| rng.gen_bool()).is_err());
    }

    #[test]
    fn winner_plays_as_player_one() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        assert_eq!(session.new_battle().unwrap(), PlayerIndex::P1);
        assert!(session.new_battle().is_err());
        session.end_battle().unwrap();

        session.set_won_last_battle(false);
        assert_eq!(session.new_battle().unwrap(), PlayerIndex::P2);
        assert_eq!(session.battle_number(), 2);
        let path = session.replay_path_of_current_battle().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_p2.tangoreplay"), "{name}");
    }

    #[test]
    fn early_init_is_held_for_the_next_battle() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        session.handle_init(Init {
            battle_number: 1,
            marshaled: Box::new([9; INIT_LEN]),
        });
        session.new_battle().unwrap();
        let init = session
            .remote_init(&CancellationToken::with_timeout(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(init[0], 9);
    }

    #[test]
    fn next_battle_init_survives_end_of_current_battle() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(CollectingObserver::new());
        let (session, _peer) = ready_match(dir.path(), true);
        let session = session.with_observer(observer.clone());
        session.new_battle().unwrap();
        session.handle_init(Init {
            battle_number: 2,
            marshaled: Box::new([5; INIT_LEN]),
        });
        session.end_battle().unwrap();
        session.new_battle().unwrap();

        let init = session
            .remote_init(&CancellationToken::with_timeout(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(init[0], 5);
        assert!(observer.is_empty());
    }

    #[test]
    fn init_for_unrelated_battle_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(CollectingObserver::new());
        let (session, _peer) = ready_match(dir.path(), true);
        let session = session.with_observer(observer.clone());
        session.new_battle().unwrap();
        session.handle_init(Init {
            battle_number: 7,
            marshaled: Box::new([5; INIT_LEN]),
        });
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
        assert!(session
            .remote_init(&CancellationToken::with_timeout(Duration::from_millis(20)))
            .is_err());
    }

    #[test]
    fn close_wakes_remote_init_without_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        session.new_battle().unwrap();
        let session = Arc::new(session);
        let waiting = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.remote_init(&CancellationToken::new()))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        session.close().unwrap();
        let result = waiting.join().unwrap();
        assert!(
            matches!(
                result,
                Err(LinkError::Cancelled {
                    reason: CancelReason::Aborted
                } | LinkError::InvalidRequest { .. })
            ),
            "{result:?}"
        );
    }

    #[test]
    fn remote_init_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        session.new_battle().unwrap();
        let err = session
            .remote_init(&CancellationToken::with_timeout(Duration::from_millis(20)))
            .unwrap_err();
        assert!(err.is_connection_loss());
    }

    #[test]
    fn stale_input_is_dropped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(CollectingObserver::new());
        let (session, _peer) = ready_match(dir.path(), true);
        let session = session.with_observer(observer.clone());

        let input = |battle_number| InputMessage {
            battle_number,
            local_tick: Tick::ZERO,
            remote_tick: Tick::ZERO,
            joyflags: 0xfc00,
            aux_state: 0,
            trailer: Vec::new(),
        };
        session.handle_input(input(1)).unwrap();
        assert_eq!(observer.len(), 1);

        session.new_battle().unwrap();
        session.handle_input(input(7)).unwrap();
        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
        assert_eq!(session.remote_lag(), Some(0));

        session.handle_input(input(1)).unwrap();
        assert_eq!(session.remote_lag(), Some(-1));
        assert_eq!(session.lag(PlayerIndex::P2), Some(-1));
        assert_eq!(session.lag(PlayerIndex::P1), Some(1));
    }

    #[test]
    fn malformed_turn_trailer_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        session.new_battle().unwrap();
        let err = session
            .handle_input(InputMessage {
                battle_number: 1,
                local_tick: Tick::ZERO,
                remote_tick: Tick::ZERO,
                joyflags: 0,
                aux_state: 0,
                trailer: vec![0; 3],
            })
            .unwrap_err();
        assert!(matches!(err, LinkError::Codec(_)));
    }

    #[test]
    fn pending_turn_rides_the_input_once_due() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, peer) = MemoryTransport::pair();
        let params = HandshakeParams::new("TEST", 1, 0, ConnectionSide::Offerer);
        let config = LinkConfig {
            turn_commit_delay: 3,
            ..config(dir.path())
        };
        let session = Match::new(transport, params, config).unwrap();
        session.state.lock().rng = Some(SharedRng::from_seed(&[1; 32]));
        session.new_battle().unwrap();
        session
            .add_local_pending_turn(TurnData::new([0x42; crate::TURN_DATA_LEN]))
            .unwrap();

        let token = CancellationToken::new();
        let mut trailers = Vec::new();
        for tick in 0..5 {
            session
                .add_local_input(Tick::new(tick), 0xfc00, 0, &token)
                .unwrap();
            match Message::decode(&peer.recv(&token).unwrap()).unwrap() {
                Message::Input(input) => trailers.push(input.trailer.len()),
                other => panic!("expected Input, got {other:?}"),
            }
        }
        assert_eq!(trailers, vec![0, 0, crate::TURN_DATA_LEN, 0, 0]);
    }

    #[test]
    fn median_and_runahead_follow_samples() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        assert_eq!(session.median_round_trip_delay(), Duration::ZERO);
        assert_eq!(session.runahead_ticks_allowed(), 1);

        for ms in [100, 10, 200, 50, 120] {
            session.record_round_trip(Duration::from_millis(ms));
        }
        assert_eq!(session.median_round_trip_delay(), Duration::from_millis(100));
        // 100ms * 60 / 2 = 3 ticks, plus one.
        assert_eq!(session.runahead_ticks_allowed(), 4);
    }

    #[test]
    fn round_trip_window_keeps_newest_samples() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        for ms in 0..20 {
            session.record_round_trip(Duration::from_millis(ms));
        }
        assert_eq!(session.round_trips.lock().len(), 9);
        assert_eq!(session.median_round_trip_delay(), Duration::from_millis(15));
    }

    #[test]
    fn pacing_stalls_when_far_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        assert_eq!(
            session.target_ticks_per_second(),
            TickPacing::Run {
                ticks_per_second: 60
            }
        );
        session.new_battle().unwrap();

        let token = CancellationToken::new();
        session
            .add_local_input(Tick::new(0), 0xfc00, 0, &token)
            .unwrap();
        // One tick ahead, within the allowance of one.
        assert_eq!(
            session.target_ticks_per_second(),
            TickPacing::Run {
                ticks_per_second: 60
            }
        );
        session
            .add_local_input(Tick::new(1), 0xfc00, 0, &token)
            .unwrap();
        assert_eq!(
            session.target_ticks_per_second(),
            TickPacing::Stall { lag: 2, limit: 2 }
        );
    }

    #[test]
    fn close_stops_the_receive_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = ready_match(dir.path(), true);
        let session = Arc::new(session);
        let receiver = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.run_receive_loop())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        session.close().unwrap();
        receiver.join().unwrap().unwrap();
    }
}
