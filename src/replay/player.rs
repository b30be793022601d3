//! Playback of a recorded battle.
//!
//! A [`Replayer`] drives a simulation from a [`Replay`]: it starts from the
//! recorded snapshot, applies both init blobs at the first input commit, then
//! injects one recorded pair per tick through the same intercept path the
//! rollback engine uses. After each pair the game RNG state is compared with
//! the one recorded alongside it; the first difference is a desync.

use tracing::{debug, info};

use super::Replay;
use crate::error::{DesyncKind, LinkError};
use crate::fastforward::{apply_pair, DEFAULT_MAX_FRAMES_PER_TICK};
use crate::simulation::{Cpu, GameLayout, InterceptHandler, Simulation};
use crate::input::InputPair;
use crate::{PlayerIndex, Tick};

/// Joypad flags with no button held.
const NEUTRAL_JOYFLAGS: u16 = 0xfc00;

/// Replays a [`Replay`] through a [`Simulation`], checking recorded RNG states.
///
/// ```ignore
/// let replay = Replay::open("battle.tangoreplay")?;
/// let start = my_state_from_bytes(&replay.state);
/// let mut replayer = Replayer::new(sim, layout, replay);
/// replayer.reset(&start)?;
/// replayer.run_to_end()?;
/// ```
pub struct Replayer<S: Simulation, L: GameLayout> {
    sim: S,
    layout: L,
    replay: Replay,
    next: usize,
    inits_pending: bool,
    max_frames_per_tick: u32,
}

impl<S: Simulation, L: GameLayout> std::fmt::Debug for Replayer<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("local_player", &self.replay.local_player)
            .field("next", &self.next)
            .field("records", &self.replay.input_pairs.len())
            .finish_non_exhaustive()
    }
}

impl<S: Simulation, L: GameLayout> Replayer<S, L> {
    /// Takes ownership of a simulation and registers the layout's intercepts on
    /// it. Call [`reset`](Self::reset) before stepping.
    pub fn new(mut sim: S, layout: L, replay: Replay) -> Self {
        sim.register_intercept(layout.input_commit_address());
        for &address in layout.side_query_addresses() {
            sim.register_intercept(address);
        }
        Self {
            sim,
            layout,
            replay,
            next: 0,
            inits_pending: true,
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
        }
    }

    /// Sets how many frames may pass without an input commit before a step fails.
    #[must_use]
    pub fn with_max_frames_per_tick(mut self, frames: u32) -> Self {
        self.max_frames_per_tick = frames.max(1);
        self
    }

    /// Rewinds to the start: loads `start` (the host's decoding of
    /// [`Replay::state`]) and queues the init blobs for the first tick.
    ///
    /// # Errors
    ///
    /// [`LinkError::Desync`] if the simulation rejects the state.
    pub fn reset(&mut self, start: &S::State) -> Result<(), LinkError> {
        if !self.sim.load_state(start) {
            return Err(DesyncKind::StateLoadFailed.into());
        }
        self.next = 0;
        self.inits_pending = true;
        debug!(records = self.replay.input_pairs.len(), "replay rewound");
        Ok(())
    }

    /// Runs frames until the next recorded pair has been injected.
    ///
    /// Returns the replayed tick, or `None` once every record was played.
    ///
    /// # Errors
    ///
    /// [`LinkError::Desync`] if the simulation is at another tick, its RNG
    /// state differs from the recorded one, or the input intercept never fires.
    pub fn step(&mut self) -> Result<Option<Tick>, LinkError> {
        let (Some(pair), Some(&recorded)) = (
            self.replay.input_pairs.get(self.next),
            self.replay.rng_states.get(self.next),
        ) else {
            return Ok(None);
        };
        let mut feeder = Feeder {
            layout: &self.layout,
            replay: &self.replay,
            pair,
            recorded,
            inits_pending: self.inits_pending,
            outcome: None,
        };
        for _ in 0..self.max_frames_per_tick {
            self.sim.run_frame(&mut feeder);
            if let Some(outcome) = feeder.outcome.take() {
                let tick = outcome?;
                self.inits_pending = false;
                self.next += 1;
                return Ok(Some(tick));
            }
        }
        Err(DesyncKind::InterceptStarved {
            frames: self.max_frames_per_tick,
        }
        .into())
    }

    /// Plays every remaining record, returning how many were played.
    ///
    /// # Errors
    ///
    /// The first [`step`](Self::step) error.
    pub fn run_to_end(&mut self) -> Result<usize, LinkError> {
        let mut played = 0;
        while self.step()?.is_some() {
            played += 1;
        }
        info!(
            played,
            truncated = self.replay.truncated,
            "replay finished"
        );
        Ok(played)
    }

    /// Records not yet played.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.replay.input_pairs.len().saturating_sub(self.next)
    }

    /// The recording player's joypad flags for the next tick, or neutral flags
    /// once the replay is over.
    #[must_use]
    pub fn peek_local_joyflags(&self) -> u16 {
        self.replay
            .input_pairs
            .get(self.next)
            .map_or(NEUTRAL_JOYFLAGS, |pair| {
                pair.get(self.replay.local_player).joyflags
            })
    }

    /// The replay being played.
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }

    /// The simulation, for presenting or snapshotting the current frame.
    #[must_use]
    pub const fn simulation(&self) -> &S {
        &self.sim
    }

    /// Gives the simulation back.
    #[must_use]
    pub fn into_simulation(self) -> S {
        self.sim
    }
}

/// Intercept handler for one replayed tick.
struct Feeder<'a, L> {
    layout: &'a L,
    replay: &'a Replay,
    pair: &'a InputPair,
    recorded: u32,
    inits_pending: bool,
    outcome: Option<Result<Tick, LinkError>>,
}

impl<L: GameLayout> Feeder<'_, L> {
    fn feed(&mut self, cpu: &mut dyn Cpu) -> Result<Tick, LinkError> {
        if self.inits_pending {
            for (player, init) in PlayerIndex::ALL.into_iter().zip(&self.replay.init) {
                self.layout.write_turn(cpu, player, init);
            }
            self.inits_pending = false;
        }

        let tick = apply_pair(self.layout, cpu, self.pair)?;
        let simulation = self.layout.rng_state(cpu);
        if self.recorded != simulation {
            return Err(DesyncKind::RngStateMismatch {
                tick,
                recorded: self.recorded,
                simulation,
            }
            .into());
        }
        Ok(tick)
    }
}

impl<L: GameLayout> InterceptHandler for Feeder<'_, L> {
    fn on_intercept(&mut self, address: u32, cpu: &mut dyn Cpu) {
        if address == self.layout.input_commit_address() {
            if self.outcome.is_none() {
                self.outcome = Some(self.feed(cpu));
            }
        } else if self.layout.side_query_addresses().contains(&address) {
            self.layout
                .answer_side_query(cpu, self.replay.local_player);
        }
    }
}
