//! The rollback engine.
//!
//! A [`Fastforwarder`] owns a second, offline instance of the simulation. Each
//! call rewinds it to the last confirmed checkpoint, replays the newly confirmed
//! input pairs (logging each one to the replay), snapshots the result as the new
//! checkpoint, and then plays the local player's unconfirmed inputs against
//! predicted remote input to produce the dirty state the live simulation adopts.
//!
//! # Dirty state and the held-back pair
//!
//! The newest predicted pair is not run. The dirty state is the state just
//! before it, and the pair is returned in [`FastforwardOutcome::last_predicted`]
//! for the live simulation to run itself, so the frame it presents is one it
//! actually executed (audio and video included).
//!
//! ```text
//! checkpoint --confirmed--> new checkpoint --predicted[..n-1]--> dirty --predicted[n-1]--> (live)
//! ```

use std::io::Write;

use smallvec::SmallVec;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::error::{DesyncKind, LinkError};
use crate::input::{Input, InputPair};
use crate::input_queue::{HoldButtons, PredictionStrategy};
use crate::replay::ReplayWriter;
use crate::simulation::{Cpu, GameLayout, InterceptHandler, Simulation};
use crate::{PlayerIndex, Tick};

/// Frames a simulation may run without reaching the input-commit intercept
/// before the engine gives up.
pub const DEFAULT_MAX_FRAMES_PER_TICK: u32 = 8;

/// The result of one [`Fastforwarder::fastforward`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastforwardOutcome<St> {
    /// State after every confirmed pair; the next call's starting point.
    pub checkpoint: St,
    /// State after every predicted pair but the last.
    pub dirty: St,
    /// The newest predicted pair, for the live simulation to run from `dirty`.
    /// `None` when there was no unconfirmed local input.
    pub last_predicted: Option<InputPair>,
}

/// Re-simulates from a checkpoint to absorb newly confirmed input.
///
/// Calls take `&mut self`: the offline simulation can only run one
/// fastforward at a time.
pub struct Fastforwarder<S: Simulation, L: GameLayout> {
    sim: S,
    layout: L,
    prediction: Box<dyn PredictionStrategy>,
    max_frames_per_tick: u32,
    last_duration: Duration,
}

impl<S: Simulation, L: GameLayout> std::fmt::Debug for Fastforwarder<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fastforwarder")
            .field("max_frames_per_tick", &self.max_frames_per_tick)
            .field("last_duration", &self.last_duration)
            .finish_non_exhaustive()
    }
}

impl<S: Simulation, L: GameLayout> Fastforwarder<S, L> {
    /// Takes ownership of an offline simulation and registers the layout's
    /// intercepts on it. Remote input is predicted with [`HoldButtons`].
    pub fn new(mut sim: S, layout: L) -> Self {
        sim.register_intercept(layout.input_commit_address());
        for &address in layout.side_query_addresses() {
            sim.register_intercept(address);
        }
        Self {
            sim,
            layout,
            prediction: Box::new(HoldButtons),
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
            last_duration: Duration::ZERO,
        }
    }

    /// Replaces the remote-input prediction strategy.
    #[must_use]
    pub fn with_prediction(mut self, prediction: impl PredictionStrategy + 'static) -> Self {
        self.prediction = Box::new(prediction);
        self
    }

    /// Sets how many frames may pass without an input commit before a tick fails
    /// with [`DesyncKind::InterceptStarved`]. Clamped to at least 1.
    #[must_use]
    pub fn with_max_frames_per_tick(mut self, frames: u32) -> Self {
        self.max_frames_per_tick = frames.max(1);
        self
    }

    /// How long the last successful fastforward took.
    #[must_use]
    pub const fn last_duration(&self) -> Duration {
        self.last_duration
    }

    /// The offline simulation.
    #[must_use]
    pub const fn simulation(&self) -> &S {
        &self.sim
    }

    /// Re-simulates from `checkpoint`.
    ///
    /// `confirmed` are the newly completed pairs in tick order, starting at the
    /// checkpoint's tick. `backlog` is the local player's unconfirmed input, each
    /// paired with a remote input predicted from `last_confirmed_remote`.
    ///
    /// With no confirmed pairs the checkpoint is returned unchanged; with no
    /// backlog the dirty state equals the new checkpoint.
    ///
    /// # Errors
    ///
    /// [`LinkError::Desync`] if the simulation rejects the checkpoint or cannot
    /// snapshot, a pair's halves disagree on the tick, a pair's tick is not the
    /// simulation's, or the input intercept is never reached. Replay write
    /// failures are returned as-is.
    pub fn fastforward<W: Write>(
        &mut self,
        checkpoint: S::State,
        local_player: PlayerIndex,
        confirmed: Vec<InputPair>,
        last_confirmed_remote: &Input,
        backlog: &[Input],
        replay: &mut ReplayWriter<W>,
    ) -> Result<FastforwardOutcome<S::State>, LinkError> {
        let started = Instant::now();

        let mut predicted: SmallVec<[InputPair; 8]> = backlog
            .iter()
            .map(|local| {
                let remote = self.prediction.predict(local, last_confirmed_remote);
                InputPair::from_local_remote(local_player, local.clone(), remote)
            })
            .collect();
        let last_predicted = predicted.pop();

        if confirmed.is_empty() && predicted.is_empty() {
            let dirty = checkpoint.clone();
            return Ok(FastforwardOutcome {
                checkpoint,
                dirty,
                last_predicted,
            });
        }

        if !self.sim.load_state(&checkpoint) {
            return Err(DesyncKind::StateLoadFailed.into());
        }

        let committed = confirmed.len();
        let new_checkpoint = if confirmed.is_empty() {
            checkpoint
        } else {
            for pair in confirmed {
                self.run_tick(pair, local_player, Some(&mut *replay))?;
            }
            self.save()?
        };

        let dirty = if predicted.is_empty() {
            new_checkpoint.clone()
        } else {
            for pair in predicted.drain(..) {
                self.run_tick(pair, local_player, None::<&mut ReplayWriter<W>>)?;
            }
            self.save()?
        };

        self.last_duration = started.elapsed();
        trace!(
            committed,
            predicted = backlog.len(),
            elapsed_us = self.last_duration.as_micros() as u64,
            "fastforward complete"
        );
        Ok(FastforwardOutcome {
            checkpoint: new_checkpoint,
            dirty,
            last_predicted,
        })
    }

    fn save(&mut self) -> Result<S::State, LinkError> {
        self.sim
            .save_state()
            .ok_or_else(|| DesyncKind::StateSaveFailed.into())
    }

    /// Runs frames until `pair` has been injected.
    fn run_tick<W: Write>(
        &mut self,
        pair: InputPair,
        local_player: PlayerIndex,
        replay: Option<&mut ReplayWriter<W>>,
    ) -> Result<(), LinkError> {
        let mut injector = Injector {
            layout: &self.layout,
            local_player,
            pending: Some(pair),
            replay,
            error: None,
        };
        for _ in 0..self.max_frames_per_tick {
            self.sim.run_frame(&mut injector);
            if let Some(err) = injector.error.take() {
                return Err(err);
            }
            if injector.pending.is_none() {
                return Ok(());
            }
        }
        Err(DesyncKind::InterceptStarved {
            frames: self.max_frames_per_tick,
        }
        .into())
    }
}

struct Injector<'a, L, W: Write> {
    layout: &'a L,
    local_player: PlayerIndex,
    pending: Option<InputPair>,
    replay: Option<&'a mut ReplayWriter<W>>,
    error: Option<LinkError>,
}

impl<L: GameLayout, W: Write> Injector<'_, L, W> {
    fn inject(&mut self, pair: &InputPair, cpu: &mut dyn Cpu) -> Result<(), LinkError> {
        apply_pair(self.layout, cpu, pair)?;
        if let Some(replay) = self.replay.as_deref_mut() {
            replay.write_input(self.layout.rng_state(cpu), pair)?;
        }
        Ok(())
    }
}

/// Writes both halves of `pair` into the paused simulation, after checking that
/// it is at the pair's tick.
pub(crate) fn apply_pair<L: GameLayout>(
    layout: &L,
    cpu: &mut dyn Cpu,
    pair: &InputPair,
) -> Result<Tick, LinkError> {
    let tick = pair.check_aligned()?;
    let simulation = layout.tick(cpu);
    if tick != simulation {
        return Err(DesyncKind::SimulationTickMismatch {
            input: tick,
            simulation,
        }
        .into());
    }

    for player in PlayerIndex::ALL {
        let input = pair.get(player);
        layout.write_input(cpu, player, input.joyflags, input.aux_state);
        if let Some(turn) = &input.turn {
            layout.write_turn(cpu, player, turn.as_bytes());
            debug!(%player, %tick, "turn committed");
        }
    }
    Ok(tick)
}

impl<L: GameLayout, W: Write> InterceptHandler for Injector<'_, L, W> {
    fn on_intercept(&mut self, address: u32, cpu: &mut dyn Cpu) {
        if address == self.layout.input_commit_address() {
            if self.error.is_some() {
                return;
            }
            if let Some(pair) = self.pending.take() {
                if let Err(err) = self.inject(&pair, cpu) {
                    self.error = Some(err);
                }
            }
        } else if self.layout.side_query_addresses().contains(&address) {
            self.layout.answer_side_query(cpu, self.local_player);
        }
    }
}
