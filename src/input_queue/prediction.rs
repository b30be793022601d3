//! Remote-input prediction strategies for rollback.
//!
//! # Determinism Requirement
//!
//! Predictions only ever feed the dirty state, which is thrown away on the next
//! tick, so they never have to match the peer. They MUST still be deterministic
//! for a given set of arguments, or two fastforwards over the same inputs would
//! show the player different futures.
//!
//! # Built-in Strategies
//!
//! - [`HoldButtons`]: keep the remote's aux state and held A/B buttons (default)
//! - [`RepeatLastConfirmed`]: repeat the remote's last confirmed joypad flags
//! - [`BlankPrediction`]: assume nothing is pressed

use crate::input::{keys, Input};

/// Guesses the remote player's input for a tick whose real input has not arrived.
///
/// Implementations receive the local player's real input for that tick (whose
/// ticks the guess must copy) and the remote player's last confirmed input.
///
/// # Custom Strategies
///
/// ```
/// use rollback_link::{Input, PredictionStrategy};
///
/// /// Assume the opponent is always holding "up".
/// struct HoldUp;
///
/// impl PredictionStrategy for HoldUp {
///     fn predict(&self, local: &Input, last_confirmed_remote: &Input) -> Input {
///         Input::new(
///             local.local_tick,
///             local.remote_tick,
///             rollback_link::input::keys::NEUTRAL | rollback_link::input::keys::UP,
///             last_confirmed_remote.aux_state,
///         )
///     }
/// }
/// ```
pub trait PredictionStrategy: Send + Sync {
    /// Predicts the remote input paired with `local`.
    ///
    /// The result must carry `local.local_tick`, otherwise the pair fails its
    /// alignment check.
    fn predict(&self, local: &Input, last_confirmed_remote: &Input) -> Input;
}

/// The default strategy: the remote player keeps doing what they were last
/// confirmed doing, but only for the buttons that are held rather than tapped.
///
/// The aux state is copied verbatim and the A and B bits carried forward; every
/// other button reads as released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HoldButtons;

impl PredictionStrategy for HoldButtons {
    fn predict(&self, local: &Input, last_confirmed_remote: &Input) -> Input {
        Input::new(
            local.local_tick,
            local.remote_tick,
            last_confirmed_remote.joyflags & keys::HELD,
            last_confirmed_remote.aux_state,
        )
    }
}

/// Repeats the remote player's last confirmed joypad flags and aux state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepeatLastConfirmed;

impl PredictionStrategy for RepeatLastConfirmed {
    fn predict(&self, local: &Input, last_confirmed_remote: &Input) -> Input {
        Input::new(
            local.local_tick,
            local.remote_tick,
            last_confirmed_remote.joyflags,
            last_confirmed_remote.aux_state,
        )
    }
}

/// Predicts a neutral joypad with no aux state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlankPrediction;

impl PredictionStrategy for BlankPrediction {
    fn predict(&self, local: &Input, _last_confirmed_remote: &Input) -> Input {
        Input::new(local.local_tick, local.remote_tick, keys::NEUTRAL, 0)
    }
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
    use crate::input::TurnData;
    use crate::Tick;

    fn local() -> Input {
        Input::new(Tick::new(12), Tick::new(9), keys::NEUTRAL | keys::LEFT, 3)
    }

    fn remote() -> Input {
        Input::new(
            Tick::new(7),
            Tick::new(7),
            keys::NEUTRAL | keys::A | keys::B | keys::UP,
            5,
        )
        .with_turn(TurnData::new([1; crate::TURN_DATA_LEN]))
    }

    #[test]
    fn hold_buttons_keeps_only_a_and_b() {
        let predicted = HoldButtons.predict(&local(), &remote());
        assert_eq!(predicted.local_tick, Tick::new(12));
        assert_eq!(predicted.remote_tick, Tick::new(9));
        assert_eq!(predicted.joyflags, keys::A | keys::B);
        assert_eq!(predicted.aux_state, 5);
        assert!(predicted.turn.is_none(), "turns are never predicted");
    }

    #[test]
    fn hold_buttons_from_neutral_presses_nothing() {
        let predicted = HoldButtons.predict(&local(), &Input::neutral());
        assert_eq!(predicted.joyflags, 0);
        assert_eq!(predicted.aux_state, 0);
    }

    #[test]
    fn repeat_last_confirmed_copies_flags() {
        let predicted = RepeatLastConfirmed.predict(&local(), &remote());
        assert_eq!(predicted.joyflags, remote().joyflags);
        assert_eq!(predicted.local_tick, Tick::new(12));
    }

    #[test]
    fn blank_prediction_ignores_remote() {
        let predicted = BlankPrediction.predict(&local(), &remote());
        assert_eq!(predicted.joyflags, keys::NEUTRAL);
        assert_eq!(predicted.aux_state, 0);
        assert_eq!(predicted.local_tick, Tick::new(12));
    }
}
