//! Player inputs and tick-aligned input pairs.

use crate::{PlayerIndex, Tick};

/// Size of a turn blob attached to an input, and of a battle's init blob.
pub const TURN_DATA_LEN: usize = 0x100;

/// Joypad bit masks as the simulation reads them.
pub mod keys {
    /// A button.
    pub const A: u16 = 1 << 0;
    /// B button.
    pub const B: u16 = 1 << 1;
    /// Select button.
    pub const SELECT: u16 = 1 << 2;
    /// Start button.
    pub const START: u16 = 1 << 3;
    /// D-pad right.
    pub const RIGHT: u16 = 1 << 4;
    /// D-pad left.
    pub const LEFT: u16 = 1 << 5;
    /// D-pad up.
    pub const UP: u16 = 1 << 6;
    /// D-pad down.
    pub const DOWN: u16 = 1 << 7;
    /// Right shoulder.
    pub const R: u16 = 1 << 8;
    /// Left shoulder.
    pub const L: u16 = 1 << 9;
    /// Flags of a joypad with nothing pressed. The unused high bits read as set.
    pub const NEUTRAL: u16 = 0xfc00;
    /// Buttons a predicted remote input keeps holding.
    pub const HELD: u16 = A | B;
}

/// A fixed-size blob a player attaches to an input at most once every several
/// dozen ticks (a marshaled sub-system snapshot).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TurnData(Box<[u8; TURN_DATA_LEN]>);

impl TurnData {
    /// Wraps an owned blob.
    #[must_use]
    pub fn new(bytes: [u8; TURN_DATA_LEN]) -> Self {
        Self(Box::new(bytes))
    }

    /// Copies a blob out of a slice, returning `None` unless it is exactly
    /// [`TURN_DATA_LEN`] bytes long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; TURN_DATA_LEN] = bytes.try_into().ok()?;
        Some(Self::new(array))
    }

    /// Borrows the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TURN_DATA_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for TurnData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 256 bytes of hex drowns everything else in a log line.
        let head = self.0.iter().take(8).fold(String::new(), |mut out, byte| {
            use std::fmt::Write as _;
            let _ = write!(out, "{:02x}", byte);
            out
        });
        write!(f, "TurnData({}..)", head)
    }
}

/// One player's input for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Input {
    /// The tick this input applies to.
    pub local_tick: Tick,
    /// The last tick the sender had seen from its peer when it produced this input.
    pub remote_tick: Tick,
    /// Joypad button mask.
    pub joyflags: u16,
    /// Auxiliary 8-bit state (the custom-screen state in link battles).
    pub aux_state: u8,
    /// Optional turn blob.
    pub turn: Option<TurnData>,
}

impl Input {
    /// Creates an input with no turn attached.
    #[must_use]
    pub const fn new(local_tick: Tick, remote_tick: Tick, joyflags: u16, aux_state: u8) -> Self {
        Self {
            local_tick,
            remote_tick,
            joyflags,
            aux_state,
            turn: None,
        }
    }

    /// The input a player is assumed to have before anything was confirmed.
    #[must_use]
    pub const fn neutral() -> Self {
        Self::new(Tick::ZERO, Tick::ZERO, keys::NEUTRAL, 0)
    }

    /// Attaches a turn blob.
    #[must_use]
    pub fn with_turn(mut self, turn: TurnData) -> Self {
        self.turn = Some(turn);
        self
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Both players' inputs for one tick, indexed by [`PlayerIndex`].
///
/// Once paired, both halves share the same `local_tick`; [`InputPair::check_aligned`]
/// verifies that.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputPair {
    inputs: [Input; 2],
}

impl InputPair {
    /// Builds a pair from player 1's and player 2's inputs.
    #[must_use]
    pub const fn new(p1: Input, p2: Input) -> Self {
        Self { inputs: [p1, p2] }
    }

    /// Builds a pair from the local and remote inputs, placing each in its seat.
    #[must_use]
    pub fn from_local_remote(local_player: PlayerIndex, local: Input, remote: Input) -> Self {
        if local_player.is_p2() {
            Self::new(remote, local)
        } else {
            Self::new(local, remote)
        }
    }

    /// Borrows a player's input.
    #[must_use]
    pub const fn get(&self, player: PlayerIndex) -> &Input {
        &self.inputs[player.as_usize()]
    }

    /// Player 1's input.
    #[must_use]
    pub const fn p1(&self) -> &Input {
        &self.inputs[0]
    }

    /// Player 2's input.
    #[must_use]
    pub const fn p2(&self) -> &Input {
        &self.inputs[1]
    }

    /// The tick of player 1's half.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.inputs[0].local_tick
    }

    /// Returns a desync error unless both halves carry the same tick.
    pub fn check_aligned(&self) -> Result<Tick, crate::DesyncKind> {
        let (p1, p2) = (self.inputs[0].local_tick, self.inputs[1].local_tick);
        if p1 == p2 {
            Ok(p1)
        } else {
            Err(crate::DesyncKind::PairTickMismatch { p1, p2 })
        }
    }

    /// Consumes the pair, returning both inputs in seat order.
    #[must_use]
    pub fn into_inner(self) -> [Input; 2] {
        self.inputs
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

    #[test]
    fn pair_places_local_in_its_seat() {
        let local = Input::new(Tick::new(3), Tick::new(1), 0xfc10, 0);
        let remote = Input::new(Tick::new(3), Tick::new(2), 0xfc20, 0);

        let pair = InputPair::from_local_remote(PlayerIndex::P2, local.clone(), remote.clone());
        assert_eq!(pair.p1(), &remote);
        assert_eq!(pair.p2(), &local);
        assert_eq!(pair.get(PlayerIndex::P2), &local);

        let pair = InputPair::from_local_remote(PlayerIndex::P1, local.clone(), remote);
        assert_eq!(pair.p1(), &local);
    }

    #[test]
    fn misaligned_pair_is_a_desync() {
        let pair = InputPair::new(
            Input::new(Tick::new(4), Tick::ZERO, 0, 0),
            Input::new(Tick::new(5), Tick::ZERO, 0, 0),
        );
        assert_eq!(
            pair.check_aligned(),
            Err(crate::DesyncKind::PairTickMismatch {
                p1: Tick::new(4),
                p2: Tick::new(5),
            })
        );
    }

    #[test]
    fn turn_data_requires_exact_length() {
        assert!(TurnData::from_slice(&[0u8; TURN_DATA_LEN]).is_some());
        assert!(TurnData::from_slice(&[0u8; TURN_DATA_LEN - 1]).is_none());
        assert!(TurnData::from_slice(&[0u8; TURN_DATA_LEN + 1]).is_none());
        assert!(TurnData::from_slice(&[]).is_none());
    }

    #[test]
    fn turn_data_debug_is_abbreviated() {
        let turn = TurnData::new([0xab; TURN_DATA_LEN]);
        assert_eq!(format!("{:?}", turn), "TurnData(abababababababab..)");
    }

    #[test]
    fn neutral_input_has_no_buttons() {
        let input = Input::default();
        assert_eq!(input.joyflags, keys::NEUTRAL);
        assert_eq!(input.joyflags & keys::HELD, 0);
        assert!(input.turn.is_none());
    }
}
