//! # rollback-link
//!
//! Two-player rollback synchronization for deterministic, frame-stepped simulations
//! (typically an emulator core running a link-cable game).
//!
//! Each peer runs its simulation with local input immediately and predicts the
//! remote player's input. When real remote input arrives, the [`Fastforwarder`]
//! rewinds a private simulation instance to the last confirmed checkpoint, replays
//! the confirmed input pairs (logging them to the replay), and then replays the
//! local player's unconfirmed inputs against predicted remote input to produce a
//! corrected "dirty" state for the visible simulation.
//!
//! The crate is organised leaves-first:
//!
//! - [`network::codec`] and [`network::messages`]: the tagged, little-endian wire format
//! - [`network::transport`]: the ordered message channel the session runs over
//! - [`handshake`]: commit-reveal negotiation of a shared random seed
//! - [`input_queue`]: per-player input buffers that pair same-tick inputs
//! - [`fastforward`]: the rollback engine
//! - [`replay`]: the append-only replay log and its reader
//! - [`session`]: the [`Match`] controller tying everything together
//!
//! The simulation itself is a collaborator described by the traits in [`simulation`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::LinkConfig;
pub use error::{CancelReason, DesyncKind, LinkError, MismatchKind};
pub use fastforward::{FastforwardOutcome, Fastforwarder};
pub use handshake::{
    negotiate, ConnectionSide, Handshake, HandshakeParams, HandshakeState, Negotiated, SharedRng,
};
pub use input::{Input, InputPair, TurnData, TURN_DATA_LEN};
pub use input_queue::{
    BlankPrediction, CancellationToken, HoldButtons, InputQueue, PredictionStrategy,
    RepeatLastConfirmed,
};
pub use network::messages::Message;
pub use network::transport::{MemoryTransport, Transport};
pub use replay::{FileReplayWriter, Replay, ReplayWriter, Replayer};
pub use session::{Match, TickPacing};
pub use simulation::{Cpu, GameLayout, InterceptHandler, MemoryWidth, Simulation};

pub mod config;
pub mod error;
pub mod fastforward;
pub mod handshake;
pub mod input;
pub mod input_queue;
pub mod replay;
/// Deterministic PCG32 generator shared by both peers once the handshake completes.
pub mod rng;
pub mod session;
pub mod simulation;
pub mod telemetry;
/// Wire-level pieces: message types, their binary codec, and the transport seam.
pub mod network {
    /// Binary codec for wire messages.
    ///
    /// Every frame is a one-byte tag followed by a fixed-layout little-endian payload.
    pub mod codec;
    pub mod messages;
    pub mod transport;
}

/// A simulation tick: one discrete step of the deterministic simulation.
///
/// Ticks count up from the battle start checkpoint and are carried on the wire
/// as little-endian `u32`.
///
/// # Examples
///
/// ```
/// use rollback_link::Tick;
///
/// let tick = Tick::new(41);
/// assert_eq!((tick + 1).as_u32(), 42);
/// assert_eq!(Tick::new(10) - Tick::new(12), -2);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(u32);

impl Tick {
    /// The first tick of a battle.
    pub const ZERO: Self = Self(0);

    /// Creates a new `Tick` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(tick: u32) -> Self {
        Self(tick)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the tick after this one, wrapping at `u32::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Tick {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u32> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl std::ops::Sub<Self> for Tick {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        i64::from(self.0) - i64::from(rhs.0)
    }
}

impl From<u32> for Tick {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Tick> for u32 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

/// One of the two seats in a session.
///
/// Player 1 is index 0 and player 2 is index 1. Which seat the local peer takes
/// is decided per battle (the loser of the previous battle becomes player 2).
///
/// # Examples
///
/// ```
/// use rollback_link::PlayerIndex;
///
/// assert_eq!(PlayerIndex::P1.opponent(), PlayerIndex::P2);
/// assert_eq!(PlayerIndex::new(1), Some(PlayerIndex::P2));
/// assert_eq!(PlayerIndex::new(2), None);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
)]
pub struct PlayerIndex(u8);

impl PlayerIndex {
    /// Player 1 (index 0).
    pub const P1: Self = Self(0);
    /// Player 2 (index 1).
    pub const P2: Self = Self(1);
    /// Both seats in index order.
    pub const ALL: [Self; 2] = [Self::P1, Self::P2];

    /// Creates a `PlayerIndex`, returning `None` for anything other than 0 or 1.
    #[inline]
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::P1),
            1 => Some(Self::P2),
            _ => None,
        }
    }

    /// Returns the other seat.
    #[inline]
    #[must_use]
    pub const fn opponent(self) -> Self {
        Self(1 - self.0)
    }

    /// Returns the index as `u8`.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the index as `usize`, suitable for indexing per-player arrays.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` for player 2.
    #[inline]
    #[must_use]
    pub const fn is_p2(self) -> bool {
        self.0 == 1
    }
}

impl std::fmt::Display for PlayerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0 + 1)
    }
}

impl From<PlayerIndex> for usize {
    #[inline]
    fn from(index: PlayerIndex) -> Self {
        index.as_usize()
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
    fn tick_arithmetic() {
        let mut tick = Tick::new(5);
        tick += 3;
        assert_eq!(tick, Tick::new(8));
        assert_eq!(tick.next(), Tick::new(9));
        assert_eq!(Tick::new(3) - Tick::new(8), -5);
        assert_eq!(Tick::new(u32::MAX).next(), Tick::ZERO);
    }

    #[test]
    fn tick_display_is_plain_number() {
        assert_eq!(Tick::new(1234).to_string(), "1234");
    }

    #[test]
    fn player_index_opponent_is_involution() {
        for player in PlayerIndex::ALL {
            assert_ne!(player, player.opponent());
            assert_eq!(player, player.opponent().opponent());
        }
    }

    #[test]
    fn player_index_rejects_out_of_range() {
        assert_eq!(PlayerIndex::new(0), Some(PlayerIndex::P1));
        assert_eq!(PlayerIndex::new(1), Some(PlayerIndex::P2));
        for invalid in 2..=u8::MAX {
            assert_eq!(PlayerIndex::new(invalid), None);
        }
    }

    #[test]
    fn player_index_display_is_one_based() {
        assert_eq!(PlayerIndex::P1.to_string(), "p1");
        assert_eq!(PlayerIndex::P2.to_string(), "p2");
    }
}
