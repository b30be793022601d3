use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::Tick;

/// Which compatibility check failed while comparing Hello messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchKind {
    /// The peers speak different protocol versions.
    ProtocolVersion {
        /// Our protocol version.
        local: u8,
        /// The peer's protocol version.
        remote: u8,
    },
    /// The peers are running different games.
    GameTitle {
        /// Our game title.
        local: [u8; 12],
        /// The peer's game title.
        remote: [u8; 12],
    },
    /// Same title but a different ROM image.
    GameChecksum {
        /// Our game CRC32.
        local: u32,
        /// The peer's game CRC32.
        remote: u32,
    },
    /// The peers asked for different kinds of match.
    MatchType {
        /// Our match type.
        local: u16,
        /// The peer's match type.
        remote: u16,
    },
    /// The peer sent back our own commitment instead of its own.
    ReflectedCommitment,
}

impl Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolVersion { local, remote } => write!(
                f,
                "expected protocol version 0x{:02x}, got 0x{:02x}",
                local, remote
            ),
            Self::GameTitle { local, remote } => write!(
                f,
                "game title mismatch: {:?} vs {:?}",
                String::from_utf8_lossy(local),
                String::from_utf8_lossy(remote)
            ),
            Self::GameChecksum { local, remote } => {
                write!(f, "game checksum mismatch: {:08x} vs {:08x}", local, remote)
            },
            Self::MatchType { local, remote } => {
                write!(f, "match type mismatch: {} vs {}", local, remote)
            },
            Self::ReflectedCommitment => write!(f, "peer reflected our own commitment"),
        }
    }
}

/// Why the two peers' histories are known to have diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesyncKind {
    /// The two halves of an input pair carry different ticks.
    PairTickMismatch {
        /// Player 1's tick.
        p1: Tick,
        /// Player 2's tick.
        p2: Tick,
    },
    /// An input pair was applied at a tick the simulation was not at.
    SimulationTickMismatch {
        /// The tick carried by the input.
        input: Tick,
        /// The tick the simulation reported.
        simulation: Tick,
    },
    /// The simulation refused to load a checkpoint.
    StateLoadFailed,
    /// The simulation could not produce a snapshot.
    StateSaveFailed,
    /// The input intercept did not fire within the frame budget.
    InterceptStarved {
        /// Frames run without consuming the pending pair.
        frames: u32,
    },
    /// A replayed tick reached a different game RNG state than was recorded.
    RngStateMismatch {
        /// The tick being replayed.
        tick: Tick,
        /// RNG state stored in the replay.
        recorded: u32,
        /// RNG state the simulation reached.
        simulation: u32,
    },
}

impl Display for DesyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairTickMismatch { p1, p2 } => write!(f, "p1 tick != p2 tick: {} != {}", p1, p2),
            Self::SimulationTickMismatch { input, simulation } => write!(
                f,
                "input tick != simulation tick: {} != {}",
                input, simulation
            ),
            Self::StateLoadFailed => write!(f, "failed to load state"),
            Self::StateSaveFailed => write!(f, "failed to save state"),
            Self::InterceptStarved { frames } => write!(
                f,
                "input intercept did not fire after {} frames",
                frames
            ),
            Self::RngStateMismatch {
                tick,
                recorded,
                simulation,
            } => write!(
                f,
                "rng state at tick {}: recorded {:#010x} != simulation {:#010x}",
                tick, recorded, simulation
            ),
        }
    }
}

/// Why a blocking wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Someone called [`CancellationToken::cancel`](crate::CancellationToken::cancel).
    Aborted,
    /// The token's deadline passed.
    TimedOut,
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// This enum contains all errors this library can return. Most API functions return a [`Result<T, LinkError>`].
///
/// [`Result<T, LinkError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peers cannot play together. Not retryable.
    ProtocolMismatch {
        /// The check that failed.
        kind: MismatchKind,
    },
    /// The peer revealed a nonce that does not hash to its earlier commitment.
    CommitmentMismatch,
    /// The two peers' histories have diverged. Fatal for the session.
    Desync {
        /// What diverged.
        kind: DesyncKind,
    },
    /// A blocking wait was cancelled or timed out. Treated as connection loss.
    Cancelled {
        /// Why the wait ended.
        reason: CancelReason,
    },
    /// The peer closed the connection.
    Disconnected,
    /// A frame arrived with a tag this protocol does not know.
    UnknownMessage {
        /// The unrecognised tag byte.
        tag: u8,
    },
    /// A known message arrived where a different one was required.
    UnexpectedMessage {
        /// What we were waiting for.
        expected: &'static str,
        /// What arrived instead.
        received: &'static str,
    },
    /// A frame could not be encoded or decoded.
    Codec(CodecError),
    /// A replay stream is malformed.
    InvalidReplay {
        /// What was wrong with it.
        reason: String,
    },
    /// An I/O operation (replay file, transport) failed.
    Io {
        /// What we were doing, plus the underlying error.
        context: String,
    },
    /// You made an invalid request, usually by calling an operation in the wrong state.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
}

impl LinkError {
    pub(crate) fn io(operation: &str, err: &std::io::Error) -> Self {
        Self::Io {
            context: format!("{}: {}", operation, err),
        }
    }

    pub(crate) fn invalid_request(info: impl Into<String>) -> Self {
        Self::InvalidRequest { info: info.into() }
    }

    pub(crate) fn invalid_replay(reason: impl Into<String>) -> Self {
        Self::InvalidReplay {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors the session layer should report as a lost connection.
    #[must_use]
    pub const fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Disconnected | Self::Io { .. }
        )
    }

    /// Returns `true` when the peers' simulations have diverged.
    #[must_use]
    pub const fn is_desync(&self) -> bool {
        matches!(self, Self::Desync { .. })
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolMismatch { kind } => write!(f, "Incompatible peer: {}", kind),
            Self::CommitmentMismatch => write!(f, "Failed to verify the peer's RNG commitment"),
            Self::Desync { kind } => write!(f, "Desynchronized: {}", kind),
            Self::Cancelled { reason } => write!(f, "Wait {}", reason),
            Self::Disconnected => write!(f, "The peer closed the connection"),
            Self::UnknownMessage { tag } => write!(f, "Unknown message tag 0x{:02x}", tag),
            Self::UnexpectedMessage { expected, received } => {
                write!(f, "Expected {} message, received {}", expected, received)
            },
            Self::Codec(err) => write!(f, "Codec error: {}", err),
            Self::InvalidReplay { reason } => write!(f, "Invalid replay: {}", reason),
            Self::Io { context } => write!(f, "I/O error: {}", context),
            Self::InvalidRequest { info } => write!(f, "Invalid Request: {}", info),
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for LinkError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<MismatchKind> for LinkError {
    fn from(kind: MismatchKind) -> Self {
        Self::ProtocolMismatch { kind }
    }
}

impl From<DesyncKind> for LinkError {
    fn from(kind: DesyncKind) -> Self {
        Self::Desync { kind }
    }
}

/// Returned when a replay names a player slot twice or a slot outside 0..=1.
pub(crate) fn bad_player_index(index: u8) -> LinkError {
    LinkError::invalid_replay(format!("invalid player index {}", index))
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
    fn protocol_mismatch_names_both_versions() {
        let err = LinkError::from(MismatchKind::ProtocolVersion {
            local: 0x09,
            remote: 0x08,
        });
        let msg = err.to_string();
        assert!(msg.contains("0x09"), "{msg}");
        assert!(msg.contains("0x08"), "{msg}");
    }

    #[test]
    fn desync_display_includes_ticks() {
        let err = LinkError::from(DesyncKind::PairTickMismatch {
            p1: Tick::new(4),
            p2: Tick::new(5),
        });
        assert_eq!(err.to_string(), "Desynchronized: p1 tick != p2 tick: 4 != 5");
        assert!(err.is_desync());
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn cancellation_is_connection_loss() {
        let err = LinkError::Cancelled {
            reason: CancelReason::TimedOut,
        };
        assert!(err.is_connection_loss());
        assert_eq!(err.to_string(), "Wait timed out");
    }

    #[test]
    fn codec_error_is_exposed_as_source() {
        let err = LinkError::from(CodecError::decode(
            "unexpected end",
            crate::network::codec::CodecOperation::DecodeMessage,
        ));
        assert!(err.source().is_some());
    }
}
