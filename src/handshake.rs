//! Commit-reveal negotiation of a shared random seed.
//!
//! Each peer picks a random nonce and sends only its SHA-256 (the commitment)
//! together with the compatibility fields. Once both commitments are in, the
//! nonces are revealed and checked against them. Neither side can choose its
//! nonce after seeing the other's, so neither can steer the seed.
//!
//! ```text
//! Idle -> CommitSent -> CommitsExchanged -> NonceSent -> SeedDerived
//!   \________\_______________\________________\-------> Failed
//! ```

use rand::RngCore as _;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{LinkError, MismatchKind};
use crate::input_queue::CancellationToken;
use crate::network::messages::{Hello, Hello2, Message, PROTOCOL_VERSION};
use crate::network::transport::Transport;
use crate::rng::{Pcg32, Rng};

/// Which end of the connection this peer is, as assigned by signalling.
///
/// Only used to break symmetry: both peers draw the same random bit and
/// interpret it from opposite sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConnectionSide {
    /// The peer that sent the connection offer.
    Offerer,
    /// The peer that answered it.
    Answerer,
}

/// What this peer announces in its Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    /// Game title from the ROM header, zero-padded.
    pub game_title: [u8; 12],
    /// CRC32 of the game image.
    pub game_crc32: u32,
    /// Requested kind of match; both peers must agree.
    pub match_type: u16,
    /// Our end of the connection.
    pub side: ConnectionSide,
}

impl HandshakeParams {
    /// Builds params from a title string, truncating or zero-padding it to 12 bytes.
    #[must_use]
    pub fn new(game_title: &str, game_crc32: u32, match_type: u16, side: ConnectionSide) -> Self {
        let mut title = [0u8; 12];
        for (slot, byte) in title.iter_mut().zip(game_title.bytes()) {
            *slot = byte;
        }
        Self {
            game_title: title,
            game_crc32,
            match_type,
            side,
        }
    }
}

/// Progress of a [`Handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Idle,
    /// Our Hello is out.
    CommitSent,
    /// The peer's Hello arrived and was compatible.
    CommitsExchanged,
    /// Our Hello2 is out.
    NonceSent,
    /// The peer's nonce checked out and the seed is known.
    SeedDerived,
    /// A check failed; the handshake cannot continue.
    Failed,
}

/// One peer's side of the commit-reveal exchange.
///
/// Drive it by hand with [`hello`](Self::hello), [`receive_hello`](Self::receive_hello),
/// [`reveal`](Self::reveal) and [`receive_hello2`](Self::receive_hello2), or let
/// [`negotiate`] run it over a transport.
#[derive(Debug)]
pub struct Handshake {
    params: HandshakeParams,
    state: HandshakeState,
    nonce: [u8; 16],
    commitment: [u8; 32],
    peer_commitment: Option<[u8; 32]>,
}

impl Handshake {
    /// Starts a handshake with a fresh nonce from the OS-seeded thread RNG.
    #[must_use]
    pub fn new(params: HandshakeParams) -> Self {
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);
        Self::with_nonce(params, nonce)
    }

    /// Starts a handshake with a caller-chosen nonce.
    #[must_use]
    pub fn with_nonce(params: HandshakeParams, nonce: [u8; 16]) -> Self {
        Self {
            params,
            state: HandshakeState::Idle,
            commitment: commit(&nonce),
            nonce,
            peer_commitment: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our commitment, `SHA-256(nonce)`.
    #[must_use]
    pub const fn commitment(&self) -> &[u8; 32] {
        &self.commitment
    }

    /// Produces our Hello. `Idle -> CommitSent`.
    pub fn hello(&mut self) -> Result<Message, LinkError> {
        self.expect_state(HandshakeState::Idle, "hello")?;
        self.state = HandshakeState::CommitSent;
        Ok(Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            game_title: self.params.game_title,
            game_crc32: self.params.game_crc32,
            match_type: self.params.match_type,
            rng_commitment: self.commitment,
        }))
    }

    /// Checks the peer's Hello. `CommitSent -> CommitsExchanged`.
    ///
    /// # Errors
    ///
    /// [`LinkError::ProtocolMismatch`] if the peer speaks another protocol version,
    /// runs another game, asks for another match type, or sent our own commitment back.
    pub fn receive_hello(&mut self, hello: &Hello) -> Result<(), LinkError> {
        self.expect_state(HandshakeState::CommitSent, "receive_hello")?;
        if let Err(kind) = self.check_compatible(hello) {
            self.state = HandshakeState::Failed;
            return Err(kind.into());
        }
        self.peer_commitment = Some(hello.rng_commitment);
        self.state = HandshakeState::CommitsExchanged;
        debug!(match_type = hello.match_type, "peer hello accepted");
        Ok(())
    }

    /// Produces our Hello2, revealing the nonce. `CommitsExchanged -> NonceSent`.
    pub fn reveal(&mut self) -> Result<Message, LinkError> {
        self.expect_state(HandshakeState::CommitsExchanged, "reveal")?;
        self.state = HandshakeState::NonceSent;
        Ok(Message::Hello2(Hello2 {
            rng_nonce: self.nonce,
        }))
    }

    /// Verifies the peer's nonce and derives the shared RNG. `NonceSent -> SeedDerived`.
    ///
    /// # Errors
    ///
    /// [`LinkError::CommitmentMismatch`] if the nonce does not hash to the peer's commitment.
    pub fn receive_hello2(&mut self, hello2: &Hello2) -> Result<SharedRng, LinkError> {
        self.expect_state(HandshakeState::NonceSent, "receive_hello2")?;
        let verified = self
            .peer_commitment
            .is_some_and(|expected| commit(&hello2.rng_nonce) == expected);
        if !verified {
            self.state = HandshakeState::Failed;
            return Err(LinkError::CommitmentMismatch);
        }
        self.state = HandshakeState::SeedDerived;
        Ok(SharedRng::from_seed(&derive_seed(&self.nonce, &hello2.rng_nonce)))
    }

    fn check_compatible(&self, hello: &Hello) -> Result<(), MismatchKind> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(MismatchKind::ProtocolVersion {
                local: PROTOCOL_VERSION,
                remote: hello.protocol_version,
            });
        }
        if hello.game_title != self.params.game_title {
            return Err(MismatchKind::GameTitle {
                local: self.params.game_title,
                remote: hello.game_title,
            });
        }
        if hello.game_crc32 != self.params.game_crc32 {
            return Err(MismatchKind::GameChecksum {
                local: self.params.game_crc32,
                remote: hello.game_crc32,
            });
        }
        if hello.match_type != self.params.match_type {
            return Err(MismatchKind::MatchType {
                local: self.params.match_type,
                remote: hello.match_type,
            });
        }
        if hello.rng_commitment == self.commitment {
            return Err(MismatchKind::ReflectedCommitment);
        }
        Ok(())
    }

    fn expect_state(&self, expected: HandshakeState, operation: &str) -> Result<(), LinkError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LinkError::invalid_request(format!(
                "{} called in handshake state {:?}",
                operation, self.state
            )))
        }
    }
}

fn commit(nonce: &[u8; 16]) -> [u8; 32] {
    Sha256::digest(nonce).into()
}

/// Orders the nonces so both peers hash the same bytes.
fn derive_seed(ours: &[u8; 16], theirs: &[u8; 16]) -> [u8; 32] {
    let (low, high) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };
    let mut hasher = Sha256::new();
    hasher.update(low);
    hasher.update(high);
    hasher.finalize().into()
}

/// The random stream both peers share after a handshake.
///
/// Every draw must happen on both peers in the same order, or they diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRng(Pcg32);

impl SharedRng {
    /// Seeds the stream from a 32-byte handshake seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut head = [0u8; 16];
        head.copy_from_slice(&seed[..16]);
        Self(Pcg32::from_seed(&head))
    }

    /// Draws one bit and reads it from `side`'s point of view, so the two
    /// peers always get opposite answers.
    pub fn draw_won_last_battle(&mut self, side: ConnectionSide) -> bool {
        self.gen_bool() == (side == ConnectionSide::Offerer)
    }
}

impl Rng for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

/// Result of a completed [`negotiate`].
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The shared random stream.
    pub rng: SharedRng,
    /// Whether we count as the winner of the (nonexistent) previous battle,
    /// which makes us player 1 in the first battle.
    pub won_last_battle: bool,
}

/// Runs a whole handshake over `transport`.
///
/// # Errors
///
/// Any [`Handshake`] failure, [`LinkError::UnexpectedMessage`] if the peer sends
/// anything but the next handshake message, and transport errors including
/// [`LinkError::Cancelled`] once `cancel` fires.
pub fn negotiate<T: Transport + ?Sized>(
    transport: &T,
    params: HandshakeParams,
    cancel: &CancellationToken,
) -> Result<Negotiated, LinkError> {
    let side = params.side;
    let mut handshake = Handshake::new(params);

    transport.send(&handshake.hello()?.encode()?)?;
    debug!("hello sent");
    let hello = match Message::decode(&transport.recv(cancel)?)? {
        Message::Hello(hello) => hello,
        other => return Err(unexpected("Hello", &other)),
    };
    handshake.receive_hello(&hello)?;

    transport.send(&handshake.reveal()?.encode()?)?;
    let hello2 = match Message::decode(&transport.recv(cancel)?)? {
        Message::Hello2(hello2) => hello2,
        other => return Err(unexpected("Hello2", &other)),
    };
    let mut rng = handshake.receive_hello2(&hello2)?;

    let won_last_battle = rng.draw_won_last_battle(side);
    info!(?side, won_last_battle, "negotiation complete");
    Ok(Negotiated {
        rng,
        won_last_battle,
    })
}

fn unexpected(expected: &'static str, received: &Message) -> LinkError {
    LinkError::UnexpectedMessage {
        expected,
        received: received.name(),
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

    fn params(side: ConnectionSide) -> HandshakeParams {
        HandshakeParams::new("MEGAMAN6_FXX", 0xdee6_f2a9, 0, side)
    }

    fn hello_of(message: Message) -> Hello {
        match message {
            Message::Hello(hello) => hello,
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    fn hello2_of(message: Message) -> Hello2 {
        match message {
            Message::Hello2(hello2) => hello2,
            other => panic!("expected Hello2, got {other:?}"),
        }
    }

    fn run_pair(a: &mut Handshake, b: &mut Handshake) -> (SharedRng, SharedRng) {
        let hello_a = hello_of(a.hello().unwrap());
        let hello_b = hello_of(b.hello().unwrap());
        a.receive_hello(&hello_b).unwrap();
        b.receive_hello(&hello_a).unwrap();
        let reveal_a = hello2_of(a.reveal().unwrap());
        let reveal_b = hello2_of(b.reveal().unwrap());
        (
            a.receive_hello2(&reveal_b).unwrap(),
            b.receive_hello2(&reveal_a).unwrap(),
        )
    }

    #[test]
    fn both_peers_derive_the_same_stream() {
        let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [1; 16]);
        let mut b = Handshake::with_nonce(params(ConnectionSide::Answerer), [2; 16]);
        let (mut rng_a, mut rng_b) = run_pair(&mut a, &mut b);
        assert_eq!(a.state(), HandshakeState::SeedDerived);
        assert_eq!(b.state(), HandshakeState::SeedDerived);
        for _ in 0..16 {
            assert_eq!(rng_a.next_u32(), rng_b.next_u32());
        }
    }

    #[test]
    fn peers_get_opposite_seats() {
        for seed in 0..32u8 {
            let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [seed; 16]);
            let mut b = Handshake::with_nonce(params(ConnectionSide::Answerer), [seed ^ 0xff; 16]);
            let (mut rng_a, mut rng_b) = run_pair(&mut a, &mut b);
            assert_ne!(
                rng_a.draw_won_last_battle(ConnectionSide::Offerer),
                rng_b.draw_won_last_battle(ConnectionSide::Answerer)
            );
        }
    }

    #[test]
    fn commitment_is_sha256_of_nonce() {
        let handshake = Handshake::with_nonce(params(ConnectionSide::Offerer), [0; 16]);
        // sha256 of sixteen zero bytes
        assert_eq!(
            handshake.commitment()[..4],
            [0x37, 0x47, 0x08, 0xff]
        );
    }

    #[test]
    fn forged_nonce_is_rejected() {
        let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [1; 16]);
        let mut b = Handshake::with_nonce(params(ConnectionSide::Answerer), [2; 16]);
        let hello_b = hello_of(b.hello().unwrap());
        a.hello().unwrap();
        a.receive_hello(&hello_b).unwrap();
        a.reveal().unwrap();

        let forged = Hello2 { rng_nonce: [3; 16] };
        assert_eq!(a.receive_hello2(&forged), Err(LinkError::CommitmentMismatch));
        assert_eq!(a.state(), HandshakeState::Failed);
    }

    #[test]
    fn incompatible_hellos_are_named() {
        let base = hello_of(
            Handshake::with_nonce(params(ConnectionSide::Answerer), [9; 16])
                .hello()
                .unwrap(),
        );
        let cases = [
            (
                Hello {
                    protocol_version: PROTOCOL_VERSION.wrapping_add(1),
                    ..base
                },
                "protocol",
            ),
            (
                Hello {
                    game_title: *b"MEGAMAN6_GXX",
                    ..base
                },
                "title",
            ),
            (
                Hello {
                    game_crc32: 1,
                    ..base
                },
                "checksum",
            ),
            (
                Hello {
                    match_type: 1,
                    ..base
                },
                "match type",
            ),
        ];
        for (hello, what) in cases {
            let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [1; 16]);
            a.hello().unwrap();
            let err = a.receive_hello(&hello).unwrap_err();
            assert!(
                matches!(err, LinkError::ProtocolMismatch { .. }),
                "{what}: {err:?}"
            );
            assert_eq!(a.state(), HandshakeState::Failed);
        }
    }

    #[test]
    fn reflected_commitment_is_rejected() {
        let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [1; 16]);
        let own = hello_of(a.hello().unwrap());
        assert_eq!(
            a.receive_hello(&own),
            Err(LinkError::ProtocolMismatch {
                kind: MismatchKind::ReflectedCommitment
            })
        );
    }

    #[test]
    fn out_of_order_calls_are_invalid_requests() {
        let mut a = Handshake::with_nonce(params(ConnectionSide::Offerer), [1; 16]);
        assert!(matches!(a.reveal(), Err(LinkError::InvalidRequest { .. })));
        a.hello().unwrap();
        assert!(matches!(a.hello(), Err(LinkError::InvalidRequest { .. })));
    }

    #[test]
    fn title_is_padded() {
        let params = HandshakeParams::new("BN6", 0, 0, ConnectionSide::Offerer);
        assert_eq!(&params.game_title, b"BN6\0\0\0\0\0\0\0\0\0");
    }
}
