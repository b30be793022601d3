//! Wire messages exchanged between two peers.
//!
//! A frame is a one-byte tag followed by the variant's fixed-layout payload.
//! Input frames may carry trailing bytes after their payload (the trailer), used
//! for the periodic turn blob.
//!
//! | tag | message  | payload                                                     |
//! |-----|----------|-------------------------------------------------------------|
//! | 0   | Hello    | u8 version, [u8; 12] title, u32 crc32, u16 match type, [u8; 32] commitment |
//! | 1   | Hello2   | [u8; 16] nonce                                              |
//! | 2   | Init     | u8 battle number, [u8; 256] init blob                       |
//! | 3   | Input    | u8 battle number, u32 local tick, u32 remote tick, u16 joyflags, u8 aux, trailer |
//! | 4   | Ping     | u64 timestamp (µs)                                          |
//! | 5   | Pong     | u64 echoed timestamp (µs)                                   |

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::input::TURN_DATA_LEN;
use crate::network::codec::{self, byte_array, CodecError, CodecOperation};
use crate::Tick;

/// Protocol version carried in [`Hello`]. Bump on any wire-incompatible change.
pub const PROTOCOL_VERSION: u8 = 0x09;

/// Size of the init blob in an [`Init`] message.
pub const INIT_LEN: usize = TURN_DATA_LEN;

/// Longest trailer an Input message may carry.
pub const MAX_TRAILER_LEN: usize = 0x1000;

const TAG_HELLO: u8 = 0;
const TAG_HELLO2: u8 = 1;
const TAG_INIT: u8 = 2;
const TAG_INPUT: u8 = 3;
const TAG_PING: u8 = 4;
const TAG_PONG: u8 = 5;

/// First handshake message: compatibility fields plus a commitment to our nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's [`PROTOCOL_VERSION`].
    pub protocol_version: u8,
    /// Game title as stored in the ROM header.
    pub game_title: [u8; 12],
    /// CRC32 of the game image.
    pub game_crc32: u32,
    /// Requested kind of match.
    pub match_type: u16,
    /// SHA-256 of the sender's nonce.
    pub rng_commitment: [u8; 32],
}

/// Second handshake message: the nonce the commitment was made to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello2 {
    /// The revealed nonce.
    pub rng_nonce: [u8; 16],
}

/// Battle start data sent once per battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Init {
    /// Which battle of the session this belongs to.
    pub battle_number: u8,
    /// Game-defined initial state for the sender's side.
    #[serde(with = "byte_array::boxed")]
    pub marshaled: Box<[u8; INIT_LEN]>,
}

/// One tick of the sender's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    /// Which battle of the session this belongs to.
    pub battle_number: u8,
    /// The tick this input applies to.
    pub local_tick: Tick,
    /// The newest tick the sender had received from us.
    pub remote_tick: Tick,
    /// Joypad flags.
    pub joyflags: u16,
    /// Auxiliary state byte.
    pub aux_state: u8,
    /// Opaque trailing payload. Empty means no trailer.
    #[serde(skip)]
    pub trailer: Vec<u8>,
}

/// A closed set of wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake step one.
    Hello(Hello),
    /// Handshake step two.
    Hello2(Hello2),
    /// Battle init data.
    Init(Init),
    /// Per-tick input.
    Input(InputMessage),
    /// Latency ping.
    Ping {
        /// Sender's clock, microseconds.
        timestamp_micros: u64,
    },
    /// Reply to a latency ping.
    Pong {
        /// The timestamp from the Ping being answered.
        timestamp_micros: u64,
    },
}

impl Message {
    /// The frame tag for this message.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Hello(_) => TAG_HELLO,
            Self::Hello2(_) => TAG_HELLO2,
            Self::Init(_) => TAG_INIT,
            Self::Input(_) => TAG_INPUT,
            Self::Ping { .. } => TAG_PING,
            Self::Pong { .. } => TAG_PONG,
        }
    }

    /// A short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "Hello",
            Self::Hello2(_) => "Hello2",
            Self::Init(_) => "Init",
            Self::Input(_) => "Input",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
        }
    }

    /// Encodes the message into a frame.
    ///
    /// # Errors
    ///
    /// Fails if an Input trailer exceeds [`MAX_TRAILER_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![self.tag()];
        match self {
            Self::Hello(hello) => codec::encode_append(hello, &mut buf),
            Self::Hello2(hello2) => codec::encode_append(hello2, &mut buf),
            Self::Init(init) => codec::encode_append(init, &mut buf),
            Self::Input(input) => {
                if input.trailer.len() > MAX_TRAILER_LEN {
                    return Err(CodecError::encode(
                        format!(
                            "trailer of {} bytes exceeds {}",
                            input.trailer.len(),
                            MAX_TRAILER_LEN
                        ),
                        CodecOperation::EncodeMessage,
                    ));
                }
                let written = codec::encode_append(input, &mut buf)?;
                buf.extend_from_slice(&input.trailer);
                Ok(written)
            },
            Self::Ping { timestamp_micros } | Self::Pong { timestamp_micros } => {
                codec::encode_append(timestamp_micros, &mut buf)
            },
        }
        .map_err(|err| with_operation(err, CodecOperation::EncodeMessage))?;
        Ok(buf)
    }

    /// Decodes one frame.
    ///
    /// # Errors
    ///
    /// - [`LinkError::UnknownMessage`] for an unrecognised tag
    /// - [`LinkError::Codec`] for an empty frame, a short payload, trailing bytes
    ///   after anything but an Input, or an oversized trailer
    pub fn decode(frame: &[u8]) -> Result<Self, LinkError> {
        let (&tag, payload) = frame.split_first().ok_or_else(|| {
            CodecError::decode("empty frame", CodecOperation::DecodeMessage)
        })?;

        let message = match tag {
            TAG_HELLO => Self::Hello(decode_exact(payload)?),
            TAG_HELLO2 => Self::Hello2(decode_exact(payload)?),
            TAG_INIT => Self::Init(decode_exact(payload)?),
            TAG_INPUT => {
                let (mut input, read): (InputMessage, usize) = codec::decode(payload)
                    .map_err(|err| with_operation(err, CodecOperation::DecodeMessage))?;
                let trailer = payload.get(read..).unwrap_or_default();
                if trailer.len() > MAX_TRAILER_LEN {
                    return Err(CodecError::decode(
                        format!("trailer of {} bytes exceeds {}", trailer.len(), MAX_TRAILER_LEN),
                        CodecOperation::DecodeMessage,
                    )
                    .into());
                }
                input.trailer = trailer.to_vec();
                Self::Input(input)
            },
            TAG_PING => Self::Ping {
                timestamp_micros: decode_exact(payload)?,
            },
            TAG_PONG => Self::Pong {
                timestamp_micros: decode_exact(payload)?,
            },
            _ => return Err(LinkError::UnknownMessage { tag }),
        };
        Ok(message)
    }
}

fn decode_exact<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    let (value, read) = codec::decode(payload)
        .map_err(|err| with_operation(err, CodecOperation::DecodeMessage))?;
    if read != payload.len() {
        return Err(CodecError::decode(
            format!("{} unexpected trailing bytes", payload.len() - read),
            CodecOperation::DecodeMessage,
        ));
    }
    Ok(value)
}

fn with_operation(err: CodecError, operation: CodecOperation) -> CodecError {
    match err {
        CodecError::EncodeError { message, .. } => CodecError::encode(message, operation),
        CodecError::DecodeError { message, .. } => CodecError::decode(message, operation),
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
    use proptest::prelude::*;

    fn hello() -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            game_title: *b"MEGAMAN6_FXX",
            game_crc32: 0xdee6_f2a9,
            match_type: 1,
            rng_commitment: [0x5a; 32],
        }
    }

    fn input_message(trailer: Vec<u8>) -> InputMessage {
        InputMessage {
            battle_number: 2,
            local_tick: Tick::new(0x0102_0304),
            remote_tick: Tick::new(7),
            joyflags: 0xfc10,
            aux_state: 0x21,
            trailer,
        }
    }

    #[test]
    fn hello_layout_is_fixed() {
        let bytes = Message::Hello(hello()).encode().unwrap();
        assert_eq!(bytes.len(), 1 + 1 + 12 + 4 + 2 + 32);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(&bytes[2..14], b"MEGAMAN6_FXX");
        assert_eq!(&bytes[14..18], &[0xa9, 0xf2, 0xe6, 0xde]);
        assert_eq!(&bytes[18..20], &[1, 0]);
    }

    #[test]
    fn input_layout_is_fixed_little_endian() {
        let bytes = Message::Input(input_message(vec![])).encode().unwrap();
        assert_eq!(
            bytes,
            vec![3, 2, 0x04, 0x03, 0x02, 0x01, 7, 0, 0, 0, 0x10, 0xfc, 0x21]
        );
    }

    #[test]
    fn empty_trailer_round_trips_as_none() {
        let message = Message::Input(input_message(vec![]));
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn max_trailer_round_trips() {
        let message = Message::Input(input_message(vec![0xee; MAX_TRAILER_LEN]));
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn oversized_trailer_is_rejected_on_encode() {
        let message = Message::Input(input_message(vec![0; MAX_TRAILER_LEN + 1]));
        assert!(matches!(
            message.encode(),
            Err(CodecError::EncodeError {
                operation: CodecOperation::EncodeMessage,
                ..
            })
        ));
    }

    #[test]
    fn init_round_trips() {
        let mut marshaled = Box::new([0u8; INIT_LEN]);
        marshaled[0] = 0x11;
        marshaled[INIT_LEN - 1] = 0x99;
        let message = Message::Init(Init {
            battle_number: 4,
            marshaled,
        });
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), 1 + 1 + INIT_LEN);
        assert_eq!(Message::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn unknown_tag_is_reported() {
        assert_eq!(
            Message::decode(&[0x7f, 1, 2, 3]),
            Err(LinkError::UnknownMessage { tag: 0x7f })
        );
    }

    #[test]
    fn empty_frame_is_a_codec_error() {
        assert!(matches!(Message::decode(&[]), Err(LinkError::Codec(_))));
    }

    #[test]
    fn short_payload_is_a_codec_error() {
        let bytes = Message::Hello(hello()).encode().unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(LinkError::Codec(_))
        ));
    }

    #[test]
    fn trailing_bytes_after_hello2_are_rejected() {
        let mut bytes = Message::Hello2(Hello2 { rng_nonce: [3; 16] })
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(matches!(Message::decode(&bytes), Err(LinkError::Codec(_))));
    }

    #[test]
    fn ping_and_pong_use_distinct_tags() {
        let ping = Message::Ping {
            timestamp_micros: 99,
        };
        let pong = Message::Pong {
            timestamp_micros: 99,
        };
        assert_ne!(ping.encode().unwrap()[0], pong.encode().unwrap()[0]);
        assert_eq!(Message::decode(&pong.encode().unwrap()).unwrap(), pong);
    }

    proptest! {
        #[test]
        fn input_messages_round_trip(
            battle_number: u8,
            local_tick: u32,
            remote_tick: u32,
            joyflags: u16,
            aux_state: u8,
            trailer in proptest::collection::vec(any::<u8>(), 0..=MAX_TRAILER_LEN),
        ) {
            let message = Message::Input(InputMessage {
                battle_number,
                local_tick: Tick::new(local_tick),
                remote_tick: Tick::new(remote_tick),
                joyflags,
                aux_state,
                trailer,
            });
            let decoded = Message::decode(&message.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn decoding_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Message::decode(&bytes);
        }
    }
}
