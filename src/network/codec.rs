//! Binary codec for wire messages and replay records.
//!
//! All payloads go through one bincode configuration: `standard()` with fixed-width
//! integers, which is little-endian with no varint packing. That gives every message
//! a fixed layout that an independently built peer can decode byte for byte.
//!
//! # Examples
//!
//! ```
//! use rollback_link::network::codec::{decode, encode};
//!
//! let bytes = encode(&0x1234_u16).expect("encoding should succeed");
//! assert_eq!(bytes, [0x34, 0x12]);
//!
//! let (value, read): (u16, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(value, 0x1234);
//! assert_eq!(read, 2);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-width integers keep message sizes and layouts independent of values.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a wire message.
    EncodeMessage,
    /// Decoding a wire message.
    DecodeMessage,
    /// Encoding a replay record.
    EncodeRecord,
    /// Decoding a replay record.
    DecodeRecord,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding wire message"),
            Self::DecodeMessage => write!(f, "decoding wire message"),
            Self::EncodeRecord => write!(f, "encoding replay record"),
            Self::DecodeRecord => write!(f, "decoding replay record"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Messages are stored as `String` because bincode's errors only expose their
/// `Display` output.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`, returning the bytes written.
///
/// # Examples
///
/// ```
/// use rollback_link::network::codec::encode_append;
///
/// let mut buffer = vec![0x03];
/// let written = encode_append(&7_u32, &mut buffer).expect("encoding should succeed");
/// assert_eq!(written, 4);
/// assert_eq!(buffer, [0x03, 7, 0, 0, 0]);
/// ```
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed; trailing bytes are
/// left for the caller.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Serde adapter for `[u8; N]` fields wider than serde's built-in 32-element arrays.
///
/// Arrays are written as a tuple, so bincode emits exactly `N` raw bytes with no
/// length prefix.
pub(crate) mod byte_array {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    struct ArrayVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "an array of {} bytes", N)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = [0u8; N];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(i, &self))?;
            }
            Ok(out)
        }
    }

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in bytes {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        deserializer.deserialize_tuple(N, ArrayVisitor::<N>)
    }

    /// Same layout for boxed arrays.
    pub mod boxed {
        use serde::{Deserializer, Serializer};

        #[allow(clippy::borrowed_box)]
        pub fn serialize<S: Serializer, const N: usize>(
            bytes: &Box<[u8; N]>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            super::serialize(bytes.as_ref(), serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
            deserializer: D,
        ) -> Result<Box<[u8; N]>, D::Error> {
            super::deserialize(deserializer).map(Box::new)
        }
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
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wide {
        lead: u8,
        #[serde(with = "byte_array")]
        body: [u8; 64],
        #[serde(with = "byte_array::boxed")]
        tail: Box<[u8; 40]>,
    }

    #[test]
    fn integers_are_fixed_width_little_endian() {
        assert_eq!(encode(&1_u32).unwrap(), [1, 0, 0, 0]);
        assert_eq!(encode(&0xfc10_u16).unwrap(), [0x10, 0xfc]);
        assert_eq!(encode(&u64::MAX).unwrap().len(), 8);
    }

    #[test]
    fn wide_arrays_have_no_length_prefix() {
        let mut body = [0u8; 64];
        body[63] = 0xaa;
        let value = Wide {
            lead: 7,
            body,
            tail: Box::new([0x55; 40]),
        };
        let bytes = encode(&value).unwrap();
        assert_eq!(bytes.len(), 1 + 64 + 40);
        assert_eq!(bytes[64], 0xaa);

        let (decoded, read): (Wide, _) = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(read, bytes.len());
    }

    #[test]
    fn short_wide_array_fails_to_decode() {
        let bytes = [0u8; 30];
        let result: CodecResult<(Wide, _)> = decode(&bytes);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn decode_reports_bytes_consumed_and_ignores_rest() {
        let mut bytes = encode(&0xdead_beef_u32).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        let (value, read): (u32, _) = decode(&bytes).unwrap();
        assert_eq!(value, 0xdead_beef);
        assert_eq!(read, 4);
        assert_eq!(decode_value::<u32>(&bytes).unwrap(), 0xdead_beef);
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::encode("boom", CodecOperation::EncodeMessage);
        assert_eq!(
            err.to_string(),
            "encoding failed while encoding wire message: boom"
        );
        let err = CodecError::decode("short", CodecOperation::DecodeRecord);
        assert!(err.to_string().contains("replay record"));
    }
}
