//! Fuzz target for wire message decoding.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary frames
//! - Anything that decodes re-encodes to the same frame

#![no_main]

use libfuzzer_sys::fuzz_target;
use rollback_link::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode(data) {
        let encoded = message.encode().expect("decoded message must re-encode");
        assert_eq!(encoded, data, "re-encoding changed the frame");
    }
});
