//! Text-safe encoding of binary payloads.
//!
//! Binary blobs (images, trained models) travel inside JSON bodies as
//! standard padded base64. Encoding never wraps lines. Decoding ignores
//! ASCII whitespace, so bodies produced by line-wrapping MIME encoders on
//! the worker side decode to the same bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::CodecError;

/// Encode arbitrary bytes as unwrapped standard base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64, skipping any ASCII whitespace.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: Vec<u8> = text
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        return Ok(STANDARD.decode(compact)?);
    }
    Ok(STANDARD.decode(text)?)
}
