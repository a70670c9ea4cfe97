//! Chunk encoding for the terminal channel.
//!
//! Terminal output and input travel as standard base64 strings. Output is
//! raw PTY bytes, so partial UTF-8 sequences at chunk boundaries survive the
//! trip untouched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::Result;

/// Encode a raw chunk for the wire.
pub fn encode_chunk(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a wire chunk back into raw bytes.
pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(encoded.trim())?)
}

/// Build the client key sent to the control plane: `base64("{api_key}:{client_id}")`.
pub fn client_key(api_key: &str, client_id: &str) -> String {
    STANDARD.encode(format!("{}:{}", api_key, client_id))
}
