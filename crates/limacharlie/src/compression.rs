//! Decoding of compressed JSON payloads.
//!
//! Several endpoints (historic events, jobs, incidents) return their payload
//! as a base64 string of compressed JSON when asked with
//! `is_compressed=true`. The service uses zlib; gzip is accepted as well and
//! detected from its magic bytes.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::Value;

use crate::error::{ApiError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Inflate `bytes` and parse the result as JSON.
pub fn decompress_and_parse(bytes: &[u8]) -> Result<Value> {
    let mut inflated = Vec::new();
    let read = if bytes.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(bytes).read_to_end(&mut inflated)
    } else {
        ZlibDecoder::new(bytes).read_to_end(&mut inflated)
    };
    read.map_err(|e| ApiError::MalformedResponse(format!("decompression failed: {e}")))?;
    Ok(serde_json::from_slice(&inflated)?)
}

/// Base64-decode, inflate and parse a compressed blob.
pub fn decode_blob(encoded: &str) -> Result<Value> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::MalformedResponse(format!("invalid base64 payload: {e}")))?;
    decompress_and_parse(&bytes)
}

/// Replace `body[field]` (a compressed string) with its decoded value.
///
/// Leaves `body` untouched when the field is absent or not a string.
pub fn inflate_field(body: &mut Value, field: &str) -> Result<()> {
    let Some(Value::String(encoded)) = body.get(field) else {
        return Ok(());
    };
    let decoded = decode_blob(encoded)?;
    body[field] = decoded;
    Ok(())
}
