//! Payload compression using zlib-wrapped DEFLATE via `flate2`.
//!
//! Compression always runs at the best level and is only kept when the
//! result is strictly smaller than the input; callers send the original
//! payload otherwise.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ProtocolError, Result};

/// Compress a payload.
///
/// Returns `Some(compressed)` if compression is beneficial (output smaller
/// than input), or `None` if the payload should be sent as-is.
pub fn compress(input: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len()), Compression::best());
    if let Err(e) = encoder.write_all(input) {
        tracing::warn!(error = %e, "Deflate compression failed, sending uncompressed");
        return None;
    }
    let compressed = match encoder.finish() {
        Ok(compressed) => compressed,
        Err(e) => {
            tracing::warn!(error = %e, "Deflate compression failed, sending uncompressed");
            return None;
        }
    };

    if compressed.len() >= input.len() {
        return None;
    }

    Some(compressed)
}

/// Decompress a payload that was compressed from `original_size` bytes.
///
/// Fails if the stream is corrupt or does not inflate to exactly
/// `original_size` bytes.
pub fn decompress(input: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(input);
    // `original_size` comes from the peer; only trust it as an upper bound.
    let mut output = Vec::with_capacity(original_size.min(input.len().saturating_mul(4)));
    // Read one byte past the announced size so oversized streams are caught
    // without inflating them completely.
    decoder
        .by_ref()
        .take(original_size as u64 + 1)
        .read_to_end(&mut output)?;

    if output.len() != original_size {
        return Err(ProtocolError::Compression(format!(
            "inflated {} bytes, expected {}",
            output.len(),
            original_size
        )));
    }

    Ok(output)
}
