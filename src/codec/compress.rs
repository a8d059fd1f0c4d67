//! Stream compression via `flate2`.
//!
//! Two encodings: gzip and raw zlib-deflate. The `Fallback` algorithm
//! name maps to deflate so every configured algorithm yields a genuine
//! LZ stream.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::config::CompressionAlgorithm;
use crate::error::{Result, WireError};

/// Wire name of the algorithm, written into the envelope.
pub fn algorithm_name(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::Gzip => "gzip",
        CompressionAlgorithm::Deflate | CompressionAlgorithm::Fallback => "deflate",
    }
}

/// Parse an envelope algorithm name.
pub fn algorithm_from_name(name: &str) -> Result<CompressionAlgorithm> {
    match name {
        "gzip" => Ok(CompressionAlgorithm::Gzip),
        "deflate" => Ok(CompressionAlgorithm::Deflate),
        other => Err(WireError::Compression(format!(
            "unknown compression algorithm '{other}'"
        ))),
    }
}

/// Compress `data` with the given algorithm.
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| WireError::Compression(format!("gzip encode failed: {e}")))
        }
        CompressionAlgorithm::Deflate | CompressionAlgorithm::Fallback => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| WireError::Compression(format!("deflate encode failed: {e}")))
        }
    }
}

/// Decompress `data` with the given algorithm.
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match algorithm {
        CompressionAlgorithm::Gzip => GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| WireError::Compression(format!("gzip decode failed: {e}")))?,
        CompressionAlgorithm::Deflate | CompressionAlgorithm::Fallback => ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| WireError::Compression(format!("deflate decode failed: {e}")))?,
    };
    Ok(out)
}

/// Gzip magic-byte check.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"the quick brown fox jumps over the lazy dog, repeatedly and compressibly, \
          the quick brown fox jumps over the lazy dog";

    #[test]
    fn test_gzip_roundtrip() {
        let compressed = compress(SAMPLE, CompressionAlgorithm::Gzip).unwrap();
        assert!(is_gzip(&compressed));
        assert!(compressed.len() < SAMPLE.len());
        let restored = decompress(&compressed, CompressionAlgorithm::Gzip).unwrap();
        assert_eq!(restored, SAMPLE);
    }

    #[test]
    fn test_deflate_roundtrip() {
        let compressed = compress(SAMPLE, CompressionAlgorithm::Deflate).unwrap();
        assert!(!is_gzip(&compressed));
        let restored = decompress(&compressed, CompressionAlgorithm::Deflate).unwrap();
        assert_eq!(restored, SAMPLE);
    }

    #[test]
    fn test_fallback_is_real_compression() {
        let compressed = compress(SAMPLE, CompressionAlgorithm::Fallback).unwrap();
        assert!(compressed.len() < SAMPLE.len());
        let restored = decompress(&compressed, CompressionAlgorithm::Fallback).unwrap();
        assert_eq!(restored, SAMPLE);
    }

    #[test]
    fn test_fallback_shares_deflate_wire_name() {
        assert_eq!(algorithm_name(CompressionAlgorithm::Fallback), "deflate");
        let compressed = compress(SAMPLE, CompressionAlgorithm::Fallback).unwrap();
        let restored = decompress(&compressed, CompressionAlgorithm::Deflate).unwrap();
        assert_eq!(restored, SAMPLE);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let result = decompress(b"definitely not a gzip stream", CompressionAlgorithm::Gzip);
        assert!(matches!(result, Err(WireError::Compression(_))));
    }

    #[test]
    fn test_algorithm_name_roundtrip() {
        for alg in [CompressionAlgorithm::Gzip, CompressionAlgorithm::Deflate] {
            assert_eq!(algorithm_from_name(algorithm_name(alg)).unwrap(), alg);
        }
        assert!(algorithm_from_name("brotli").is_err());
    }
}
