//! Self-describing blob encoding
//!
//! Every stored blob starts with a one-byte encoding tag so that changing the
//! store-wide compression setting never invalidates blobs already on disk.

use crate::error::{Result, StoreError};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const TAG_RAW: u8 = 0x00;
const TAG_ZLIB: u8 = 0x01;
const TAG_GZIP: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zlib,
    Gzip,
}

/// Store-wide compression setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algorithm: CompressionAlgorithm,
    /// 0 (fastest) to 9 (smallest)
    pub level: u32,
}

impl Default for Compression {
    fn default() -> Self {
        Compression {
            algorithm: CompressionAlgorithm::None,
            level: 6,
        }
    }
}

impl Compression {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn zlib(level: u32) -> Self {
        Compression {
            algorithm: CompressionAlgorithm::Zlib,
            level: level.min(9),
        }
    }

    pub fn gzip(level: u32) -> Self {
        Compression {
            algorithm: CompressionAlgorithm::Gzip,
            level: level.min(9),
        }
    }
}

/// Encode `data` with the given compression, prefixing the encoding tag
pub fn encode(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let level = flate2::Compression::new(compression.level.min(9));

    match compression.algorithm {
        CompressionAlgorithm::None => {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(data);
            Ok(out)
        }
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(vec![TAG_ZLIB], level);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(vec![TAG_GZIP], level);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decode a stored blob, whatever encoding it was written with
pub fn decode(stored: &[u8]) -> Result<Vec<u8>> {
    let (tag, payload) = stored
        .split_first()
        .ok_or_else(|| StoreError::Inconsistent("empty blob, missing encoding tag".to_string()))?;

    match *tag {
        TAG_RAW => Ok(payload.to_vec()),
        TAG_ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| StoreError::Inconsistent(format!("corrupt zlib blob: {}", e)))?;
            Ok(out)
        }
        TAG_GZIP => {
            let mut out = Vec::new();
            GzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| StoreError::Inconsistent(format!("corrupt gzip blob: {}", e)))?;
            Ok(out)
        }
        other => Err(StoreError::Inconsistent(format!(
            "unknown blob encoding tag 0x{:02x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"From: alice@example.com\r\nSubject: Hello\r\n\r\n"
            .iter()
            .chain(b"lorem ipsum ".repeat(200).iter())
            .copied()
            .collect()
    }

    #[test]
    fn test_raw_has_tag_prefix() {
        let encoded = encode(b"abc", Compression::none()).unwrap();
        assert_eq!(encoded, vec![TAG_RAW, b'a', b'b', b'c']);
    }

    #[test]
    fn test_compressed_blobs_shrink_and_decode() {
        let data = sample();
        for compression in [Compression::zlib(6), Compression::gzip(9)] {
            let encoded = encode(&data, compression).unwrap();
            assert!(encoded.len() < data.len());
            assert_eq!(decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn test_decode_is_independent_of_current_setting() {
        // A blob written under zlib still reads back after the store switched
        // to no compression: the tag travels with the blob.
        let data = sample();
        let old = encode(&data, Compression::zlib(1)).unwrap();
        let new = encode(&data, Compression::none()).unwrap();
        assert_eq!(decode(&old).unwrap(), decode(&new).unwrap());
    }

    #[test]
    fn test_unknown_tag_is_inconsistent() {
        assert!(matches!(
            decode(&[0x7f, 1, 2, 3]),
            Err(StoreError::Inconsistent(_))
        ));
        assert!(matches!(decode(&[]), Err(StoreError::Inconsistent(_))));
    }

    #[test]
    fn test_empty_body_round_trips() {
        let encoded = encode(b"", Compression::gzip(6)).unwrap();
        assert!(decode(&encoded).unwrap().is_empty());
    }
}
