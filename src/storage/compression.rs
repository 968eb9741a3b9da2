//! Payload Compression
//!
//! Serialized item values above a size threshold are LZ4 compressed before
//! they reach a durable tier. The algorithm actually used is stored next to
//! the payload so reads decode correctly even after the threshold changes.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Payload encodings a backend may persist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Raw serialized bytes
    #[default]
    None,
    /// LZ4 block with prepended size
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != CompressionAlgorithm::None
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionAlgorithm::None),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::DecompressionFailed {
                algorithm: other.to_string(),
                reason: "unknown algorithm".into(),
            }),
        }
    }
}

/// Compression settings of a durable tier
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    /// Payloads smaller than this are stored raw
    pub threshold_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 4096,
            level: 4,
        }
    }
}

// =============================================================================
// Compressors
// =============================================================================

/// Block compressor
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

struct Passthrough;

impl Compressor for Passthrough {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

struct Lz4Block {
    level: i32,
}

impl Compressor for Lz4Block {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Encodes item values into stored payloads and back
pub struct CompressionManager {
    config: CompressionConfig,
    passthrough: Passthrough,
    lz4: Lz4Block,
}

impl CompressionManager {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Block {
                level: config.level,
            },
            passthrough: Passthrough,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.passthrough,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Serialize a value, compressing when it is large enough to pay off
    ///
    /// A compression failure or a result that is not smaller falls back to
    /// the raw encoding.
    pub fn encode(&self, value: &Value) -> Result<(Bytes, CompressionAlgorithm)> {
        let raw = serde_json::to_vec(value)?;
        if (raw.len() as u64) < self.config.threshold_bytes {
            return Ok((Bytes::from(raw), CompressionAlgorithm::None));
        }

        match self.lz4.compress(&raw) {
            Ok(compressed) if compressed.len() < raw.len() => {
                Ok((Bytes::from(compressed), CompressionAlgorithm::Lz4))
            }
            Ok(_) => Ok((Bytes::from(raw), CompressionAlgorithm::None)),
            Err(e) => {
                tracing::warn!("Compression failed, storing raw payload: {}", e);
                Ok((Bytes::from(raw), CompressionAlgorithm::None))
            }
        }
    }

    /// Decode a stored payload written by [`encode`](Self::encode)
    pub fn decode(&self, payload: &[u8], algorithm: CompressionAlgorithm) -> Result<Value> {
        let raw = self.compressor(algorithm).decompress(payload)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
