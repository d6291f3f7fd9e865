//! CRC32 integrity checks
//!
//! Used for:
//! - oplog entries (one checksum per serialized record)
//! - session table snapshots (framed block with a checksum trailer)
//!
//! ## Usage
//! ```ignore
//! use motedb_session::storage::checksum::Checksum;
//!
//! let checksum = Checksum::compute(b"payload");
//! Checksum::verify(b"payload", checksum)?;
//! ```

use crate::{Result, SessionError};
use crc32fast::Hasher;

/// CRC32 checksum calculator
pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn verify(data: &[u8], expected: u32) -> std::result::Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }

        Ok(())
    }

    /// Length of a block as stored in a `u32` length prefix
    pub fn frame_len(len: usize) -> Result<u32> {
        u32::try_from(len).map_err(|_| {
            SessionError::InvalidArgument(format!(
                "block of {} bytes exceeds the {} byte frame limit",
                len,
                u32::MAX
            ))
        })
    }

    /// Frame a block as `[data_len: u32][data][checksum: u32]`
    pub fn encode_with_checksum(data: &[u8]) -> Result<Vec<u8>> {
        let data_len = Self::frame_len(data.len())?;
        let checksum = Self::compute(data);
        let mut encoded = Vec::with_capacity(4 + data.len() + 4);

        encoded.extend_from_slice(&data_len.to_le_bytes());
        encoded.extend_from_slice(data);
        encoded.extend_from_slice(&checksum.to_le_bytes());

        Ok(encoded)
    }

    /// Decode a block framed by [`Checksum::encode_with_checksum`] and verify it
    pub fn decode_with_checksum(encoded: &[u8]) -> std::result::Result<Vec<u8>, ChecksumError> {
        if encoded.len() < 8 {
            return Err(ChecksumError::InvalidFormat("Data too short".to_string()));
        }

        let data_len = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;

        if encoded.len() != 4 + data_len + 4 {
            return Err(ChecksumError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                4 + data_len + 4,
                encoded.len()
            )));
        }

        let data = &encoded[4..4 + data_len];
        let expected = u32::from_le_bytes([
            encoded[4 + data_len],
            encoded[4 + data_len + 1],
            encoded[4 + data_len + 2],
            encoded[4 + data_len + 3],
        ]);

        Self::verify(data, expected)?;

        Ok(data.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },

    #[error("Invalid checksum format: {0}")]
    InvalidFormat(String),
}

impl From<ChecksumError> for SessionError {
    fn from(err: ChecksumError) -> Self {
        SessionError::Corruption(err.to_string())
    }
}
