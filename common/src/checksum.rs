//! Chunked CRC32C checksums for replica data.
//!
//! A replica's bytes are split into `bytes_per_checksum` chunks, each with its
//! own CRC32C. Verification points at the first bad chunk so callers can tell a
//! flipped byte from a short file.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const DEFAULT_BYTES_PER_CHECKSUM: u32 = 512;

/// Stored checksums of one replica
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    /// Chunk size the sums were computed with
    pub bytes_per_checksum: u32,

    /// Length of the data the sums cover
    pub length: u64,

    /// One CRC32C per chunk, the last chunk may be short
    pub sums: Vec<u32>,
}

/// Result of checking data against stored checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumCheck {
    Ok,

    /// A chunk's CRC differs; `offset` is the chunk's first byte
    Mismatch { offset: u64 },

    /// Data length disagrees with the length the checksums were taken over
    LengthMismatch { expected: u64, actual: u64 },
}

impl Checksums {
    pub fn compute(data: &[u8], bytes_per_checksum: u32) -> Self {
        let chunk = bytes_per_checksum.max(1) as usize;
        Self {
            bytes_per_checksum: chunk as u32,
            length: data.len() as u64,
            sums: data.chunks(chunk).map(|c| CRC32C.checksum(c)).collect(),
        }
    }

    pub fn verify(&self, data: &[u8]) -> ChecksumCheck {
        if data.len() as u64 != self.length {
            return ChecksumCheck::LengthMismatch {
                expected: self.length,
                actual: data.len() as u64,
            };
        }
        let chunk = self.bytes_per_checksum.max(1) as usize;
        for (index, (bytes, expected)) in data.chunks(chunk).zip(&self.sums).enumerate() {
            if CRC32C.checksum(bytes) != *expected {
                return ChecksumCheck::Mismatch {
                    offset: (index * chunk) as u64,
                };
            }
        }
        ChecksumCheck::Ok
    }
}
