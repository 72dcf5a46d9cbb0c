//! Meta record and bucket header
//!
//! Both are fixed-layout records encoded with bincode's fixed-int,
//! little-endian format, which packs fields back to back with no padding.
//!
//! ## Meta Layout (64 bytes)
//! ```text
//! ┌────────┬─────────┬──────────┬───────┬─────────────────┬──────────┬──────┬──────┬──────────┐
//! │Magic(4)│Version 4│PageSize 4│Flags 4│Root{pgid,seq}16 │Freelist 8│Pgid 8│Txid 8│Checksum 8│
//! └────────┴─────────┴──────────┴───────┴─────────────────┴──────────┴──────┴──────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};

use super::{write_header, Pgid, Txid, META_PAGE_FLAG, PAGE_HEADER_SIZE};
use crate::error::{BoltError, Result};

/// File magic
pub const MAGIC: u32 = 0xED0C_DAED;

/// On-disk format version
pub const VERSION: u32 = 1;

/// Encoded size of a meta record
pub const META_SIZE: usize = 64;

/// Encoded size of a bucket header
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Bytes covered by the checksum (everything before it)
const CHECKSUM_OFFSET: usize = 56;

/// Persisted header of a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHeader {
    /// Root page id, or 0 for an inline bucket
    pub root: Pgid,
    /// Monotonically increasing sequence
    pub sequence: u64,
}

impl BucketHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.get(..BUCKET_HEADER_SIZE).ok_or_else(|| {
            BoltError::Corrupted(format!("bucket header needs {} bytes", BUCKET_HEADER_SIZE))
        })?;
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Durable root descriptor, stored in pages 0 and 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub root: BucketHeader,
    pub freelist: Pgid,
    /// High-water mark: first page id never allocated
    pub pgid: Pgid,
    pub txid: Txid,
    pub checksum: u64,
}

impl Meta {
    /// Meta for a freshly initialized file
    pub fn new(page_size: u32, txid: Txid, freelist: Pgid, root: Pgid, pgid: Pgid) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            root: BucketHeader { root, sequence: 0 },
            freelist,
            pgid,
            txid,
            checksum: 0,
        };
        meta.checksum = meta.sum();
        meta
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// CRC32 of every field before the checksum
    pub fn sum(&self) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.page_size.to_le_bytes());
        hasher.update(&self.flags.to_le_bytes());
        hasher.update(&self.root.root.to_le_bytes());
        hasher.update(&self.root.sequence.to_le_bytes());
        hasher.update(&self.freelist.to_le_bytes());
        hasher.update(&self.pgid.to_le_bytes());
        hasher.update(&self.txid.to_le_bytes());
        hasher.finalize() as u64
    }

    /// Magic and version must match. A zero checksum is accepted unchecked.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(BoltError::Invalid(format!("bad magic 0x{:08x}", self.magic)));
        }
        if self.version != VERSION {
            return Err(BoltError::VersionMismatch {
                found: self.version,
                expected: VERSION,
            });
        }
        if self.checksum != 0 && self.checksum != self.sum() {
            return Err(BoltError::ChecksumMismatch);
        }
        Ok(())
    }

    /// Serialize into a page buffer: header for slot `txid % 2`, then the
    /// record with a freshly computed checksum.
    pub fn write(&mut self, buf: &mut [u8]) -> Result<()> {
        self.checksum = self.sum();
        let bytes = self.encode()?;
        write_header(buf, self.txid % 2, META_PAGE_FLAG, 0, 0);
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}
