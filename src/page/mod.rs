//! Page Module
//!
//! Fixed binary layout of every on-disk page and accessors over raw buffers.
//!
//! ## Page Format
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────┬────────────────────────┐
//! │ Id (8)   │ Flags (2)│ Count (2)│ Overflow (4) │    Body (flag-based)   │
//! └──────────┴──────────┴──────────┴──────────────┴────────────────────────┘
//! ```
//!
//! ### Body by Page Type
//! - LEAF:     count × leaf element (16) + packed key/value bytes
//! - BRANCH:   count × branch element (16) + packed key bytes
//! - META:     one meta record (64)
//! - FREELIST: count × page id (8), or 0xFFFF + real count in the first slot
//!
//! Element `pos` fields are byte offsets from the element's own address to
//! its payload, so payloads pack contiguously after the element array.
//!
//! All integers are little-endian.

mod meta;

pub use meta::{BucketHeader, Meta, BUCKET_HEADER_SIZE, MAGIC, META_SIZE, VERSION};

use std::cmp::Ordering;

use crate::error::{BoltError, Result};

/// Page identifier
pub type Pgid = u64;

/// Transaction identifier
pub type Txid = u64;

/// Page header size: id (8) + flags (2) + count (2) + overflow (4)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Leaf element size: flags (4) + pos (4) + ksize (4) + vsize (4)
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Branch element size: pos (4) + ksize (4) + pgid (8)
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Minimum number of entries a split leaves on each side
pub const MIN_KEYS_PER_PAGE: usize = 2;

// =============================================================================
// Page Flags
// =============================================================================

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

/// Leaf element flag marking the value as a nested bucket
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

// =============================================================================
// Little-endian helpers
// =============================================================================

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Write a page header into the start of `buf`
pub(crate) fn write_header(buf: &mut [u8], id: Pgid, flags: u16, count: u16, overflow: u32) {
    write_u64(buf, 0, id);
    write_u16(buf, 8, flags);
    write_u16(buf, 10, count);
    write_u32(buf, 12, overflow);
}

// =============================================================================
// Elements
// =============================================================================

/// A decoded leaf element borrowing its key and value from the page
#[derive(Debug, Clone, Copy)]
pub struct LeafElement<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// A decoded branch element borrowing its key from the page
#[derive(Debug, Clone, Copy)]
pub struct BranchElement<'a> {
    pub pgid: Pgid,
    pub key: &'a [u8],
}

// =============================================================================
// Page View
// =============================================================================

/// Read-only view over one page (plus its overflow pages)
#[derive(Clone, Copy)]
pub struct Page<'a> {
    buf: &'a [u8],
}

impl<'a> Page<'a> {
    /// Wrap a raw buffer. Fails if the buffer can't hold a header.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(BoltError::Corrupted(format!(
                "page buffer too small: {} bytes",
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    pub fn id(&self) -> Pgid {
        read_u64(self.buf, 0)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.buf, 8)
    }

    pub fn count(&self) -> usize {
        read_u16(self.buf, 10) as usize
    }

    pub fn overflow(&self) -> u32 {
        read_u32(self.buf, 12)
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & LEAF_PAGE_FLAG != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & BRANCH_PAGE_FLAG != 0
    }

    /// Human-readable page type, used in diagnostics
    pub fn type_name(&self) -> String {
        let flags = self.flags();
        if flags & BRANCH_PAGE_FLAG != 0 {
            "branch".to_string()
        } else if flags & LEAF_PAGE_FLAG != 0 {
            "leaf".to_string()
        } else if flags & META_PAGE_FLAG != 0 {
            "meta".to_string()
        } else if flags & FREELIST_PAGE_FLAG != 0 {
            "freelist".to_string()
        } else {
            format!("unknown<{:02x}>", flags)
        }
    }

    /// Raw page bytes
    pub fn data(&self) -> &'a [u8] {
        self.buf
    }

    fn slice(&self, off: usize, len: usize) -> Result<&'a [u8]> {
        let end = off.checked_add(len).ok_or_else(|| self.out_of_range(off, len))?;
        self.buf.get(off..end).ok_or_else(|| self.out_of_range(off, len))
    }

    fn out_of_range(&self, off: usize, len: usize) -> BoltError {
        BoltError::Corrupted(format!(
            "page {}: range {}+{} exceeds {} bytes",
            self.id(),
            off,
            len,
            self.buf.len()
        ))
    }

    fn element_offset(&self, index: usize) -> Result<usize> {
        if index >= self.count() {
            return Err(BoltError::Corrupted(format!(
                "page {}: element {} out of {}",
                self.id(),
                index,
                self.count()
            )));
        }
        Ok(PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE)
    }

    /// Leaf element at `index`
    pub fn leaf_element(&self, index: usize) -> Result<LeafElement<'a>> {
        let off = self.element_offset(index)?;
        let elem = self.slice(off, LEAF_ELEMENT_SIZE)?;
        let flags = read_u32(elem, 0);
        let pos = read_u32(elem, 4) as usize;
        let ksize = read_u32(elem, 8) as usize;
        let vsize = read_u32(elem, 12) as usize;
        let key = self.slice(off + pos, ksize)?;
        let value = self.slice(off + pos + ksize, vsize)?;
        Ok(LeafElement { flags, key, value })
    }

    /// Branch element at `index`
    pub fn branch_element(&self, index: usize) -> Result<BranchElement<'a>> {
        let off = self.element_offset(index)?;
        let elem = self.slice(off, BRANCH_ELEMENT_SIZE)?;
        let pos = read_u32(elem, 0) as usize;
        let ksize = read_u32(elem, 4) as usize;
        let pgid = read_u64(elem, 8);
        let key = self.slice(off + pos, ksize)?;
        Ok(BranchElement { pgid, key })
    }

    /// Key at `index`, for either element kind
    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        if self.is_leaf() {
            Ok(self.leaf_element(index)?.key)
        } else {
            Ok(self.branch_element(index)?.key)
        }
    }

    /// Binary search for `key`. Returns the matching index with `true`, or the
    /// first index whose key is greater with `false`.
    pub fn search(&self, key: &[u8]) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    /// Page id stored in free-list slot `index`
    pub fn u64_slot(&self, index: usize) -> Result<u64> {
        let slot = self.slice(PAGE_HEADER_SIZE + index * 8, 8)?;
        Ok(read_u64(slot, 0))
    }

    /// Decode the meta record that follows the header
    pub fn meta(&self) -> Result<Meta> {
        Meta::decode(self.slice(PAGE_HEADER_SIZE, META_SIZE)?)
    }
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("count", &self.count())
            .field("overflow", &self.overflow())
            .finish()
    }
}
