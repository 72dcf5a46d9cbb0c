//! # boltkv
//!
//! An embedded, single-file key-value store with:
//! - Copy-on-write B+trees, one per bucket, nestable to any depth
//! - Serializable read-write transactions, one at a time
//! - Any number of concurrent read-only snapshot transactions
//! - Crash safety through two alternating checksummed meta pages
//! - A memory-mapped read path
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Db                                │
//! │        (file lock, mmap, free list, writer permit)           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ begin_read / begin_write
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                            Tx                                │
//! │          (snapshot meta, dirty pages, node arena)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Bucket    │          │   Cursor    │
//!   │ (get / put) │          │ (ordered)   │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────────────────────────────┐
//!   │   Node (in memory) / Page (mapped)  │
//!   └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use boltkv::{Db, Options};
//!
//! # fn main() -> boltkv::Result<()> {
//! let db = Db::open("my.db", Options::default())?;
//!
//! db.update(|tx| {
//!     let mut users = tx.create_bucket(b"users")?;
//!     users.put(b"alice", b"admin")
//! })?;
//!
//! db.view(|tx| {
//!     if let Some(users) = tx.bucket(b"users")? {
//!         assert_eq!(users.get(b"alice")?.as_deref(), Some(&b"admin"[..]));
//!     }
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page;
pub mod freelist;
mod tree;

pub mod bucket;
pub mod tx;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BoltError, Result};
pub use config::Options;
pub use db::{Db, DbStats};
pub use tx::{Tx, TxStats};
pub use bucket::{Bucket, DEFAULT_FILL_PERCENT, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use tree::Cursor;

/// Owned key or value bytes
pub type Item = bytes::Bytes;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of boltkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
