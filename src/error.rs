//! Error types for BoltKV
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::page::Pgid;

/// Result type alias using BoltError
pub type Result<T> = std::result::Result<T, BoltError>;

/// Unified error type for BoltKV operations
#[derive(Debug, Error)]
pub enum BoltError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Database Errors
    // -------------------------------------------------------------------------
    #[error("Database not open")]
    DatabaseNotOpen,

    #[error("Database is read-only")]
    DatabaseReadOnly,

    #[error("Database file is locked by another handle: {0}")]
    DatabaseLocked(PathBuf),

    #[error("Invalid database: {0}")]
    Invalid(String),

    #[error("Version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Meta page checksum mismatch")]
    ChecksumMismatch,

    #[error("Mmap too large: {size} bytes")]
    MmapTooLarge { size: usize },

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction is not writable")]
    TxNotWritable,

    #[error("Commit failed: {0}")]
    CommitFailed(#[source] Box<BoltError>),

    // -------------------------------------------------------------------------
    // Bucket Errors
    // -------------------------------------------------------------------------
    #[error("Bucket not found")]
    BucketNotFound,

    #[error("Bucket name required")]
    BucketNameRequired,

    #[error("Key required")]
    KeyRequired,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Incompatible value")]
    IncompatibleValue,

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corrupted(String),

    #[error("Page {pgid} already freed")]
    DoubleFree { pgid: Pgid },

    #[error("Page {pgid} out of bounds")]
    PageOutOfBounds { pgid: Pgid },

    #[error("Consistency check failed: {}", .0.join("; "))]
    Inconsistent(Vec<String>),
}

impl From<bincode::Error> for BoltError {
    fn from(err: bincode::Error) -> Self {
        BoltError::Serialization(err.to_string())
    }
}
