//! Error types for LATTICE operations.
//!
//! The normalizer and record merger are tolerant by construction and never
//! fail on missing or extra fields. Only the reader raises user-facing
//! errors, and only in strict mode; a dangling reference is not an error
//! until a read actually needs it.

use crate::record::CacheKey;
use crate::shape::FieldPath;
use thiserror::Error;

/// Read-path errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// A required field or record was absent during a strict read. The path
    /// names the first missing field. Recovered by the caller (e.g. fall
    /// back to network), not fatal to the store.
    #[error("Cache miss at {path}")]
    CacheMiss { path: FieldPath },

    /// A stored record did not match the requested shape (e.g. a scalar
    /// where the shape expects an object).
    #[error("Malformed record {key}: {reason}")]
    MalformedRecord { key: CacheKey, reason: String },
}

/// Eviction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvictionError {
    /// The eviction policy itself is invalid.
    #[error("Invalid eviction policy: {reason}")]
    InvalidPolicy { reason: String },

    /// The evictor was asked to trim below the size of a single record that
    /// cannot be split. Programmer error, surfaced rather than ignored.
    #[error(
        "Cannot trim below single record {key}: record is {record_bytes} bytes, target is {target_bytes} bytes"
    )]
    TrimBelowSingleRecord {
        key: CacheKey,
        record_bytes: u64,
        target_bytes: u64,
    },
}

/// Store orchestration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record store backend reported a failure.
    #[error("Backend error: {reason}")]
    Backend { reason: String },

    /// Invalid store configuration.
    #[error("Invalid value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

/// Master error type for all LATTICE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LatticeError {
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Eviction error: {0}")]
    Eviction(#[from] EvictionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for LATTICE operations.
pub type LatticeResult<T> = Result<T, LatticeError>;

// =============================================================================
// TESTS
// =============================================================================
