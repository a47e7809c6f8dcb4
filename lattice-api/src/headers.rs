//! Cache headers: string flags passed alongside writes and reads.

use std::collections::BTreeSet;

/// Skip the merge entirely; the response is delivered to the caller but
/// nothing is written to the store.
pub const DO_NOT_STORE: &str = "do-not-store";

/// Mark merged records for removal once the next read touching them
/// completes.
pub const EVICT_AFTER_READ: &str = "evict-after-read";

/// Merge even if the response carried field errors.
pub const STORE_PARTIAL_RESPONSES: &str = "store-partial-responses";

/// A set of string flags honored at merge and read time.
///
/// Headers are opaque to the core algorithms; only the store and backends
/// interpret the well-known flags above.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHeaders(BTreeSet<String>);

impl CacheHeaders {
    /// No headers.
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a flag, returning the headers for chaining.
    pub fn with(mut self, flag: &str) -> Self {
        self.0.insert(flag.to_string());
        self
    }

    /// Whether a flag is present.
    pub fn has(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    /// Whether no flags are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
