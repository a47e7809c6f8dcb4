//! LATTICE API - Records and cache contracts
//!
//! Pure data types and strategy traits for the LATTICE normalized object
//! cache. This crate contains the storage unit ([`Record`]), the typed
//! shape interface ([`ObjectShape`]), the injected strategies
//! ([`CacheKeyResolver`], [`CacheResolver`], [`RecordMerger`]) and the
//! pluggable backend trait ([`RecordStore`]). The algorithms that operate
//! on these types live in the `lattice-cache` crate.

pub mod error;
pub mod headers;
pub mod merger;
pub mod record;
pub mod resolver;
pub mod shape;
pub mod store;

pub use error::{EvictionError, LatticeError, LatticeResult, ReadError, StoreError};
pub use headers::{CacheHeaders, DO_NOT_STORE, EVICT_AFTER_READ, STORE_PARTIAL_RESPONSES};
pub use merger::{FieldRecordMerger, RecordMerger};
pub use record::{
    field_key, meta, CacheKey, ChangedKey, FieldKey, FieldValue, MutationId, Record, RecordSet,
    REFERENCE_SENTINEL,
};
pub use resolver::{
    CacheKeyResolver, CacheResolver, FieldContext, KeyContext, LiteralCacheResolver,
    TypePolicyResolver,
};
pub use shape::{FieldPath, ObjectShape, Selection, SelectionKind};
pub use store::RecordStore;
