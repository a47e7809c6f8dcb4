//! LATTICE Cache - Normalization, Reading and Store Orchestration
//!
//! The algorithms layered over the contracts in lattice-api: response
//! normalization, cycle-safe denormalizing reads, the optimistic overlay,
//! size-bounded eviction and the locked store orchestrator that ties them
//! together behind watch streams.

pub mod evictor;
pub mod memory;
pub mod normalizer;
pub mod optimistic;
pub mod reader;
pub mod store;

pub use evictor::{EvictionPolicy, EvictionReport, Evictor};
pub use memory::{MemoryRecordStore, StoreStats};
pub use normalizer::Normalizer;
pub use optimistic::{MergeConflict, OptimisticOverlay};
pub use reader::{ReadMode, ReadResult, Reader, RecordSource, DEFAULT_MAX_READ_DEPTH};
pub use store::{CacheStore, StoreConfig, WatchHandle};
