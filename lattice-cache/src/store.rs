//! The store orchestrator: locking, change notification and watch streams.
//!
//! One `CacheStore` owns the record store backend and the optimistic
//! overlay behind a single readers-writer lock. Reads acquire the lock
//! shared; merges, optimistic writes, rollbacks, removals and eviction
//! acquire it exclusively, so writes are fully serialized and a watcher
//! re-read triggered by merge N always observes the post-merge-N state
//! (or a newer one).
//!
//! The normalizer and reader are pure, synchronous computations over
//! resident data; callers suspend only at lock acquisition.

use crate::evictor::{EvictionPolicy, EvictionReport, Evictor};
use crate::normalizer::Normalizer;
use crate::optimistic::{MergeConflict, OptimisticOverlay};
use crate::reader::{ReadMode, ReadResult, Reader, RecordSource, DEFAULT_MAX_READ_DEPTH};
use chrono::Utc;
use lattice_api::{
    CacheHeaders, CacheKey, CacheKeyResolver, CacheResolver, ChangedKey, LatticeResult,
    LiteralCacheResolver, MutationId, ObjectShape, Record, RecordSet, RecordStore, StoreError,
    TypePolicyResolver, DO_NOT_STORE, STORE_PARTIAL_RESPONSES,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Configuration for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Eviction policy; `None` disables eviction.
    pub eviction: Option<EvictionPolicy>,
    /// Read mode used for watcher re-reads registered without an explicit
    /// mode.
    pub default_read_mode: ReadMode,
    /// Reference-expansion depth cap handed to the reader.
    pub max_read_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            eviction: None,
            default_read_mode: ReadMode::Strict,
            max_read_depth: DEFAULT_MAX_READ_DEPTH,
        }
    }
}

impl StoreConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the eviction policy.
    pub fn with_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = Some(policy);
        self
    }

    /// Set the default read mode for watchers.
    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.default_read_mode = mode;
        self
    }

    /// Set the reader depth cap.
    pub fn with_max_read_depth(mut self, depth: usize) -> Self {
        self.max_read_depth = depth;
        self
    }

    /// Check the config's invariants.
    pub fn validate(&self) -> LatticeResult<()> {
        if self.max_read_depth == 0 {
            return Err(StoreError::InvalidConfig {
                field: "max_read_depth".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if let Some(policy) = &self.eviction {
            policy.validate()?;
        }
        Ok(())
    }
}

/// The two mutable shared resources, guarded together by one lock.
struct StoreState {
    base: Box<dyn RecordStore>,
    overlay: OptimisticOverlay,
}

/// Overlay-first read view: a key present in the overlay shadows the base
/// store entirely.
struct OverlayView<'a> {
    state: &'a StoreState,
}

impl RecordSource for OverlayView<'_> {
    fn record(&self, key: &CacheKey) -> Option<Record> {
        if let Some(record) = self.state.overlay.lookup(key) {
            return Some(record);
        }
        self.state.base.get(key)
    }
}

/// Whether any of the touched base records carries the evict-after-read
/// flag.
fn any_flagged(state: &StoreState, touched: &BTreeSet<CacheKey>) -> bool {
    touched.iter().any(|key| {
        state
            .base
            .get(key)
            .map(|record| record.evict_after_read())
            .unwrap_or(false)
    })
}

struct Watcher {
    root_key: CacheKey,
    shape: Arc<ObjectShape>,
    mode: ReadMode,
    dependencies: BTreeSet<CacheKey>,
    /// Write generation of the last result delivered; newer deliveries
    /// cancel older in-flight ones.
    last_notified: u64,
    tx: mpsc::UnboundedSender<ReadResult>,
}

/// Receiving half of a watch registration.
///
/// Dropping the handle closes the channel; the store prunes the watcher on
/// its next delivery attempt. Call [`CacheStore::unwatch`] for immediate
/// deregistration.
pub struct WatchHandle {
    id: u64,
    rx: mpsc::UnboundedReceiver<ReadResult>,
}

impl WatchHandle {
    /// The watcher id, usable with [`CacheStore::unwatch`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next re-read result.
    pub async fn next(&mut self) -> Option<ReadResult> {
        self.rx.recv().await
    }

    /// Convert into a [`tokio_stream`] stream of results.
    pub fn into_stream(self) -> UnboundedReceiverStream<ReadResult> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// The normalized cache: read/write/optimistic/evict operations over an
/// injected [`RecordStore`] backend, with change notification.
///
/// Construction wires in the key resolution and read-hook strategies once;
/// there is no ambient or static state, and disposal is just dropping the
/// store (watch channels close with it).
pub struct CacheStore {
    state: tokio::sync::RwLock<StoreState>,
    key_resolver: Arc<dyn CacheKeyResolver>,
    cache_resolver: Arc<dyn CacheResolver>,
    config: StoreConfig,
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_watcher_id: AtomicU64,
    write_generation: AtomicU64,
}

impl CacheStore {
    /// Create a store over a backend with injected strategies.
    pub fn new(
        backend: Box<dyn RecordStore>,
        key_resolver: Arc<dyn CacheKeyResolver>,
        cache_resolver: Arc<dyn CacheResolver>,
        config: StoreConfig,
    ) -> LatticeResult<Self> {
        config.validate()?;
        Ok(Self {
            state: tokio::sync::RwLock::new(StoreState {
                base: backend,
                overlay: OptimisticOverlay::new(),
            }),
            key_resolver,
            cache_resolver,
            config,
            watchers: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(0),
            write_generation: AtomicU64::new(0),
        })
    }

    /// Create a store with the built-in type-policy resolver, literal read
    /// hook and default config.
    pub fn with_defaults(backend: Box<dyn RecordStore>) -> Self {
        Self {
            state: tokio::sync::RwLock::new(StoreState {
                base: backend,
                overlay: OptimisticOverlay::new(),
            }),
            key_resolver: Arc::new(TypePolicyResolver::new()),
            cache_resolver: Arc::new(LiteralCacheResolver),
            config: StoreConfig::default(),
            watchers: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(0),
            write_generation: AtomicU64::new(0),
        }
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Normalize a response for a shape, without touching the store.
    ///
    /// Writing is a separate [`CacheStore::merge`] call, so callers can
    /// normalize speculatively (e.g. to compute a diff).
    pub fn normalize(
        &self,
        root_key: &CacheKey,
        shape: &ObjectShape,
        data: &serde_json::Value,
    ) -> RecordSet {
        Normalizer::new(self.key_resolver.as_ref()).normalize(root_key.clone(), shape, data)
    }

    /// Merge a record set into the base store, returning the changed keys
    /// and re-triggering intersecting watchers.
    ///
    /// A real merge supersedes any optimistic overlay entries for the
    /// merged keys.
    pub async fn merge(
        &self,
        records: RecordSet,
        headers: &CacheHeaders,
    ) -> LatticeResult<BTreeSet<ChangedKey>> {
        if headers.has(DO_NOT_STORE) {
            return Ok(BTreeSet::new());
        }
        let merged_keys: Vec<CacheKey> = records.keys().cloned().collect();
        let mut changed = {
            let mut state = self.state.write().await;
            let mut changed = state
                .base
                .merge(records.into_records(), headers, Utc::now());
            changed.extend(state.overlay.supersede(&merged_keys));
            changed
        };
        changed = self.finish_write(changed).await;
        Ok(changed)
    }

    /// Normalize and merge a response in one step.
    pub async fn write(
        &self,
        root_key: &CacheKey,
        shape: &ObjectShape,
        data: &serde_json::Value,
        headers: &CacheHeaders,
    ) -> LatticeResult<BTreeSet<ChangedKey>> {
        self.write_response(root_key, shape, data, false, headers)
            .await
    }

    /// Normalize and merge a response that may have carried field errors.
    ///
    /// Responses with field errors are only stored when the
    /// [`STORE_PARTIAL_RESPONSES`] header is set.
    pub async fn write_response(
        &self,
        root_key: &CacheKey,
        shape: &ObjectShape,
        data: &serde_json::Value,
        has_field_errors: bool,
        headers: &CacheHeaders,
    ) -> LatticeResult<BTreeSet<ChangedKey>> {
        if has_field_errors && !headers.has(STORE_PARTIAL_RESPONSES) {
            return Ok(BTreeSet::new());
        }
        let records = self.normalize(root_key, shape, data);
        self.merge(records, headers).await
    }

    /// Read a shape rooted at `root_key`, consulting the optimistic
    /// overlay first.
    ///
    /// Records flagged evict-after-read that the read touched are removed
    /// once it completes.
    pub async fn read(
        &self,
        root_key: &CacheKey,
        shape: &ObjectShape,
        mode: ReadMode,
    ) -> LatticeResult<ReadResult> {
        let (result, flagged) = {
            let state = self.state.read().await;
            let view = OverlayView { state: &state };
            let result = Reader::new(&view, self.cache_resolver.as_ref(), self.config.max_read_depth)
                .read(root_key, shape, mode)?;
            let flagged = any_flagged(&state, &result.dependencies);
            (result, flagged)
        };
        if flagged {
            self.sweep_evict_after_read(&result.dependencies).await;
        }
        Ok(result)
    }

    /// Remove evict-after-read records among the keys a completed read
    /// touched.
    ///
    /// Flags are rechecked under the write lock: a merge landing between
    /// the read and the sweep clears the flag, so its fresh data is never
    /// swept. Removals notify dependent watchers like any other write.
    async fn sweep_evict_after_read(&self, touched: &BTreeSet<CacheKey>) {
        let changed = {
            let mut state = self.state.write().await;
            let to_evict: Vec<CacheKey> = touched
                .iter()
                .filter(|key| {
                    state
                        .base
                        .get(key)
                        .map(|record| record.evict_after_read())
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            let mut changed = BTreeSet::new();
            for key in to_evict {
                if state.base.remove(&key, false) {
                    changed.insert(ChangedKey::new(key, "*"));
                }
            }
            changed
        };
        if !changed.is_empty() {
            debug!(count = changed.len(), "removed evict-after-read records");
            self.finish_write(changed).await;
        }
    }

    /// Apply an optimistic record set for a mutation, shadowing the base
    /// store until rollback or supersession.
    ///
    /// Conflicts between concurrent overlays resolve last-writer-wins and
    /// are returned (and logged), never thrown.
    pub async fn write_optimistic(
        &self,
        mutation_id: MutationId,
        records: RecordSet,
    ) -> Vec<MergeConflict> {
        let (changed, conflicts) = {
            let mut state = self.state.write().await;
            state.overlay.apply(mutation_id, records)
        };
        for conflict in &conflicts {
            warn!(%conflict, "last writer wins");
        }
        self.finish_write(changed).await;
        conflicts
    }

    /// Roll back one mutation's optimistic records.
    pub async fn rollback_optimistic(&self, mutation_id: MutationId) -> BTreeSet<ChangedKey> {
        let changed = {
            let mut state = self.state.write().await;
            state.overlay.rollback(mutation_id)
        };
        self.finish_write(changed).await
    }

    /// Remove a record, optionally cascading through its references.
    pub async fn remove(&self, key: &CacheKey, cascade: bool) -> bool {
        let (removed, changed) = {
            let mut state = self.state.write().await;
            let removed = state.base.remove(key, cascade);
            let changed = if removed {
                BTreeSet::from([ChangedKey::new(key.clone(), "*")])
            } else {
                BTreeSet::new()
            };
            (removed, changed)
        };
        self.finish_write(changed).await;
        removed
    }

    /// Run an eviction pass if a policy is configured.
    pub async fn evict(&self) -> LatticeResult<EvictionReport> {
        let Some(policy) = self.config.eviction.clone() else {
            return Ok(EvictionReport::default());
        };
        let report = {
            let mut state = self.state.write().await;
            Evictor::new(policy).evict(state.base.as_mut())?
        };
        if !report.is_empty() {
            let changed = report
                .removed
                .iter()
                .map(|key| ChangedKey::new(key.clone(), "*"))
                .collect();
            self.finish_write(changed).await;
        }
        Ok(report)
    }

    /// Register a live query: returns the initial read plus a stream that
    /// yields a new result whenever a merge's changed keys intersect the
    /// watcher's dependency set.
    pub async fn watch(
        &self,
        root_key: &CacheKey,
        shape: Arc<ObjectShape>,
        mode: ReadMode,
    ) -> LatticeResult<(ReadResult, WatchHandle)> {
        // The initial read and the registry insert happen under one state
        // guard: a concurrent merge either lands before the guard and shows
        // in the initial result, or queues behind it and notifies the
        // already-registered watcher. The generation is loaded under the
        // guard too, so such a queued merge's bump is always newer.
        let (initial, id, rx, flagged) = {
            let state = self.state.read().await;
            let view = OverlayView { state: &state };
            let initial = Reader::new(&view, self.cache_resolver.as_ref(), self.config.max_read_depth)
                .read(root_key, &shape, mode)?;
            let flagged = any_flagged(&state, &initial.dependencies);
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
            let watcher = Watcher {
                root_key: root_key.clone(),
                shape,
                mode,
                dependencies: initial.dependencies.clone(),
                last_notified: self.write_generation.load(Ordering::SeqCst),
                tx,
            };
            self.lock_watchers().insert(id, watcher);
            (initial, id, rx, flagged)
        };
        if flagged {
            self.sweep_evict_after_read(&initial.dependencies).await;
        }
        Ok((initial, WatchHandle { id, rx }))
    }

    /// Deregister a watcher. Returns whether it was still registered.
    pub fn unwatch(&self, id: u64) -> bool {
        self.lock_watchers().remove(&id).is_some()
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.lock_watchers().len()
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Watcher>> {
        // A poisoned watcher registry only means a panicked notify; the
        // map itself is still coherent.
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stamp a write generation on a completed write and notify watchers.
    async fn finish_write(&self, changed: BTreeSet<ChangedKey>) -> BTreeSet<ChangedKey> {
        if changed.is_empty() {
            return changed;
        }
        let generation = self.write_generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(changed = changed.len(), generation, "write applied");
        self.notify(&changed, generation).await;
        changed
    }

    /// Re-run the reader for every watcher whose dependency set intersects
    /// the changed record keys, delivering the fresh result.
    ///
    /// A re-read always runs against the current state, which is at least
    /// as new as the write that triggered it. If a newer write has already
    /// delivered a result to a watcher, the older in-flight delivery for
    /// that watcher is discarded.
    async fn notify(&self, changed: &BTreeSet<ChangedKey>, generation: u64) {
        let changed_records: BTreeSet<&CacheKey> = changed.iter().map(|c| &c.key).collect();
        let affected: Vec<(u64, CacheKey, Arc<ObjectShape>, ReadMode)> = {
            let watchers = self.lock_watchers();
            watchers
                .iter()
                .filter(|(_, w)| w.dependencies.iter().any(|d| changed_records.contains(d)))
                .map(|(id, w)| (*id, w.root_key.clone(), Arc::clone(&w.shape), w.mode))
                .collect()
        };

        for (id, root_key, shape, mode) in affected {
            let result = {
                let state = self.state.read().await;
                let view = OverlayView { state: &state };
                Reader::new(&view, self.cache_resolver.as_ref(), self.config.max_read_depth)
                    .read(&root_key, &shape, mode)
            };
            match result {
                Ok(read) => {
                    let mut watchers = self.lock_watchers();
                    let Some(watcher) = watchers.get_mut(&id) else {
                        continue;
                    };
                    if watcher.last_notified >= generation {
                        // Superseded by a newer write's delivery.
                        continue;
                    }
                    watcher.last_notified = generation;
                    watcher.dependencies = read.dependencies.clone();
                    if watcher.tx.send(read).is_err() {
                        // Receiver dropped; prune the registration.
                        watchers.remove(&id);
                    }
                }
                Err(err) => {
                    // A strict watcher can start missing data after an
                    // eviction or removal; it keeps its registration and
                    // old dependencies, so it re-fires when data returns.
                    debug!(watcher = id, %err, "watcher re-read missed");
                }
            }
        }
    }
}
