//! Incremental synchronized cache.
//!
//! Merges pull-based pages and push-based events into one ordered,
//! deduplicated collection per scope. Two writers feed a scope: paginated
//! fetches ([`load_initial`]/[`load_more`]/[`refresh`]) and live events
//! ([`apply_event`]). Events arriving while a page fetch is in flight are
//! buffered and replayed in arrival order after the merge, and every page
//! merge is guarded by a version stamp so stale page data never overwrites
//! fields a later event or optimistic mutation already changed.
//!
//! All mutations to one scope are serialized through that scope's lock;
//! distinct scopes never contend.
//!
//! [`load_initial`]: SyncCache::load_initial
//! [`load_more`]: SyncCache::load_more
//! [`refresh`]: SyncCache::refresh
//! [`apply_event`]: SyncCache::apply_event

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::fetch::PageFetcher;
use crate::types::{Event, Item, ScopePhase, ScopeSnapshot, ScopeUpdate};

/// Maximum number of events buffered per scope while a page fetch is in
/// flight. When exceeded, oldest events are dropped to bound memory.
const MAX_BUFFERED_EVENTS: usize = 1_024;

/// Broadcast channel capacity for scope updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Mutable state of one scope. Guarded by the scope's lock.
struct ScopeState {
    /// Current phase of the scope's fetch state machine.
    phase: ScopePhase,
    /// Items sorted newest-first by `(created_at, id)`.
    items: Vec<Item>,
    /// Scope version at each item's last write.
    stamps: HashMap<String, u64>,
    /// Incremented on every item or metadata change.
    version: u64,
    /// Cursor for the next page; `None` before hydration and at exhaustion.
    next_cursor: Option<String>,
    /// Scope-level metadata (unread count, mute flag).
    metadata: Map<String, Value>,
    /// Events deferred while a page fetch is in flight.
    buffered: VecDeque<Event>,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            phase: ScopePhase::Idle,
            items: Vec::new(),
            stamps: HashMap::new(),
            version: 0,
            next_cursor: None,
            metadata: Map::new(),
            buffered: VecDeque::new(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Insert preserving the newest-first sort order.
    fn insert_sorted(&mut self, item: Item) {
        let pos = self
            .items
            .partition_point(|existing| existing.sort_key_cmp(&item) == CmpOrdering::Less);
        self.items.insert(pos, item);
    }

    fn buffer_event(&mut self, scope_id: &str, event: Event) {
        self.buffered.push_back(event);
        if self.buffered.len() > MAX_BUFFERED_EVENTS {
            self.buffered.pop_front();
            warn!(scope = %scope_id, "event buffer full, oldest event dropped");
        }
    }

    /// Apply one event immediately. Returns the update to broadcast, or
    /// `None` when the event was a no-op.
    fn apply_event_now(&mut self, scope_id: &str, event: Event) -> Option<ScopeUpdate> {
        match event {
            Event::Inserted(item) => {
                if let Some(pos) = self.position(&item.id) {
                    // Duplicate insert degrades to an update; identity and
                    // position are preserved.
                    self.version += 1;
                    let id = item.id.clone();
                    for (key, value) in item.fields {
                        self.items[pos].fields.insert(key, value);
                    }
                    self.stamps.insert(id.clone(), self.version);
                    trace!(scope = %scope_id, id = %id, "insert for existing id applied as update");
                    Some(ScopeUpdate::ItemUpdated { id })
                } else {
                    self.version += 1;
                    let id = item.id.clone();
                    self.stamps.insert(id.clone(), self.version);
                    self.insert_sorted(item);
                    trace!(scope = %scope_id, id = %id, "item inserted");
                    Some(ScopeUpdate::ItemInserted { id })
                }
            }
            Event::Updated { id, fields } => {
                if let Some(pos) = self.position(&id) {
                    self.version += 1;
                    for (key, value) in fields {
                        self.items[pos].fields.insert(key, value);
                    }
                    self.stamps.insert(id.clone(), self.version);
                    trace!(scope = %scope_id, id = %id, "item updated");
                    Some(ScopeUpdate::ItemUpdated { id })
                } else {
                    // The item was never paginated in. Skip it rather than
                    // materialize a partial item; a later load brings it in.
                    trace!(scope = %scope_id, id = %id, "update for unknown id ignored");
                    None
                }
            }
            Event::Removed { id } => {
                if let Some(pos) = self.position(&id) {
                    self.version += 1;
                    self.items.remove(pos);
                    self.stamps.remove(&id);
                    trace!(scope = %scope_id, id = %id, "item removed");
                    Some(ScopeUpdate::ItemRemoved { id })
                } else {
                    trace!(scope = %scope_id, id = %id, "remove for unknown id ignored");
                    None
                }
            }
            Event::ScopeChanged { fields } => {
                self.version += 1;
                for (key, value) in fields {
                    self.metadata.insert(key, value);
                }
                trace!(scope = %scope_id, "scope metadata changed");
                Some(ScopeUpdate::MetadataChanged)
            }
        }
    }

    /// Merge a fetched page into the item set.
    ///
    /// `issue_version` is the scope version captured when the fetch was
    /// issued. Items whose stamp is newer were changed while the fetch was
    /// in flight; their page copy is stale and is skipped.
    fn merge_page(&mut self, scope_id: &str, items: Vec<Item>, issue_version: u64) -> usize {
        self.version += 1;
        let merge_version = self.version;
        let mut added = 0;

        for item in items {
            match self.position(&item.id) {
                Some(pos) => {
                    let stamp = self.stamps.get(&item.id).copied().unwrap_or(0);
                    if stamp > issue_version {
                        trace!(scope = %scope_id, id = %item.id, "skipping stale page data");
                        continue;
                    }
                    self.stamps.insert(item.id.clone(), merge_version);
                    self.items[pos].fields = item.fields;
                }
                None => {
                    self.stamps.insert(item.id.clone(), merge_version);
                    self.insert_sorted(item);
                    added += 1;
                }
            }
        }

        added
    }

    fn snapshot(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            items: self.items.clone(),
            phase: self.phase,
            next_cursor: self.next_cursor.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// One scope's entry in the cache.
struct ScopeEntry {
    state: Mutex<ScopeState>,
    updates_tx: broadcast::Sender<ScopeUpdate>,
    /// Set on eviction so in-flight fetch results are discarded instead of
    /// applied to a torn-down scope.
    evicted: AtomicBool,
}

impl ScopeEntry {
    fn new() -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(ScopeState::new()),
            updates_tx,
            evicted: AtomicBool::new(false),
        })
    }

    fn broadcast(&self, update: ScopeUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for scope update");
        }
    }
}

/// The incremental synchronized cache.
///
/// Process-wide; scopes are created by [`ensure_scope`](Self::ensure_scope)
/// (or the first load) and removed by [`evict`](Self::evict). Thread-safe;
/// designed for concurrent access from the lifecycle pump tasks and UI
/// callers.
pub struct SyncCache {
    fetcher: Arc<dyn PageFetcher>,
    scopes: DashMap<String, Arc<ScopeEntry>>,
}

impl SyncCache {
    /// Create a new empty cache over the given fetch source.
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            scopes: DashMap::new(),
        })
    }

    /// Create the scope if absent. Returns true if it was created.
    pub fn ensure_scope(&self, scope_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.scopes.entry(scope_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(ScopeEntry::new());
                debug!(scope = %scope_id, "scope created");
                true
            }
        }
    }

    /// Whether the scope currently exists in the cache.
    pub fn contains(&self, scope_id: &str) -> bool {
        self.scopes.contains_key(scope_id)
    }

    /// Number of live scopes.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Point-in-time view of a scope.
    pub async fn snapshot(&self, scope_id: &str) -> Option<ScopeSnapshot> {
        let entry = self.entry(scope_id)?;
        Some(entry.state.lock().await.snapshot())
    }

    /// Subscribe to a scope's updates.
    pub fn subscribe(&self, scope_id: &str) -> Option<broadcast::Receiver<ScopeUpdate>> {
        self.entry(scope_id).map(|e| e.updates_tx.subscribe())
    }

    fn entry(&self, scope_id: &str) -> Option<Arc<ScopeEntry>> {
        self.scopes.get(scope_id).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_err(&self, scope_id: &str) -> Result<Arc<ScopeEntry>, SyncError> {
        self.entry(scope_id).ok_or_else(|| SyncError::ScopeNotOpen {
            scope_id: scope_id.to_string(),
        })
    }

    /// Fetch and merge the first page.
    ///
    /// Creates the scope if absent. A no-op when the scope is already
    /// hydrated or a fetch is in flight; a previous failure is retried.
    pub async fn load_initial(&self, scope_id: &str) -> Result<(), SyncError> {
        self.ensure_scope(scope_id);
        let entry = self.entry_or_err(scope_id)?;

        let issue_version = {
            let mut state = entry.state.lock().await;
            match state.phase {
                ScopePhase::Idle | ScopePhase::Failed => {}
                _ => return Ok(()),
            }
            state.phase = ScopePhase::Loading;
            entry.broadcast(ScopeUpdate::Phase(ScopePhase::Loading));
            state.version
        };

        let result = self.fetcher.fetch_page(scope_id, None).await;
        self.finish_fetch(scope_id, &entry, result, issue_version, true)
            .await
    }

    /// Fetch and merge the next page.
    ///
    /// A no-op when the cursor chain is exhausted or a fetch is already in
    /// flight. A failure leaves the scope `Ready` with the cursor intact,
    /// retryable by calling again.
    pub async fn load_more(&self, scope_id: &str) -> Result<(), SyncError> {
        let entry = self.entry_or_err(scope_id)?;

        let (cursor, issue_version) = {
            let mut state = entry.state.lock().await;
            if state.phase.is_fetching() {
                return Ok(());
            }
            let Some(cursor) = state.next_cursor.clone() else {
                return Ok(());
            };
            state.phase = ScopePhase::LoadingMore;
            entry.broadcast(ScopeUpdate::Phase(ScopePhase::LoadingMore));
            (cursor, state.version)
        };

        let result = self.fetcher.fetch_page(scope_id, Some(&cursor)).await;
        self.finish_fetch(scope_id, &entry, result, issue_version, true)
            .await
    }

    /// Re-fetch the first page and reconcile.
    ///
    /// Used after a reconnect gap, when events may have been missed: the
    /// first page is merged under the usual version guard, without dropping
    /// items outside it. The pagination position is kept unless the scope
    /// was never hydrated.
    pub async fn refresh(&self, scope_id: &str) -> Result<(), SyncError> {
        let entry = self.entry_or_err(scope_id)?;

        let (issue_version, hydrating) = {
            let mut state = entry.state.lock().await;
            if state.phase.is_fetching() {
                return Ok(());
            }
            let hydrating = matches!(state.phase, ScopePhase::Idle | ScopePhase::Failed);
            state.phase = if hydrating {
                ScopePhase::Loading
            } else {
                ScopePhase::LoadingMore
            };
            entry.broadcast(ScopeUpdate::Phase(state.phase));
            (state.version, hydrating)
        };

        let result = self.fetcher.fetch_page(scope_id, None).await;
        self.finish_fetch(scope_id, &entry, result, issue_version, hydrating)
            .await
    }

    /// Complete a page fetch: merge on success, restore phase on failure,
    /// replay buffered events either way.
    ///
    /// `take_cursor` controls whether the page's cursor replaces the
    /// scope's: true for hydration and `load_more` (the chain advances),
    /// false for a refresh of a hydrated scope, where the first-page
    /// cursor would rewind the chain.
    async fn finish_fetch(
        &self,
        scope_id: &str,
        entry: &Arc<ScopeEntry>,
        result: Result<crate::types::Page, SyncError>,
        issue_version: u64,
        take_cursor: bool,
    ) -> Result<(), SyncError> {
        if entry.evicted.load(Ordering::SeqCst) {
            debug!(scope = %scope_id, "discarding fetch result for evicted scope");
            return Ok(());
        }

        let mut state = entry.state.lock().await;
        let was_hydrating = state.phase == ScopePhase::Loading;

        match result {
            Ok(page) => {
                let exhausted = if take_cursor {
                    state.next_cursor = page.next_cursor;
                    state.next_cursor.is_none()
                } else {
                    state.next_cursor.is_none()
                };

                let added = state.merge_page(scope_id, page.items, issue_version);
                entry.broadcast(ScopeUpdate::PageMerged { added });

                Self::replay_buffered(scope_id, entry, &mut state);

                state.phase = if exhausted {
                    ScopePhase::Exhausted
                } else {
                    ScopePhase::Ready
                };
                entry.broadcast(ScopeUpdate::Phase(state.phase));

                debug!(
                    scope = %scope_id,
                    added,
                    total = state.items.len(),
                    phase = ?state.phase,
                    "page merged"
                );
                Ok(())
            }
            Err(SyncError::ScopeGone { .. }) => {
                drop(state);
                warn!(scope = %scope_id, "scope gone upstream, evicting");
                self.evict(scope_id);
                Err(SyncError::ScopeGone {
                    scope_id: scope_id.to_string(),
                })
            }
            Err(e) => {
                // Events that arrived mid-flight still apply; the fetch
                // failure does not touch existing contents.
                Self::replay_buffered(scope_id, entry, &mut state);

                state.phase = if was_hydrating {
                    ScopePhase::Failed
                } else {
                    ScopePhase::Ready
                };
                entry.broadcast(ScopeUpdate::Phase(state.phase));

                warn!(scope = %scope_id, error = %e, "page fetch failed");
                Err(e)
            }
        }
    }

    fn replay_buffered(scope_id: &str, entry: &Arc<ScopeEntry>, state: &mut ScopeState) {
        if state.buffered.is_empty() {
            return;
        }
        debug!(
            scope = %scope_id,
            pending = state.buffered.len(),
            "replaying buffered events"
        );
        while let Some(event) = state.buffered.pop_front() {
            if let Some(update) = state.apply_event_now(scope_id, event) {
                entry.broadcast(update);
            }
        }
    }

    /// Merge a single push event into the scope.
    ///
    /// Buffered while a page fetch is in flight, applied immediately
    /// otherwise. Per-scope arrival order is preserved in both paths.
    pub async fn apply_event(&self, scope_id: &str, event: Event) -> Result<(), SyncError> {
        let entry = self.entry_or_err(scope_id)?;
        let mut state = entry.state.lock().await;

        if state.phase.is_fetching() {
            state.buffer_event(scope_id, event);
            return Ok(());
        }

        if let Some(update) = state.apply_event_now(scope_id, event) {
            entry.broadcast(update);
        }
        Ok(())
    }

    /// Apply a local change immediately, then confirm it with the server.
    ///
    /// On server failure the pre-mutation fields are restored and the error
    /// is returned. On success a server-provided field set, when present,
    /// wins over the optimistic value.
    pub async fn mutate_optimistic<F, Fut>(
        &self,
        scope_id: &str,
        id: &str,
        updater: F,
        server_call: Fut,
    ) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Map<String, Value>),
        Fut: Future<Output = Result<Option<Map<String, Value>>, SyncError>>,
    {
        let entry = self.entry_or_err(scope_id)?;

        let prior_fields = {
            let mut state = entry.state.lock().await;
            let pos = state.position(id).ok_or_else(|| SyncError::ItemNotFound {
                scope_id: scope_id.to_string(),
                id: id.to_string(),
            })?;

            let prior = state.items[pos].fields.clone();
            updater(&mut state.items[pos].fields);
            state.version += 1;
            let version = state.version;
            state.stamps.insert(id.to_string(), version);
            entry.broadcast(ScopeUpdate::ItemUpdated { id: id.to_string() });
            prior
        };

        match server_call.await {
            Ok(server_fields) => {
                if let Some(fields) = server_fields {
                    let mut state = entry.state.lock().await;
                    if let Some(pos) = state.position(id) {
                        if state.items[pos].fields != fields {
                            debug!(scope = %scope_id, id = %id, "server value differs, overwriting optimistic value");
                            state.items[pos].fields = fields;
                            state.version += 1;
                            let version = state.version;
                            state.stamps.insert(id.to_string(), version);
                            entry.broadcast(ScopeUpdate::ItemUpdated { id: id.to_string() });
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut state = entry.state.lock().await;
                if let Some(pos) = state.position(id) {
                    state.items[pos].fields = prior_fields;
                    state.version += 1;
                    let version = state.version;
                    state.stamps.insert(id.to_string(), version);
                    entry.broadcast(ScopeUpdate::ItemUpdated { id: id.to_string() });
                }
                warn!(scope = %scope_id, id = %id, error = %e, "optimistic mutation rolled back");
                Err(SyncError::MutationFailed(e.to_string()))
            }
        }
    }

    /// Notify a scope's subscribers that the channel is disconnected past
    /// its deadline. Cache contents are untouched.
    pub(crate) fn notify_connection_lost(&self, scope_id: &str) {
        if let Some(entry) = self.entry(scope_id) {
            entry.broadcast(ScopeUpdate::ConnectionLost);
        }
    }

    /// Drop a scope and all its state.
    ///
    /// In-flight fetch results for the scope are discarded when they land.
    pub fn evict(&self, scope_id: &str) {
        if let Some((_, entry)) = self.scopes.remove(scope_id) {
            entry.evicted.store(true, Ordering::SeqCst);
            entry.broadcast(ScopeUpdate::Evicted);
            debug!(scope = %scope_id, "scope evicted");
        }
    }
}
