//! Subscription lifecycle manager.
//!
//! Binds UI-visible scopes to cache and channel resources: however many
//! consumers hold a scope open, there is exactly one channel subscription
//! and one event pump for it. The registry reference-counts opens; the
//! last close aborts the pump, releases the topic, and evicts the scope
//! (cached items are not retained across a full unmount).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::SyncCache;
use crate::channel::{ChannelAdapter, ChannelEvent, TopicHandle};
use crate::error::SyncError;
use crate::types::{ScopeSnapshot, ScopeUpdate, scope_topic};

struct RegistryEntry {
    /// Active consumer count for this scope.
    refs: usize,
    /// Event pump task; owns the topic handle.
    pump: JoinHandle<()>,
}

/// Handle held by one consumer of a scope.
///
/// Obtained from [`ScopeRegistry::open`]; dropping it (or calling
/// [`close`](Self::close)) releases the consumer's reference.
pub struct ScopeHandle {
    registry: Arc<ScopeRegistry>,
    scope_id: String,
    updates_rx: broadcast::Receiver<ScopeUpdate>,
    closed: bool,
}

impl ScopeHandle {
    /// The scope this handle refers to.
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Receive the next scope update.
    ///
    /// A lagged receiver skips ahead with a warning; `None` means the
    /// scope's update channel is gone.
    pub async fn recv(&mut self) -> Option<ScopeUpdate> {
        loop {
            match self.updates_rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(scope = %self.scope_id, skipped, "scope updates lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Point-in-time view of the scope.
    pub async fn snapshot(&self) -> Option<ScopeSnapshot> {
        self.registry.cache.snapshot(&self.scope_id).await
    }

    /// Fetch and merge the next page.
    pub async fn load_more(&self) -> Result<(), SyncError> {
        self.registry.cache.load_more(&self.scope_id).await
    }

    /// Release this consumer's reference, awaiting teardown if this was
    /// the last one.
    pub async fn close(mut self) {
        self.closed = true;
        self.registry.close(&self.scope_id).await;
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.registry.release(&self.scope_id);
        }
    }
}

/// Reference-counted registry of open scopes.
pub struct ScopeRegistry {
    cache: Arc<SyncCache>,
    channel: Arc<ChannelAdapter>,
    entries: DashMap<String, RegistryEntry>,
}

impl ScopeRegistry {
    /// Create a registry over the given cache and channel adapter.
    pub fn new(cache: Arc<SyncCache>, channel: Arc<ChannelAdapter>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            channel,
            entries: DashMap::new(),
        })
    }

    /// The underlying cache, for direct operations (optimistic mutations).
    pub fn cache(&self) -> &Arc<SyncCache> {
        &self.cache
    }

    /// Number of consumers holding the scope open.
    pub fn ref_count(&self, scope_id: &str) -> usize {
        self.entries.get(scope_id).map(|e| e.refs).unwrap_or(0)
    }

    /// Open a scope for one consumer.
    ///
    /// The first open creates the scope, subscribes its topic, and starts
    /// the event pump (which begins with the initial page fetch). Further
    /// opens share those resources.
    pub fn open(self: &Arc<Self>, scope_id: &str) -> Result<ScopeHandle, SyncError> {
        use dashmap::mapref::entry::Entry;

        let not_open = || SyncError::ScopeNotOpen {
            scope_id: scope_id.to_string(),
        };

        // Subscribe before the pump starts so no early update is missed.
        let updates_rx = match self.entries.entry(scope_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let rx = match self.cache.subscribe(scope_id) {
                    Some(rx) => rx,
                    None => {
                        // The scope was evicted as gone upstream while
                        // handles were still open. Restart it under the
                        // live entry rather than failing every reopen
                        // until the stale handles close.
                        self.cache.ensure_scope(scope_id);
                        let rx = self.cache.subscribe(scope_id).ok_or_else(not_open)?;
                        let topic = self.channel.subscribe(scope_topic(scope_id));
                        let pump = tokio::spawn(pump_events(
                            Arc::clone(&self.cache),
                            scope_id.to_string(),
                            topic,
                        ));
                        // The old pump already exited when the scope went
                        // away; replacing its handle leaks nothing.
                        entry.get_mut().pump.abort();
                        entry.get_mut().pump = pump;
                        debug!(scope = %scope_id, "scope restarted after upstream removal");
                        rx
                    }
                };
                entry.get_mut().refs += 1;
                debug!(scope = %scope_id, refs = entry.get().refs, "scope opened (shared)");
                rx
            }
            Entry::Vacant(entry) => {
                self.cache.ensure_scope(scope_id);
                let rx = self.cache.subscribe(scope_id).ok_or_else(not_open)?;
                let topic = self.channel.subscribe(scope_topic(scope_id));
                let pump = tokio::spawn(pump_events(
                    Arc::clone(&self.cache),
                    scope_id.to_string(),
                    topic,
                ));
                entry.insert(RegistryEntry { refs: 1, pump });
                debug!(scope = %scope_id, "scope opened");
                rx
            }
        };

        Ok(ScopeHandle {
            registry: Arc::clone(self),
            scope_id: scope_id.to_string(),
            updates_rx,
            closed: false,
        })
    }

    /// Release one reference, awaiting pump teardown at zero.
    ///
    /// Closes beyond the number of opens are logged no-ops.
    pub async fn close(&self, scope_id: &str) {
        if let Some(pump) = self.release(scope_id) {
            // Aborted task; the JoinError is expected.
            let _ = pump.await;
        }
    }

    /// Synchronous release path (used by handle drop). Returns the aborted
    /// pump handle when this was the last reference.
    fn release(&self, scope_id: &str) -> Option<JoinHandle<()>> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(scope_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refs -= 1;
                if entry.get().refs > 0 {
                    debug!(scope = %scope_id, refs = entry.get().refs, "scope released");
                    return None;
                }
                let (_, removed) = entry.remove_entry();
                removed.pump.abort();
                self.cache.evict(scope_id);
                debug!(scope = %scope_id, "scope closed and evicted");
                Some(removed.pump)
            }
            Entry::Vacant(_) => {
                warn!(scope = %scope_id, "close without matching open ignored");
                None
            }
        }
    }
}

/// Per-scope event pump: hydrates the scope, then forwards channel events
/// into the cache in arrival order.
async fn pump_events(cache: Arc<SyncCache>, scope_id: String, mut topic: TopicHandle) {
    match cache.load_initial(&scope_id).await {
        Ok(()) => {}
        Err(SyncError::ScopeGone { .. }) => {
            // Scope deleted upstream; the cache already evicted it and
            // broadcast `Evicted`. Nothing left to pump.
            return;
        }
        Err(e) => {
            // Scope is `Failed`; consumers may retry via refresh. Keep
            // pumping events so a reconnect can recover it.
            warn!(scope = %scope_id, error = %e, "initial load failed");
        }
    }

    while let Some(event) = topic.recv().await {
        match event {
            ChannelEvent::Push(event) => {
                if let Err(e) = cache.apply_event(&scope_id, event).await {
                    warn!(scope = %scope_id, error = %e, "failed to apply event");
                    if matches!(e, SyncError::ScopeNotOpen { .. }) {
                        return;
                    }
                }
            }
            ChannelEvent::ConnectionLost => {
                cache.notify_connection_lost(&scope_id);
            }
            ChannelEvent::Reconnected => {
                // Events during the outage were not replayed; reconcile by
                // re-fetching the first page.
                if let Err(e) = cache.refresh(&scope_id).await {
                    warn!(scope = %scope_id, error = %e, "reconcile after reconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio::sync::Mutex;

    use crate::fetch::PageFetcher;
    use crate::types::{Event, Item, Page};

    struct StubFetcher {
        pages: Mutex<VecDeque<Result<Page, SyncError>>>,
    }

    impl StubFetcher {
        fn new(pages: Vec<Result<Page, SyncError>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch_page(
            &self,
            _scope_id: &str,
            _cursor: Option<&str>,
        ) -> Result<Page, SyncError> {
            self.pages.lock().await.pop_front().unwrap_or(Ok(Page {
                items: vec![],
                next_cursor: None,
            }))
        }
    }

    fn item(id: &str, ts: i64) -> Item {
        Item::new(id, Utc.timestamp_opt(ts, 0).unwrap())
    }

    fn registry_with(pages: Vec<Result<Page, SyncError>>) -> Arc<ScopeRegistry> {
        let cache = SyncCache::new(StubFetcher::new(pages));
        let channel = ChannelAdapter::new("wss://example.com/ws");
        ScopeRegistry::new(cache, channel)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("condition never became true");
    }

    async fn wait_for_items(registry: &ScopeRegistry, scope_id: &str, expected: &[&str]) {
        for _ in 0..500 {
            if let Some(snap) = registry.cache().snapshot(scope_id).await {
                let ids: Vec<_> = snap.items.iter().map(|i| i.id.as_str()).collect();
                if ids == expected {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("scope {} never reached {:?}", scope_id, expected);
    }

    #[tokio::test]
    async fn open_hydrates_and_subscribes_topic() {
        let registry = registry_with(vec![Ok(Page {
            items: vec![item("m1", 100)],
            next_cursor: None,
        })]);

        let handle = registry.open("convo-1").unwrap();

        wait_for_items(&registry, "convo-1", &["m1"]).await;
        assert_eq!(registry.channel.topic_ref_count("scope.convo-1"), 1);
        assert_eq!(registry.ref_count("convo-1"), 1);

        handle.close().await;
        assert!(!registry.cache().contains("convo-1"));
    }

    #[tokio::test]
    async fn shared_scope_uses_one_subscription() {
        let registry = registry_with(vec![]);

        let h1 = registry.open("feed").unwrap();
        let h2 = registry.open("feed").unwrap();

        // Two consumers, one channel subscription
        assert_eq!(registry.ref_count("feed"), 2);
        assert_eq!(registry.channel.topic_ref_count("scope.feed"), 1);

        h1.close().await;
        assert_eq!(registry.ref_count("feed"), 1);
        assert_eq!(registry.channel.topic_ref_count("scope.feed"), 1);
        assert!(registry.cache().contains("feed"));

        h2.close().await;
        assert_eq!(registry.ref_count("feed"), 0);
        assert_eq!(registry.channel.topic_ref_count("scope.feed"), 0);
        assert!(!registry.cache().contains("feed"));
    }

    #[tokio::test]
    async fn extra_close_is_noop() {
        let registry = registry_with(vec![]);

        let handle = registry.open("feed").unwrap();
        handle.close().await;

        // More closes than opens: no panic, no underflow
        registry.close("feed").await;
        registry.close("feed").await;
        assert_eq!(registry.ref_count("feed"), 0);
    }

    #[tokio::test]
    async fn dropping_handle_releases_reference() {
        let registry = registry_with(vec![]);

        {
            let _handle = registry.open("feed").unwrap();
            assert_eq!(registry.ref_count("feed"), 1);
        }

        wait_until(|| registry.channel.topic_ref_count("scope.feed") == 0).await;
        assert_eq!(registry.ref_count("feed"), 0);
    }

    #[tokio::test]
    async fn events_flow_through_pump() {
        let registry = registry_with(vec![Ok(Page {
            items: vec![item("m1", 100)],
            next_cursor: None,
        })]);

        let _handle = registry.open("convo-1").unwrap();
        wait_for_items(&registry, "convo-1", &["m1"]).await;

        registry.channel.publish(
            "scope.convo-1",
            ChannelEvent::Push(Event::Inserted(item("m2", 200))),
        );

        wait_for_items(&registry, "convo-1", &["m2", "m1"]).await;
    }

    #[tokio::test]
    async fn reconnect_triggers_first_page_reconcile() {
        let registry = registry_with(vec![
            Ok(Page {
                items: vec![item("m1", 100)],
                next_cursor: None,
            }),
            // Page served by the refresh after the reconnect gap
            Ok(Page {
                items: vec![item("m2", 200), item("m1", 100)],
                next_cursor: None,
            }),
        ]);

        let _handle = registry.open("convo-1").unwrap();
        wait_for_items(&registry, "convo-1", &["m1"]).await;

        registry
            .channel
            .publish("scope.convo-1", ChannelEvent::Reconnected);

        wait_for_items(&registry, "convo-1", &["m2", "m1"]).await;
    }

    #[tokio::test]
    async fn connection_lost_reaches_consumers() {
        let registry = registry_with(vec![]);

        let mut handle = registry.open("feed").unwrap();
        wait_until(|| registry.channel.topic_ref_count("scope.feed") == 1).await;

        registry
            .channel
            .publish("scope.feed", ChannelEvent::ConnectionLost);

        loop {
            match handle.recv().await {
                Some(ScopeUpdate::ConnectionLost) => break,
                Some(_) => continue,
                None => panic!("updates channel closed before ConnectionLost"),
            }
        }
    }

    #[tokio::test]
    async fn scope_gone_on_open_evicts() {
        let registry = registry_with(vec![Err(SyncError::ScopeGone {
            scope_id: "convo-1".to_string(),
        })]);

        let mut handle = registry.open("convo-1").unwrap();

        loop {
            match handle.recv().await {
                Some(ScopeUpdate::Evicted) => break,
                Some(_) => continue,
                None => panic!("updates channel closed before Evicted"),
            }
        }
        assert!(!registry.cache().contains("convo-1"));
    }

    #[tokio::test]
    async fn reopen_after_scope_gone_restarts_scope() {
        let registry = registry_with(vec![
            Err(SyncError::ScopeGone {
                scope_id: "convo-1".to_string(),
            }),
            // Page served once the scope exists upstream again
            Ok(Page {
                items: vec![item("m1", 100)],
                next_cursor: None,
            }),
        ]);

        let mut stale = registry.open("convo-1").unwrap();
        loop {
            match stale.recv().await {
                Some(ScopeUpdate::Evicted) => break,
                Some(_) => continue,
                None => panic!("updates channel closed before Evicted"),
            }
        }
        assert!(!registry.cache().contains("convo-1"));

        // The stale handle still holds a reference; a fresh open must not
        // fail on it.
        let reopened = registry.open("convo-1").unwrap();
        wait_for_items(&registry, "convo-1", &["m1"]).await;
        assert_eq!(registry.ref_count("convo-1"), 2);

        reopened.close().await;
        stale.close().await;
        assert!(!registry.cache().contains("convo-1"));
    }

    #[tokio::test]
    async fn load_more_through_handle() {
        let registry = registry_with(vec![
            Ok(Page {
                items: vec![item("m2", 200)],
                next_cursor: Some("c2".to_string()),
            }),
            Ok(Page {
                items: vec![item("m1", 100)],
                next_cursor: None,
            }),
        ]);

        let handle = registry.open("convo-1").unwrap();
        wait_for_items(&registry, "convo-1", &["m2"]).await;

        handle.load_more().await.unwrap();
        wait_for_items(&registry, "convo-1", &["m2", "m1"]).await;

        let snap = handle.snapshot().await.unwrap();
        assert!(snap.next_cursor.is_none());
    }
}
