//! Real-time channel adapter.
//!
//! Wraps a single shared WebSocket connection (JSON frames) behind
//! reference-counted topic subscriptions. `subscribe` only registers a
//! topic locally and returns a fan-out handle; a separate [`run`] task owns
//! the socket, keeps the transport's subscription set equal to the
//! referenced set, and routes incoming frames to topic streams.
//!
//! Reconnection runs with exponential backoff. An outage longer than the
//! configured deadline emits [`ChannelEvent::ConnectionLost`] on every open
//! topic; every successful reconnect after an established session emits
//! [`ChannelEvent::Reconnected`] so consumers can re-fetch and reconcile
//! (the transport does not replay missed events).
//!
//! [`run`]: ChannelAdapter::run

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::error::SyncError;
use crate::types::{Event, Item};

/// Per-topic broadcast capacity. Sized for reconnection bursts; a lagged
/// consumer sees a warning and keeps going from the most recent events.
const TOPIC_CHANNEL_CAPACITY: usize = 1024;

/// How long a socket read may stall before the connection is recycled.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a connect attempt may hang before it counts as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outage duration after which `ConnectionLost` is emitted.
pub const DEFAULT_RECONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Event delivered on a topic stream.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A push event for the topic's scope.
    Push(Event),
    /// The transport has been down longer than the reconnect deadline.
    /// Last-known state is still served; no events arrive until recovery.
    ConnectionLost,
    /// The transport reconnected and resubscribed. Events during the
    /// outage were not replayed; consumers should re-fetch to reconcile.
    Reconnected,
}

struct TopicEntry {
    /// Active handle count for this topic.
    refs: usize,
    /// Fan-out sender shared by all handles on the topic.
    events_tx: broadcast::Sender<ChannelEvent>,
}

/// Handle to one subscription on a topic.
///
/// Multiple handles on the same topic share one underlying transport
/// subscription. Dropping the handle releases its reference; the last
/// release unsubscribes the topic from the transport.
pub struct TopicHandle {
    adapter: Arc<ChannelAdapter>,
    topic: String,
    events_rx: broadcast::Receiver<ChannelEvent>,
    closed: bool,
}

impl TopicHandle {
    /// The topic this handle is subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next event on this topic.
    ///
    /// Returns `None` only if the adapter itself has gone away. A lagged
    /// receiver skips to the oldest retained event with a warning rather
    /// than failing.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.events_rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "topic stream lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Release this handle's reference explicitly.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.adapter.release(&self.topic);
        }
    }
}

impl Drop for TopicHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shared pub/sub connection with reference-counted topic subscriptions.
pub struct ChannelAdapter {
    /// WebSocket endpoint.
    url: String,
    /// Outage duration after which `ConnectionLost` is emitted.
    reconnect_deadline: Duration,
    /// Referenced topics and their fan-out senders.
    topics: DashMap<String, TopicEntry>,
    /// Bumped whenever the referenced topic set changes, to nudge the run
    /// task into resyncing transport subscriptions.
    topics_rev: watch::Sender<u64>,
}

impl ChannelAdapter {
    /// Create a new adapter for the given WebSocket URL.
    ///
    /// No connection is made until [`run`](Self::run) is driven and at
    /// least one topic is subscribed.
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        let (topics_rev, _) = watch::channel(0);
        Arc::new(Self {
            url: url.into(),
            reconnect_deadline: DEFAULT_RECONNECT_DEADLINE,
            topics: DashMap::new(),
            topics_rev,
        })
    }

    /// Create an adapter with a custom reconnect deadline.
    pub fn with_reconnect_deadline(url: impl Into<String>, deadline: Duration) -> Arc<Self> {
        let (topics_rev, _) = watch::channel(0);
        Arc::new(Self {
            url: url.into(),
            reconnect_deadline: deadline,
            topics: DashMap::new(),
            topics_rev,
        })
    }

    /// Subscribe to a topic.
    ///
    /// An already-referenced topic gets another handle on the same stream;
    /// no duplicate transport subscription is created.
    pub fn subscribe(self: &Arc<Self>, topic: impl Into<String>) -> TopicHandle {
        use dashmap::mapref::entry::Entry;

        let topic = topic.into();

        let events_rx = match self.topics.entry(topic.clone()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.refs += 1;
                trace!(topic = %topic, refs = entry.refs, "topic handle added");
                entry.events_tx.subscribe()
            }
            Entry::Vacant(entry) => {
                let (events_tx, events_rx) = broadcast::channel(TOPIC_CHANNEL_CAPACITY);
                entry.insert(TopicEntry { refs: 1, events_tx });
                debug!(topic = %topic, "topic referenced");
                events_rx
            }
        };

        self.nudge();

        TopicHandle {
            adapter: Arc::clone(self),
            topic,
            events_rx,
            closed: false,
        }
    }

    /// Number of active handles on a topic. Zero if unreferenced.
    pub fn topic_ref_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|e| e.refs).unwrap_or(0)
    }

    /// Number of referenced topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn release(&self, topic: &str) {
        use dashmap::mapref::entry::Entry;

        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut entry) => {
                let refs = {
                    let entry = entry.get_mut();
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs
                };
                if refs == 0 {
                    entry.remove();
                    debug!(topic = %topic, "topic unreferenced");
                } else {
                    trace!(topic = %topic, refs, "topic handle released");
                }
            }
            Entry::Vacant(_) => {
                warn!(topic = %topic, "release for unreferenced topic ignored");
            }
        }

        self.nudge();
    }

    fn nudge(&self) {
        self.topics_rev.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Deliver an event to a topic's subscribers, if any.
    pub(crate) fn publish(&self, topic: &str, event: ChannelEvent) {
        if let Some(entry) = self.topics.get(topic) {
            if entry.events_tx.send(event).is_err() {
                trace!(topic = %topic, "no receivers for topic event");
            }
        } else {
            trace!(topic = %topic, "event for unreferenced topic dropped");
        }
    }

    fn broadcast_all(&self, event: ChannelEvent) {
        for entry in self.topics.iter() {
            if entry.value().events_tx.send(event.clone()).is_err() {
                trace!(topic = %entry.key(), "no receivers for topic event");
            }
        }
    }

    fn referenced_topics(&self) -> HashSet<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Drive the shared connection.
    ///
    /// Connects lazily once a topic is referenced, keeps transport
    /// subscriptions in sync with the referenced set, and reconnects with
    /// exponential backoff. When the last topic is released the socket is
    /// dropped and the task idles until a topic appears again.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut topics_rx = self.topics_rev.subscribe();
        let mut backoff_secs = 1u64;
        // Set after the first established session; later connects following
        // an outage announce `Reconnected` to every topic.
        let mut had_session = false;
        let mut outage: Option<Instant> = None;
        let mut lost_emitted = false;

        loop {
            if *shutdown_rx.borrow() {
                info!("channel adapter shutting down");
                return Ok(());
            }

            // Idle until there is something to subscribe to.
            if self.topics.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = topics_rx.changed() => {}
                }
                continue;
            }

            match self
                .connect_and_process(&mut shutdown_rx, &mut topics_rx, &mut had_session)
                .await
            {
                Ok(ConnectionOutcome::Shutdown) => return Ok(()),
                Ok(ConnectionOutcome::Idle) => {
                    // Last topic released; socket dropped. Nothing was lost.
                }
                Err(e) => {
                    warn!(error = %e, "channel connection error, reconnecting");

                    let started = *outage.get_or_insert_with(Instant::now);

                    // Cap the wait so the deadline fires on time even when
                    // the backoff is longer than what remains of it.
                    let mut wait = Duration::from_secs(backoff_secs);
                    if !lost_emitted {
                        let remaining =
                            self.reconnect_deadline.saturating_sub(started.elapsed());
                        wait = wait.min(remaining);
                    }

                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }

                    if !lost_emitted && started.elapsed() >= self.reconnect_deadline {
                        warn!("reconnect deadline exceeded, notifying consumers");
                        self.broadcast_all(ChannelEvent::ConnectionLost);
                        lost_emitted = true;
                    }

                    backoff_secs = (backoff_secs * 2).min(60);
                    continue;
                }
            }

            backoff_secs = 1;
            outage = None;
            lost_emitted = false;
        }
    }

    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        topics_rx: &mut watch::Receiver<u64>,
        had_session: &mut bool,
    ) -> Result<ConnectionOutcome, SyncError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| SyncError::Channel("connect timed out".to_string()))?
            .map_err(|e| SyncError::Channel(format!("connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        info!(url = %self.url, topics = self.topics.len(), "channel connected");

        // Bring the transport's subscription set up to the referenced set.
        let mut subscribed = HashSet::new();
        for topic in self.referenced_topics() {
            send_control(&mut write, ControlFrame::Subscribe { topic: &topic }).await?;
            subscribed.insert(topic);
        }

        if *had_session {
            // Events during the outage were not replayed; tell every topic
            // so consumers re-fetch and reconcile.
            debug!("resubscribed after reconnect, notifying consumers");
            self.broadcast_all(ChannelEvent::Reconnected);
        }
        *had_session = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("channel received shutdown signal");
                        return Ok(ConnectionOutcome::Shutdown);
                    }
                }

                _ = topics_rx.changed() => {
                    let desired = self.referenced_topics();

                    for topic in desired.difference(&subscribed) {
                        send_control(&mut write, ControlFrame::Subscribe { topic }).await?;
                    }
                    for topic in subscribed.difference(&desired) {
                        send_control(&mut write, ControlFrame::Unsubscribe { topic }).await?;
                    }
                    subscribed = desired;

                    if subscribed.is_empty() {
                        info!("last topic released, dropping channel connection");
                        return Ok(ConnectionOutcome::Idle);
                    }
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Err(e) = self.handle_frame(&text) {
                                warn!(error = %e, "failed to handle channel frame");
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("channel connection closed by server");
                            return Err(SyncError::Channel("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(SyncError::Channel(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(SyncError::Channel("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("channel read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(SyncError::Channel("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Parse a server frame and route it to the topic's subscribers.
    fn handle_frame(&self, text: &str) -> Result<(), SyncError> {
        let frame: WireFrame = serde_json::from_str(text)?;

        let Some(event) = frame.into_event()? else {
            return Ok(());
        };

        let (topic, event) = event;
        self.publish(&topic, ChannelEvent::Push(event));
        Ok(())
    }
}

enum ConnectionOutcome {
    Shutdown,
    Idle,
}

async fn send_control<S>(write: &mut S, frame: ControlFrame<'_>) -> Result<(), SyncError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(&frame)?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| SyncError::Channel(format!("send failed: {}", e)))
}

// =============================================================================
// Wire frame types
// =============================================================================

/// Client -> server control frame.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ControlFrame<'a> {
    Subscribe { topic: &'a str },
    Unsubscribe { topic: &'a str },
}

/// Server -> client push frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    /// Topic the frame belongs to (e.g., "scope.convo-123").
    topic: String,
    /// Frame kind: "inserted", "updated", "removed", "scope".
    kind: String,
    /// Full item payload (inserted frames).
    #[serde(default)]
    item: Option<Item>,
    /// Target item id (updated/removed frames).
    #[serde(default)]
    id: Option<String>,
    /// Partial fields (updated/scope frames).
    #[serde(default)]
    fields: Option<Map<String, Value>>,
}

impl WireFrame {
    /// Convert into a typed event, or `None` for unknown frame kinds.
    fn into_event(self) -> Result<Option<(String, Event)>, SyncError> {
        let event = match self.kind.as_str() {
            "inserted" => {
                let item = self.item.ok_or_else(|| {
                    SyncError::InvalidResponse("inserted frame without item".to_string())
                })?;
                Event::Inserted(item)
            }
            "updated" => {
                let id = self.id.ok_or_else(|| {
                    SyncError::InvalidResponse("updated frame without id".to_string())
                })?;
                Event::Updated {
                    id,
                    fields: self.fields.unwrap_or_default(),
                }
            }
            "removed" => {
                let id = self.id.ok_or_else(|| {
                    SyncError::InvalidResponse("removed frame without id".to_string())
                })?;
                Event::Removed { id }
            }
            "scope" => Event::ScopeChanged {
                fields: self.fields.unwrap_or_default(),
            },
            other => {
                trace!(kind = %other, "ignoring unknown channel frame");
                return Ok(None);
            }
        };

        Ok(Some((self.topic, event)))
    }
}
