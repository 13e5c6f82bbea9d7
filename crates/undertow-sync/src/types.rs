//! Core types for the sync cache.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A uniquely identified record belonging to exactly one scope.
///
/// Items are ordered newest-first by `(created_at, id)`. The `id` tiebreak
/// keeps ordering deterministic when two items share a timestamp. Mutable
/// fields (like counts, read flags) live in `fields` and may change without
/// affecting identity or position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Unique id within the scope.
    pub id: String,
    /// Creation timestamp; the ordering key.
    pub created_at: DateTime<Utc>,
    /// Mutable fields, shallow-merged on update events.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Item {
    /// Create an item with empty fields.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            fields: Map::new(),
        }
    }

    /// Compare for the newest-first scope ordering.
    pub fn sort_key_cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// One page of items from the fetch source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Items in the scope's canonical sort order for this page.
    pub items: Vec<Item>,
    /// Cursor for the next page; `None` signals exhaustion.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// A push event delivered on a scope's topic.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new item appeared. An existing id degrades to an update.
    Inserted(Item),
    /// Partial fields changed on an existing item.
    Updated { id: String, fields: Map<String, Value> },
    /// An item was removed.
    Removed { id: String },
    /// Scope-level metadata changed (unread count, mute flag).
    ScopeChanged { fields: Map<String, Value> },
}

/// Synchronization phase of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    /// Created but no fetch started yet.
    Idle,
    /// Initial page fetch in flight; events are buffered.
    Loading,
    /// Hydrated; live events apply immediately; more pages available.
    Ready,
    /// A further page fetch in flight; events are buffered.
    LoadingMore,
    /// Cursor chain exhausted; live events still apply.
    Exhausted,
    /// The initial fetch failed; retryable via refresh or reopen.
    Failed,
}

impl ScopePhase {
    /// Whether a page fetch is currently in flight.
    pub fn is_fetching(self) -> bool {
        matches!(self, ScopePhase::Loading | ScopePhase::LoadingMore)
    }
}

/// Point-in-time view of a scope for consumers.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
    /// Items sorted newest-first.
    pub items: Vec<Item>,
    /// Current phase.
    pub phase: ScopePhase,
    /// Cursor for the next page, if any.
    pub next_cursor: Option<String>,
    /// Scope-level metadata.
    pub metadata: Map<String, Value>,
}

/// Update broadcast to scope subscribers after a mutation.
#[derive(Debug, Clone)]
pub enum ScopeUpdate {
    /// An item was inserted at its sorted position.
    ItemInserted { id: String },
    /// An item's fields changed in place.
    ItemUpdated { id: String },
    /// An item was removed.
    ItemRemoved { id: String },
    /// Scope metadata changed.
    MetadataChanged,
    /// A page merge completed.
    PageMerged { added: usize },
    /// The scope's phase changed.
    Phase(ScopePhase),
    /// The real-time channel is disconnected past its deadline; the cache
    /// keeps serving last-known state.
    ConnectionLost,
    /// The scope was evicted (last consumer closed, or gone upstream).
    Evicted,
}

/// Topic name for a scope's real-time channel.
pub fn scope_topic(scope_id: &str) -> String {
    format!("scope.{}", scope_id)
}
