//! Incremental synchronized cache for feed/chat-style clients.
//!
//! Reconciles a paginated "load more" cursor model with out-of-band push
//! events that insert, update, or remove items in the same collection,
//! guaranteeing no duplicate ids, no lost updates, and stable newest-first
//! ordering.
//!
//! ## Components
//!
//! - **Fetch**: [`PageFetcher`] trait with an HTTP implementation for
//!   cursor-paginated item pages
//! - **Channel**: shared WebSocket connection with reference-counted topic
//!   subscriptions and reconnect handling
//! - **Cache**: per-scope merge of pages and events with version-guarded
//!   staleness protection and optimistic mutations
//! - **Lifecycle**: reference-counted registry binding UI-visible scopes
//!   to cache and channel resources

pub mod cache;
pub mod channel;
mod error;
pub mod fetch;
pub mod lifecycle;
mod types;

pub use cache::SyncCache;
pub use channel::{
    ChannelAdapter, ChannelEvent, DEFAULT_RECONNECT_DEADLINE, TopicHandle,
};
pub use error::SyncError;
pub use fetch::{HttpPageFetcher, PageFetcher};
pub use lifecycle::{ScopeHandle, ScopeRegistry};
pub use types::{Event, Item, Page, ScopePhase, ScopeSnapshot, ScopeUpdate, scope_topic};
