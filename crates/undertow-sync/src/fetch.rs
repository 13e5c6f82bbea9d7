//! Paginated fetch source.
//!
//! The cache hydrates scopes through the [`PageFetcher`] trait. The
//! production implementation is [`HttpPageFetcher`], a thin HTTPS+JSON
//! client with bearer-token auth. Fetches are stateless and idempotent;
//! retry policy belongs to the caller, not the fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SyncError;
use crate::types::Page;

/// Source of paginated items for a scope.
///
/// `cursor = None` means "first page". A `next_cursor` of `None` in the
/// returned page signals exhaustion.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        scope_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page, SyncError>;
}

/// HTTP implementation of [`PageFetcher`].
pub struct HttpPageFetcher {
    http: Client,
    base_url: String,
    page_limit: usize,
    token: Arc<RwLock<Option<String>>>,
}

impl HttpPageFetcher {
    /// Default number of items requested per page.
    pub const DEFAULT_PAGE_LIMIT: usize = 25;

    /// Create a new fetcher for the given API base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            page_limit: Self::DEFAULT_PAGE_LIMIT,
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set the page size requested from the server.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit;
        self
    }

    /// Replace the bearer token used on subsequent requests.
    ///
    /// Token acquisition and refresh live outside this crate; the fetcher
    /// only attaches whatever token it was last given.
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    /// Clear the bearer token (e.g., after session invalidation).
    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    /// The API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(
        &self,
        scope_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page, SyncError> {
        let url = format!("{}/scopes/{}/items", self.base_url, scope_id);

        let mut request = self
            .http
            .get(&url)
            .query(&[("limit", self.page_limit.to_string())]);

        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        if let Some(token) = self.token.read().await.as_deref() {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let text = response.text().await.unwrap_or_default();
                return Err(SyncError::Auth(format!(
                    "fetch rejected ({}): {}",
                    status, text
                )));
            }
            StatusCode::NOT_FOUND => {
                return Err(SyncError::ScopeGone {
                    scope_id: scope_id.to_string(),
                });
            }
            s if !s.is_success() => {
                // 5xx and other failures surface through reqwest's status
                // error so callers see them as retryable network errors.
                return match response.error_for_status() {
                    Err(e) => Err(SyncError::Network(e)),
                    Ok(_) => Err(SyncError::InvalidResponse(format!(
                        "unexpected status {}",
                        s
                    ))),
                };
            }
            _ => {}
        }

        let page: Page = response.json().await?;

        debug!(
            scope = %scope_id,
            items = page.items.len(),
            exhausted = page.next_cursor.is_none(),
            "fetched page"
        );

        Ok(page)
    }
}
