// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! HTTP capability interface to the upstream social-graph provider.
//!
//! [`UpstreamClient`] is a capability interface, not a wire-exact binding:
//! callers ask for pages of followers, followings, posts, and batched
//! lookups by id, without knowing which concrete HTTP endpoints or query
//! parameters the provider uses underneath. [`ReqwestUpstreamClient`] is
//! the production implementation; tests substitute a fake or point the
//! real client at a `wiremock` server.

use async_trait::async_trait;
use bdx_core::{PostId, UserId};
use bdx_error::BdxError;
use bdx_ratelimit::RateLimiter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items returned on this page.
    pub items: Vec<T>,
    /// Opaque cursor to pass back for the next page, or `None` if this was
    /// the last page.
    pub next_cursor: Option<String>,
}

/// A user profile as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Provider-assigned user id.
    pub id: UserId,
    /// Current handle, if any.
    pub handle: Option<String>,
    /// `true` if the provider reports this account as no longer active.
    pub is_deleted: bool,
}

/// A post as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPost {
    /// Provider-assigned post id.
    pub id: PostId,
    /// Author of the post.
    pub author_id: UserId,
    /// Publication time, RFC 3339.
    pub posted_at: chrono::DateTime<Utc>,
    /// Post body text.
    pub text: String,
    /// BCP-47-ish language tag, if reported.
    pub lang: Option<String>,
    /// Full raw payload, retained for forward-compatible reprocessing.
    pub raw: serde_json::Value,
}

/// Size-capped snapshot of the last HTTP request/response pair issued by a
/// client, with the bearer token redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// HTTP method, e.g. `"GET"`.
    pub method: String,
    /// Request URL, with auth query parameters/headers redacted.
    pub url: String,
    /// Request body, if any (GET requests carry none).
    pub request_body: Option<String>,
    /// Response HTTP status code, if a response was received.
    pub status: Option<u16>,
    /// Response body, truncated to the configured cap.
    pub response_body: String,
    /// When this snapshot was captured.
    pub captured_at: chrono::DateTime<Utc>,
}

/// Capability interface over the upstream social-graph provider.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch a user's profile by handle.
    async fn fetch_user_profile_by_handle(&self, handle: &str) -> Result<UserProfile, BdxError>;

    /// Fetch profiles for a batch of user ids. `batch_size` bounds how
    /// many ids are sent per underlying request; callers may pass more
    /// ids than `batch_size` and the client chunks them.
    async fn fetch_users_by_ids(&self, ids: &[UserId], batch_size: usize) -> Result<Vec<UserProfile>, BdxError>;

    /// Fetch one page of a user's followers.
    async fn fetch_followers_page(&self, handle: &str, cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError>;

    /// Fetch one page of the accounts a user follows.
    async fn fetch_followings_page(&self, handle: &str, cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError>;

    /// Fetch one page of posts matching a provider search query.
    async fn fetch_posts_page(&self, query: &str, cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError>;

    /// Fetch posts for a batch of post ids.
    async fn fetch_posts_by_ids(&self, ids: &[PostId], batch_size: usize) -> Result<Vec<UpstreamPost>, BdxError>;

    /// The most recent request/response snapshot captured by this client,
    /// bearer-token redacted, for inclusion in ingest-run metadata.
    fn last_snapshot(&self) -> Option<RequestSnapshot>;
}

/// Production [`UpstreamClient`] over `reqwest`.
pub struct ReqwestUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
    rate_limiter: RateLimiter,
    body_max_bytes: usize,
    last_snapshot: Arc<StdMutex<Option<RequestSnapshot>>>,
}

impl ReqwestUpstreamClient {
    /// Construct a client against `base_url`, authenticating with
    /// `bearer_token` and rate-limited by `rate_limiter`. `body_max_bytes`
    /// bounds how much of a response body is retained in request
    /// snapshots.
    #[must_use]
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>, rate_limiter: RateLimiter, body_max_bytes: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            rate_limiter,
            body_max_bytes,
            last_snapshot: Arc::new(StdMutex::new(None)),
        }
    }

    /// The most recent request/response snapshot captured by this client,
    /// bearer-token redacted, for inclusion in ingest-run metadata.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<RequestSnapshot> {
        self.last_snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    fn redact_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn get_json(&self, path_and_query: &str) -> Result<serde_json::Value, BdxError> {
        self.rate_limiter.wait().await;

        let url = format!("{}{}", self.base_url, path_and_query);
        let redacted_url = self.redact_url(path_and_query);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| BdxError::transport(e.to_string()))?;

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();
        let truncated_body: String = body_text.chars().take(self.body_max_bytes).collect();

        self.record_snapshot(RequestSnapshot {
            method: "GET".to_string(),
            url: redacted_url,
            request_body: None,
            status: Some(status.as_u16()),
            response_body: truncated_body.clone(),
            captured_at: Utc::now(),
        });

        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(&body_text);
            return Err(BdxError::rate_limit(retry_after));
        }
        if status.as_u16() >= 500 {
            return Err(BdxError::upstream_unexpected(format!("status {status}")));
        }
        if status.as_u16() >= 400 {
            return Err(BdxError::upstream_request(status.as_u16(), truncated_body));
        }

        serde_json::from_str(&body_text).map_err(|e| BdxError::upstream_unexpected(format!("invalid json: {e}")))
    }

    fn record_snapshot(&self, snapshot: RequestSnapshot) {
        *self.last_snapshot.lock().expect("snapshot lock poisoned") = Some(snapshot);
    }
}

/// Best-effort `Retry-After` extraction from a `429` body shaped like
/// `{"retry_after_seconds": n}`; absent or malformed bodies yield `None`
/// rather than an error, since the caller can always fall back to its own
/// backoff policy.
fn parse_retry_after(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("retry_after_seconds")?.as_u64()
}

fn chunks<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(size).map(<[T]>::to_vec).collect()
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn fetch_user_profile_by_handle(&self, handle: &str) -> Result<UserProfile, BdxError> {
        let value = self.get_json(&format!("/users/by/username/{handle}")).await?;
        serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))
    }

    async fn fetch_users_by_ids(&self, ids: &[UserId], batch_size: usize) -> Result<Vec<UserProfile>, BdxError> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in chunks(ids, batch_size.max(1)) {
            let csv = batch.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            let value = self.get_json(&format!("/users?ids={csv}")).await?;
            let page: Vec<UserProfile> = serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))?;
            out.extend(page);
        }
        Ok(out)
    }

    async fn fetch_followers_page(&self, handle: &str, cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
        let path = match cursor {
            Some(c) => format!("/users/by/username/{handle}/followers?cursor={c}"),
            None => format!("/users/by/username/{handle}/followers"),
        };
        let value = self.get_json(&path).await?;
        serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))
    }

    async fn fetch_followings_page(&self, handle: &str, cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
        let path = match cursor {
            Some(c) => format!("/users/by/username/{handle}/followings?cursor={c}"),
            None => format!("/users/by/username/{handle}/followings"),
        };
        let value = self.get_json(&path).await?;
        serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))
    }

    async fn fetch_posts_page(&self, query: &str, cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError> {
        let encoded = urlencoding_lite(query);
        let path = match cursor {
            Some(c) => format!("/posts/search?query={encoded}&cursor={c}"),
            None => format!("/posts/search?query={encoded}"),
        };
        let value = self.get_json(&path).await?;
        serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))
    }

    async fn fetch_posts_by_ids(&self, ids: &[PostId], batch_size: usize) -> Result<Vec<UpstreamPost>, BdxError> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in chunks(ids, batch_size.max(1)) {
            let csv = batch.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            let value = self.get_json(&format!("/posts?ids={csv}")).await?;
            let page: Vec<UpstreamPost> = serde_json::from_value(value).map_err(|e| BdxError::upstream_unexpected(e.to_string()))?;
            out.extend(page);
        }
        Ok(out)
    }

    fn last_snapshot(&self) -> Option<RequestSnapshot> {
        ReqwestUpstreamClient::last_snapshot(self)
    }
}

/// Minimal percent-encoding for query parameters; the provider's search
/// syntax uses only spaces, parentheses, and `OR`/`from:` tokens, so a full
/// `url`-crate dependency would be unused weight.
fn urlencoding_lite(s: &str) -> String {
    // Query values here can carry `until:<rfc3339>` timestamps, whose `+00:00`
    // UTC offset contains both `+` and `:`. An unencoded `+` in a query value
    // decodes to a space server-side, so it must be escaped alongside space
    // itself.
    s.chars()
        .map(|c| match c {
            ' ' => "%20".to_string(),
            '"' => "%22".to_string(),
            '+' => "%2B".to_string(),
            ':' => "%3A".to_string(),
            '&' => "%26".to_string(),
            '=' => "%3D".to_string(),
            '%' => "%25".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ReqwestUpstreamClient {
        ReqwestUpstreamClient::new(server.uri(), "test-token", RateLimiter::new(), 65_536)
    }

    #[tokio::test]
    async fn successful_profile_fetch_parses_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1, "handle": "alice", "is_deleted": false
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let profile = client.fetch_user_profile_by_handle("alice").await.unwrap();
        assert_eq!(profile.id, UserId(1));
        assert_eq!(profile.handle.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn rate_limit_status_maps_to_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/alice"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "retry_after_seconds": 30
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.fetch_user_profile_by_handle("alice").await.unwrap_err();
        assert_eq!(err, BdxError::rate_limit(Some(30)));
    }

    #[tokio::test]
    async fn server_error_maps_to_unexpected_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/alice"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.fetch_user_profile_by_handle("alice").await.unwrap_err();
        assert_eq!(err.category(), bdx_error::ErrorCategory::UpstreamUnexpectedResponse);
    }

    #[tokio::test]
    async fn client_error_maps_to_request_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/ghost"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.fetch_user_profile_by_handle("ghost").await.unwrap_err();
        match err {
            BdxError::UpstreamRequest { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "not found");
            }
            other => panic!("expected UpstreamRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_maps_to_unexpected_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.fetch_user_profile_by_handle("alice").await.unwrap_err();
        assert_eq!(err.category(), bdx_error::ErrorCategory::UpstreamUnexpectedResponse);
    }

    #[tokio::test]
    async fn last_snapshot_is_recorded_and_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/by/username/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1, "handle": "alice", "is_deleted": false
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.last_snapshot().is_none());
        client.fetch_user_profile_by_handle("alice").await.unwrap();
        let snapshot = client.last_snapshot().expect("snapshot recorded");
        assert_eq!(snapshot.status, Some(200));
        assert!(!snapshot.url.contains("test-token"));
    }

    #[tokio::test]
    async fn users_by_ids_chunks_requests_by_batch_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "handle": "a", "is_deleted": false}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let ids: Vec<UserId> = (1..=5).map(UserId).collect();
        let profiles = client.fetch_users_by_ids(&ids, 2).await.unwrap();
        // 3 batches of size <=2 each returning 1 profile = 3 profiles
        assert_eq!(profiles.len(), 3);
    }
}
