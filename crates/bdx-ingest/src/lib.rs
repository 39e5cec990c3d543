// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Followers/followings/posts sync services against the upstream provider.
//!
//! Each service owns the full lifecycle of one sync run: open the run row,
//! page the upstream client, reconcile pages into the store, and close the
//! run with a terminal status. None of these services decide *whether* to
//! run, or in what mode — that is the resolver's job; these just execute.

use bdx_core::{IngestEventId, IngestKind, Post, RequestSnapshot as CoreRequestSnapshot, SyncMode, UserId};
use bdx_error::BdxError;
use bdx_store::{CompleteRunInput, StartRunInput, Store, StoreError, UserUpsert};
use bdx_upstream::{Page, RequestSnapshot as UpstreamRequestSnapshot, UpstreamClient, UpstreamPost, UserProfile};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn store_err(e: StoreError) -> BdxError {
    match e {
        StoreError::Bdx(inner) => inner,
        StoreError::NotFound(what) => BdxError::fatal(format!("store row not found: {what}")),
    }
}

fn to_core_snapshot(s: UpstreamRequestSnapshot) -> CoreRequestSnapshot {
    CoreRequestSnapshot {
        method: s.method,
        url: s.url,
        response_status: s.status,
        response_body: s.response_body,
        captured_at: s.captured_at,
    }
}

async fn resolve_handle(client: &dyn UpstreamClient, user_id: UserId) -> Result<String, BdxError> {
    let profiles = client.fetch_users_by_ids(&[user_id], 1).await?;
    let profile = profiles
        .into_iter()
        .next()
        .ok_or_else(|| BdxError::upstream_unexpected(format!("no profile returned for user {user_id}")))?;
    profile
        .handle
        .ok_or_else(|| BdxError::validation(format!("user {user_id} has no handle upstream")))
}

async fn upsert_profile(store: &dyn Store, profile: &UserProfile, ingest_event_id: IngestEventId) -> Result<(), BdxError> {
    store
        .upsert_user(UserUpsert {
            id: profile.id,
            handle: profile.handle.clone(),
            ingest_event_id: Some(ingest_event_id),
        })
        .await
        .map_err(store_err)?;
    Ok(())
}

/// Outcome of a sync run, reported back to the caller for logging and
/// resolver bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The ingest event written for this run.
    pub ingest_event_id: IngestEventId,
    /// `true` iff the upstream cursor was exhausted (vs. an early
    /// incremental stop or a posts window shift that never bottomed out).
    pub cursor_exhausted: bool,
}

/// Syncs one user's followers (accounts following them).
pub struct FollowersSync {
    client: Arc<dyn UpstreamClient>,
    store: Arc<dyn Store>,
}

impl FollowersSync {
    /// Build a service against `client` and `store`.
    #[must_use]
    pub fn new(client: Arc<dyn UpstreamClient>, store: Arc<dyn Store>) -> Self {
        Self { client, store }
    }

    /// Run a full sync of `subject_id`'s followers in `mode`.
    pub async fn run(&self, subject_id: UserId, mode: SyncMode) -> Result<SyncOutcome, BdxError> {
        let ingest_event_id = self
            .store
            .start_ingest_run(StartRunInput {
                kind: IngestKind::TwitterioApiUserFollowers,
                target_user_id: subject_id,
                sync_mode: mode,
            })
            .await
            .map_err(store_err)?;

        match self.run_inner(subject_id, mode, ingest_event_id).await {
            Ok(cursor_exhausted) => {
                self.store
                    .complete_ingest_run(
                        ingest_event_id,
                        CompleteRunInput {
                            status: bdx_core::RunStatus::Success,
                            cursor_exhausted,
                            last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                            last_api_error: None,
                            last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                            synced_since: None,
                        },
                    )
                    .await
                    .map_err(store_err)?;
                info!(%subject_id, cursor_exhausted, "followers sync succeeded");
                Ok(SyncOutcome {
                    ingest_event_id,
                    cursor_exhausted,
                })
            }
            Err(err) => {
                warn!(%subject_id, error = %err, "followers sync failed");
                self.store
                    .complete_ingest_run(
                        ingest_event_id,
                        CompleteRunInput {
                            status: bdx_core::RunStatus::Error,
                            cursor_exhausted: false,
                            last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                            last_api_error: Some(err.to_string()),
                            last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                            synced_since: None,
                        },
                    )
                    .await
                    .map_err(store_err)?;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, subject_id: UserId, mode: SyncMode, ingest_event_id: IngestEventId) -> Result<bool, BdxError> {
        let handle = resolve_handle(self.client.as_ref(), subject_id).await?;
        let mut cursor: Option<String> = None;
        let mut full_refresh_ids: Vec<UserId> = Vec::new();

        loop {
            let page: Page<UserProfile> = self.client.fetch_followers_page(&handle, cursor.as_deref()).await?;
            for profile in &page.items {
                upsert_profile(self.store.as_ref(), profile, ingest_event_id).await?;
            }
            let page_ids: Vec<UserId> = page.items.iter().map(|p| p.id).collect();

            if let Some(snapshot) = self.client.last_snapshot() {
                self.store
                    .record_ingest_progress(ingest_event_id, to_core_snapshot(snapshot))
                    .await
                    .map_err(store_err)?;
            }

            match mode {
                SyncMode::Incremental => {
                    let outcome = self
                        .store
                        .reconcile_followers(subject_id, &page_ids, SyncMode::Incremental)
                        .await
                        .map_err(store_err)?;
                    if outcome.activated == 0 && !page_ids.is_empty() {
                        debug!(%subject_id, "incremental followers sync stopped early: no new edges on page");
                        return Ok(false);
                    }
                }
                SyncMode::FullRefresh => full_refresh_ids.extend(page_ids),
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if matches!(mode, SyncMode::FullRefresh) {
            self.store
                .reconcile_followers(subject_id, &full_refresh_ids, SyncMode::FullRefresh)
                .await
                .map_err(store_err)?;
        }
        Ok(true)
    }
}

/// Syncs one user's followings (accounts they follow).
pub struct FollowingsSync {
    client: Arc<dyn UpstreamClient>,
    store: Arc<dyn Store>,
}

impl FollowingsSync {
    /// Build a service against `client` and `store`.
    #[must_use]
    pub fn new(client: Arc<dyn UpstreamClient>, store: Arc<dyn Store>) -> Self {
        Self { client, store }
    }

    /// Run a full sync of `subject_id`'s followings in `mode`.
    pub async fn run(&self, subject_id: UserId, mode: SyncMode) -> Result<SyncOutcome, BdxError> {
        let ingest_event_id = self
            .store
            .start_ingest_run(StartRunInput {
                kind: IngestKind::TwitterioApiUserFollowings,
                target_user_id: subject_id,
                sync_mode: mode,
            })
            .await
            .map_err(store_err)?;

        match self.run_inner(subject_id, mode, ingest_event_id).await {
            Ok(cursor_exhausted) => {
                self.store
                    .complete_ingest_run(
                        ingest_event_id,
                        CompleteRunInput {
                            status: bdx_core::RunStatus::Success,
                            cursor_exhausted,
                            last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                            last_api_error: None,
                            last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                            synced_since: None,
                        },
                    )
                    .await
                    .map_err(store_err)?;
                info!(%subject_id, cursor_exhausted, "followings sync succeeded");
                Ok(SyncOutcome {
                    ingest_event_id,
                    cursor_exhausted,
                })
            }
            Err(err) => {
                warn!(%subject_id, error = %err, "followings sync failed");
                self.store
                    .complete_ingest_run(
                        ingest_event_id,
                        CompleteRunInput {
                            status: bdx_core::RunStatus::Error,
                            cursor_exhausted: false,
                            last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                            last_api_error: Some(err.to_string()),
                            last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                            synced_since: None,
                        },
                    )
                    .await
                    .map_err(store_err)?;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, subject_id: UserId, mode: SyncMode, ingest_event_id: IngestEventId) -> Result<bool, BdxError> {
        let handle = resolve_handle(self.client.as_ref(), subject_id).await?;
        let mut cursor: Option<String> = None;
        let mut full_refresh_ids: Vec<UserId> = Vec::new();

        loop {
            let page: Page<UserProfile> = self.client.fetch_followings_page(&handle, cursor.as_deref()).await?;
            for profile in &page.items {
                upsert_profile(self.store.as_ref(), profile, ingest_event_id).await?;
            }
            let page_ids: Vec<UserId> = page.items.iter().map(|p| p.id).collect();

            if let Some(snapshot) = self.client.last_snapshot() {
                self.store
                    .record_ingest_progress(ingest_event_id, to_core_snapshot(snapshot))
                    .await
                    .map_err(store_err)?;
            }

            match mode {
                SyncMode::Incremental => {
                    let outcome = self
                        .store
                        .reconcile_followings(subject_id, &page_ids, SyncMode::Incremental)
                        .await
                        .map_err(store_err)?;
                    if outcome.activated == 0 && !page_ids.is_empty() {
                        debug!(%subject_id, "incremental followings sync stopped early: no new edges on page");
                        return Ok(false);
                    }
                }
                SyncMode::FullRefresh => full_refresh_ids.extend(page_ids),
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if matches!(mode, SyncMode::FullRefresh) {
            self.store
                .reconcile_followings(subject_id, &full_refresh_ids, SyncMode::FullRefresh)
                .await
                .map_err(store_err)?;
        }
        Ok(true)
    }
}

/// Upper bound on posts returned for one query before the provider starts
/// truncating; crossing it means the window must shift rather than page
/// further, since the cursor stops advancing once the provider hits its
/// own result cap.
const POSTS_WINDOW_LIMIT: usize = 1000;

/// Syncs posts authored by a batch of users, combined into `from:` OR
/// queries bounded by `max_query_length`.
///
/// Target users are assumed to already exist as `User` rows — every
/// `target_user_id` passed in originates from an already-materialized
/// segment, so posts returned (filtered server-side by `from:<handle>`)
/// never reference an author this engine hasn't already seen.
pub struct PostsSync {
    client: Arc<dyn UpstreamClient>,
    store: Arc<dyn Store>,
    max_query_length: usize,
}

impl PostsSync {
    /// Build a service against `client` and `store`, bounding combined
    /// `from:` query length at `max_query_length`.
    #[must_use]
    pub fn new(client: Arc<dyn UpstreamClient>, store: Arc<dyn Store>, max_query_length: usize) -> Self {
        Self {
            client,
            store,
            max_query_length,
        }
    }

    /// Sync posts for every id in `target_user_ids`, writing one run row
    /// per target so the resolver's per-user freshness and lock model
    /// still applies even though queries are batched.
    pub async fn run(&self, target_user_ids: &[UserId], mode: SyncMode) -> Result<Vec<SyncOutcome>, BdxError> {
        if target_user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut handles = Vec::with_capacity(target_user_ids.len());
        for &id in target_user_ids {
            handles.push((id, resolve_handle(self.client.as_ref(), id).await?));
        }

        let mut run_ids = Vec::with_capacity(target_user_ids.len());
        for &id in target_user_ids {
            run_ids.push(
                self.store
                    .start_ingest_run(StartRunInput {
                        kind: IngestKind::TwitterioApiUsersPosts,
                        target_user_id: id,
                        sync_mode: mode,
                    })
                    .await
                    .map_err(store_err)?,
            );
        }

        match self.run_inner(&handles, mode, &run_ids).await {
            Ok((cursor_exhausted, synced_since)) => {
                for &ingest_event_id in &run_ids {
                    self.store
                        .complete_ingest_run(
                            ingest_event_id,
                            CompleteRunInput {
                                status: bdx_core::RunStatus::Success,
                                cursor_exhausted,
                                last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                                last_api_error: None,
                                last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                                synced_since,
                            },
                        )
                        .await
                        .map_err(store_err)?;
                }
                info!(count = target_user_ids.len(), cursor_exhausted, "posts sync succeeded");
                Ok(run_ids
                    .into_iter()
                    .map(|ingest_event_id| SyncOutcome {
                        ingest_event_id,
                        cursor_exhausted,
                    })
                    .collect())
            }
            Err(err) => {
                warn!(error = %err, "posts sync failed");
                for &ingest_event_id in &run_ids {
                    self.store
                        .complete_ingest_run(
                            ingest_event_id,
                            CompleteRunInput {
                                status: bdx_core::RunStatus::Error,
                                cursor_exhausted: false,
                                last_api_status: self.client.last_snapshot().and_then(|s| s.status),
                                last_api_error: Some(err.to_string()),
                                last_snapshot: self.client.last_snapshot().map(to_core_snapshot),
                                synced_since: None,
                            },
                        )
                        .await
                        .map_err(store_err)?;
                }
                Err(err)
            }
        }
    }

    fn build_queries(&self, handles: &[(UserId, String)]) -> Result<Vec<String>, BdxError> {
        let mut queries = Vec::new();
        let mut current = String::new();
        for (_, handle) in handles {
            let term = format!("from:{handle}");
            if term.len() > self.max_query_length {
                return Err(BdxError::validation(format!("handle '{handle}' alone exceeds max_query_length")));
            }
            let candidate_len = if current.is_empty() {
                term.len()
            } else {
                current.len() + " OR ".len() + term.len()
            };
            if candidate_len > self.max_query_length {
                queries.push(std::mem::take(&mut current));
                current = term;
            } else if current.is_empty() {
                current = term;
            } else {
                current.push_str(" OR ");
                current.push_str(&term);
            }
        }
        if !current.is_empty() {
            queries.push(current);
        }
        Ok(queries)
    }

    async fn run_inner(
        &self,
        handles: &[(UserId, String)],
        mode: SyncMode,
        run_ids: &[IngestEventId],
    ) -> Result<(bool, Option<DateTime<Utc>>), BdxError> {
        let queries = self.build_queries(handles)?;
        let mut cursor_exhausted = true;
        let mut earliest_synced: Option<DateTime<Utc>> = None;

        for base_query in queries {
            let mut window_until: Option<DateTime<Utc>> = None;
            let mut cursor: Option<String> = None;
            'window: loop {
                let query = match window_until {
                    Some(until) => format!("{base_query} until:{}", until.to_rfc3339()),
                    None => base_query.clone(),
                };
                let page: Page<UpstreamPost> = self.client.fetch_posts_page(&query, cursor.as_deref()).await?;
                if let Some(snapshot) = self.client.last_snapshot() {
                    let core_snapshot = to_core_snapshot(snapshot);
                    for &ingest_event_id in run_ids {
                        self.store
                            .record_ingest_progress(ingest_event_id, core_snapshot.clone())
                            .await
                            .map_err(store_err)?;
                    }
                }

                let mut saw_new = false;
                let mut oldest_in_page: Option<DateTime<Utc>> = None;
                for post in &page.items {
                    self.store
                        .upsert_post(Post {
                            id: post.id,
                            author_id: post.author_id,
                            posted_at: post.posted_at,
                            text: post.text.clone(),
                            lang: post.lang.clone(),
                            raw_payload: post.raw.clone(),
                            is_deleted: false,
                        })
                        .await
                        .map_err(store_err)?;
                    saw_new = true;
                    oldest_in_page = Some(oldest_in_page.map_or(post.posted_at, |o: DateTime<Utc>| o.min(post.posted_at)));
                }

                earliest_synced = match (earliest_synced, oldest_in_page) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, b) => b,
                };

                if matches!(mode, SyncMode::Incremental) && !saw_new {
                    debug!("incremental posts sync stopped early: no new posts on page");
                    break 'window;
                }

                if page.items.len() >= POSTS_WINDOW_LIMIT {
                    let shift_to = oldest_in_page
                        .ok_or_else(|| BdxError::fatal("posts window limit hit with no items to shift from"))?
                        - chrono::Duration::seconds(1);
                    window_until = Some(shift_to);
                    cursor = None;
                    cursor_exhausted = false;
                    continue;
                }

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break 'window,
                }
            }
        }

        Ok((cursor_exhausted, earliest_synced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bdx_core::PostId;
    use bdx_store::mem::MemStore;
    use std::sync::Mutex as StdMutex;

    struct FakeClient {
        profiles: Vec<UserProfile>,
        follower_pages: StdMutex<Vec<Page<UserProfile>>>,
        following_pages: StdMutex<Vec<Page<UserProfile>>>,
        post_pages: StdMutex<Vec<Page<UpstreamPost>>>,
    }

    #[async_trait]
    impl UpstreamClient for FakeClient {
        async fn fetch_user_profile_by_handle(&self, _handle: &str) -> Result<UserProfile, BdxError> {
            self.profiles.first().cloned().ok_or_else(|| BdxError::fatal("no profile"))
        }

        async fn fetch_users_by_ids(&self, ids: &[UserId], _batch_size: usize) -> Result<Vec<UserProfile>, BdxError> {
            Ok(self.profiles.iter().filter(|p| ids.contains(&p.id)).cloned().collect())
        }

        async fn fetch_followers_page(&self, _handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            let mut pages = self.follower_pages.lock().unwrap();
            Ok(if pages.is_empty() {
                Page {
                    items: Vec::new(),
                    next_cursor: None,
                }
            } else {
                pages.remove(0)
            })
        }

        async fn fetch_followings_page(&self, _handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            let mut pages = self.following_pages.lock().unwrap();
            Ok(if pages.is_empty() {
                Page {
                    items: Vec::new(),
                    next_cursor: None,
                }
            } else {
                pages.remove(0)
            })
        }

        async fn fetch_posts_page(&self, _query: &str, _cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError> {
            let mut pages = self.post_pages.lock().unwrap();
            Ok(if pages.is_empty() {
                Page {
                    items: Vec::new(),
                    next_cursor: None,
                }
            } else {
                pages.remove(0)
            })
        }

        async fn fetch_posts_by_ids(&self, _ids: &[PostId], _batch_size: usize) -> Result<Vec<UpstreamPost>, BdxError> {
            Ok(Vec::new())
        }

        fn last_snapshot(&self) -> Option<UpstreamRequestSnapshot> {
            None
        }
    }

    fn profile(id: i64, handle: &str) -> UserProfile {
        UserProfile {
            id: UserId(id),
            handle: Some(handle.to_string()),
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn followers_sync_full_refresh_pages_and_reconciles() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(1, "subject")],
            follower_pages: StdMutex::new(vec![Page {
                items: vec![profile(2, "alice"), profile(3, "bob")],
                next_cursor: None,
            }]),
            following_pages: StdMutex::new(Vec::new()),
            post_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let sync = FollowersSync::new(client, store.clone());

        let outcome = sync.run(UserId(1), SyncMode::FullRefresh).await.unwrap();
        assert!(outcome.cursor_exhausted);

        let followers = store.active_followers(UserId(1)).await.unwrap();
        assert_eq!(followers.len(), 2);
    }

    #[tokio::test]
    async fn followings_sync_incremental_stops_on_empty_activation() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(1, "subject")],
            follower_pages: StdMutex::new(Vec::new()),
            following_pages: StdMutex::new(vec![Page {
                items: vec![profile(2, "alice")],
                next_cursor: Some("next".to_string()),
            }]),
            post_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let sync = FollowingsSync::new(client, store.clone());

        let outcome = sync.run(UserId(1), SyncMode::Incremental).await.unwrap();
        assert!(!outcome.cursor_exhausted);

        let followings = store.active_followings(UserId(1)).await.unwrap();
        assert_eq!(followings.len(), 1);
    }

    #[tokio::test]
    async fn posts_sync_builds_one_run_per_target_and_ingests_posts() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(10, "carol"), profile(11, "dave")],
            follower_pages: StdMutex::new(Vec::new()),
            following_pages: StdMutex::new(Vec::new()),
            post_pages: StdMutex::new(vec![Page {
                items: vec![UpstreamPost {
                    id: PostId(500),
                    author_id: UserId(10),
                    posted_at: Utc::now(),
                    text: "hello".to_string(),
                    lang: Some("en".to_string()),
                    raw: serde_json::json!({}),
                }],
                next_cursor: None,
            }]),
        });
        let store = Arc::new(MemStore::new());
        let sync = PostsSync::new(client, store.clone(), 256);

        let outcomes = sync.run(&[UserId(10), UserId(11)], SyncMode::FullRefresh).await.unwrap();
        assert_eq!(outcomes.len(), 2);

        let posts = store.active_posts_by_authors(&[UserId(10)]).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, PostId(500));
    }

    #[tokio::test]
    async fn posts_sync_rejects_empty_batch_as_noop() {
        let client = Arc::new(FakeClient {
            profiles: Vec::new(),
            follower_pages: StdMutex::new(Vec::new()),
            following_pages: StdMutex::new(Vec::new()),
            post_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let sync = PostsSync::new(client, store, 256);
        let outcomes = sync.run(&[], SyncMode::FullRefresh).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn build_queries_splits_on_max_length() {
        let client = Arc::new(FakeClient {
            profiles: Vec::new(),
            follower_pages: StdMutex::new(Vec::new()),
            following_pages: StdMutex::new(Vec::new()),
            post_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let sync = PostsSync::new(client, store, 24);
        let handles = vec![(UserId(1), "alice".to_string()), (UserId(2), "bob".to_string())];
        let queries = sync.build_queries(&handles).unwrap();
        assert_eq!(queries, vec!["from:alice".to_string(), "from:bob".to_string()]);
    }

    #[test]
    fn build_queries_rejects_single_handle_over_limit() {
        let client = Arc::new(FakeClient {
            profiles: Vec::new(),
            follower_pages: StdMutex::new(Vec::new()),
            following_pages: StdMutex::new(Vec::new()),
            post_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let sync = PostsSync::new(client, store, 5);
        let handles = vec![(UserId(1), "alice".to_string())];
        assert!(sync.build_queries(&handles).is_err());
    }
}
