// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Prerequisite resolution: decides ingest mode from run recency, then
//! coordinates advisory-lock-guarded execution of the sync services in
//! `bdx-ingest`.
//!
//! The registry only declares *what* ingest a materialization needs
//! (`AssetDefinition::ingest_requirements`); this crate decides *how* --
//! full refresh or incremental -- and serializes concurrent attempts at
//! the same `(kind, target)` pair via a Postgres advisory lock so two
//! workers never double-sync the same user at once.

use bdx_core::{IngestKind, RunStatus, SyncMode, UserId};
use bdx_error::BdxError;
use bdx_ingest::{FollowersSync, FollowingsSync, PostsSync, SyncOutcome};
use bdx_store::{IngestRequirement, LockGuard, Store, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default poll timeout for an advisory lock acquire before a requirement
/// is deferred to the next tick.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval used while waiting for a contended advisory lock.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn store_err(err: StoreError) -> BdxError {
    match err {
        StoreError::Bdx(inner) => inner,
        StoreError::NotFound(what) => BdxError::fatal(format!("store row not found: {what}")),
    }
}

/// Outcome of resolving one [`IngestRequirement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The ingest ran to completion; the sync service already recorded
    /// success or failure against its own run row.
    Synced(SyncOutcome),
    /// The advisory lock for this `(kind, target)` was held elsewhere for
    /// the entire poll timeout. The requirement was never attempted and
    /// should be retried next tick.
    Deferred,
}

/// Resolves ingest requirements: picks full-refresh vs. incremental from
/// run recency, then runs the corresponding `bdx-ingest` service under an
/// advisory lock.
pub struct Resolver {
    store: Arc<dyn Store>,
    followers: FollowersSync,
    followings: FollowingsSync,
    posts: PostsSync,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl Resolver {
    /// Build a resolver over the given sync services, using the default
    /// lock timeout and poll interval.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, followers: FollowersSync, followings: FollowingsSync, posts: PostsSync) -> Self {
        Self {
            store,
            followers,
            followings,
            posts,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }

    /// Override the lock timeout and poll interval. Tests use this to
    /// make a contended lock defer in milliseconds instead of seconds.
    #[must_use]
    pub fn with_lock_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_poll_interval = poll_interval;
        self
    }

    /// Resolve every requirement in order, returning one outcome per
    /// requirement. A sync failure propagates immediately -- the caller
    /// (the planner) treats that as the owning instance's materialization
    /// failing for this tick.
    pub async fn resolve_all(&self, requirements: &[IngestRequirement]) -> Result<Vec<ResolveOutcome>, BdxError> {
        let mut outcomes = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            outcomes.push(self.resolve_one(requirement).await?);
        }
        Ok(outcomes)
    }

    /// Resolve a single requirement: decide mode, acquire its advisory
    /// lock (polling up to the configured timeout), run the ingest, and
    /// release the lock on every exit path.
    pub async fn resolve_one(&self, requirement: &IngestRequirement) -> Result<ResolveOutcome, BdxError> {
        let mode = self.decide_mode(requirement).await?;
        let lock_key = advisory_lock_key(requirement.kind, requirement.target_user_id);

        let guard = match self.acquire_lock(lock_key).await? {
            Some(guard) => guard,
            None => {
                debug!(
                    kind = requirement.kind.as_str(),
                    target = %requirement.target_user_id,
                    "ingest lock contended past timeout, deferring"
                );
                return Ok(ResolveOutcome::Deferred);
            }
        };

        let result = self.run_ingest(requirement, mode).await;
        guard.release().await;
        result.map(ResolveOutcome::Synced)
    }

    async fn decide_mode(&self, requirement: &IngestRequirement) -> Result<SyncMode, BdxError> {
        let latest = self
            .store
            .latest_run(requirement.kind, requirement.target_user_id)
            .await
            .map_err(store_err)?;

        let stale = match &latest {
            None => true,
            Some(run) => {
                run.status != RunStatus::Success
                    || run.completed_at.is_none_or(|completed_at| {
                        Utc::now() - completed_at > chrono::Duration::milliseconds(requirement.freshness_ms)
                    })
            }
        };
        if stale {
            return Ok(SyncMode::FullRefresh);
        }

        let tracks_full_refresh_history = matches!(
            requirement.kind,
            IngestKind::TwitterioApiUserFollowers | IngestKind::TwitterioApiUserFollowings
        );
        if tracks_full_refresh_history {
            let has_full = self
                .store
                .has_successful_full_refresh(requirement.kind, requirement.target_user_id)
                .await
                .map_err(store_err)?;
            if !has_full {
                return Ok(SyncMode::FullRefresh);
            }
        }

        Ok(SyncMode::Incremental)
    }

    async fn acquire_lock(&self, key: i64) -> Result<Option<Box<dyn LockGuard>>, BdxError> {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            if let Some(guard) = self.store.try_advisory_lock(key).await.map_err(store_err)? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.lock_poll_interval).await;
        }
    }

    async fn run_ingest(&self, requirement: &IngestRequirement, mode: SyncMode) -> Result<SyncOutcome, BdxError> {
        match requirement.kind {
            IngestKind::TwitterioApiUserFollowers => self.followers.run(requirement.target_user_id, mode).await,
            IngestKind::TwitterioApiUserFollowings => self.followings.run(requirement.target_user_id, mode).await,
            IngestKind::TwitterioApiUsersPosts => {
                let mut outcomes = self.posts.run(&[requirement.target_user_id], mode).await?;
                outcomes
                    .pop()
                    .ok_or_else(|| BdxError::fatal("posts sync returned no outcome for a single-target batch"))
            }
            other => Err(BdxError::validation(format!(
                "resolver cannot satisfy ingest kind {}",
                other.as_str()
            ))),
        }
    }
}

/// Deterministic lock key for one `(kind, target_user_id)` pair, folded
/// into an `i64` the way `hashtext(...)` folds a string for a Postgres
/// advisory lock key. This is a local FNV-1a fold, not `hashtext` itself --
/// nothing depends on matching its exact bit pattern, only on every
/// caller (and both `Store` implementations) agreeing on one stable,
/// well-distributed function from key string to `i64`.
fn advisory_lock_key(kind: IngestKind, target_user_id: UserId) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let key = format!("ingest:{}:{}", kind.as_str(), target_user_id.get());
    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bdx_core::{PostId, UserId as CoreUserId};
    use bdx_store::mem::MemStore;
    use bdx_store::UserUpsert;
    use bdx_upstream::{Page, RequestSnapshot as UpstreamRequestSnapshot, UpstreamClient, UpstreamPost, UserProfile};
    use std::sync::Mutex as StdMutex;

    struct FakeClient {
        profiles: Vec<UserProfile>,
        follower_pages: StdMutex<Vec<Page<UserProfile>>>,
    }

    #[async_trait]
    impl UpstreamClient for FakeClient {
        async fn fetch_user_profile_by_handle(&self, _handle: &str) -> Result<UserProfile, BdxError> {
            self.profiles.first().cloned().ok_or_else(|| BdxError::fatal("no profile"))
        }

        async fn fetch_users_by_ids(&self, ids: &[CoreUserId], _batch_size: usize) -> Result<Vec<UserProfile>, BdxError> {
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
            Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            })
        }

        async fn fetch_posts_page(&self, _query: &str, _cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError> {
            Ok(Page {
                items: Vec::new(),
                next_cursor: None,
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
            id: CoreUserId(id),
            handle: Some(handle.to_string()),
            is_deleted: false,
        }
    }

    fn resolver(client: Arc<FakeClient>, store: Arc<MemStore>) -> Resolver {
        Resolver::new(
            store.clone(),
            FollowersSync::new(client.clone(), store.clone()),
            FollowingsSync::new(client.clone(), store.clone()),
            PostsSync::new(client, store, 256),
        )
    }

    #[tokio::test]
    async fn chooses_full_refresh_when_no_prior_run_exists() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(1, "subject")],
            follower_pages: StdMutex::new(vec![Page {
                items: vec![profile(2, "alice")],
                next_cursor: None,
            }]),
        });
        let store = Arc::new(MemStore::new());
        let resolver = resolver(client, store.clone());

        let requirement = IngestRequirement {
            kind: IngestKind::TwitterioApiUserFollowers,
            target_user_id: CoreUserId(1),
            freshness_ms: 60_000,
            requested_by_materialization_id: None,
        };

        let outcome = resolver.resolve_one(&requirement).await.unwrap();
        match outcome {
            ResolveOutcome::Synced(sync_outcome) => assert!(sync_outcome.cursor_exhausted),
            ResolveOutcome::Deferred => panic!("expected a synced outcome on first run"),
        }

        let latest = store
            .latest_run(IngestKind::TwitterioApiUserFollowers, CoreUserId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.sync_mode, SyncMode::FullRefresh);
    }

    #[tokio::test]
    async fn chooses_incremental_once_fresh_full_refresh_exists() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(1, "subject")],
            follower_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        store
            .upsert_user(UserUpsert {
                id: CoreUserId(1),
                handle: Some("subject".to_string()),
                ingest_event_id: None,
            })
            .await
            .unwrap();
        let resolver = resolver(client, store.clone());

        let requirement = IngestRequirement {
            kind: IngestKind::TwitterioApiUserFollowers,
            target_user_id: CoreUserId(1),
            freshness_ms: 3_600_000,
            requested_by_materialization_id: None,
        };

        resolver.resolve_one(&requirement).await.unwrap();
        let second = resolver.resolve_one(&requirement).await.unwrap();
        match second {
            ResolveOutcome::Synced(_) => {}
            ResolveOutcome::Deferred => panic!("lock should not be contended in a single-threaded test"),
        }

        let latest = store
            .latest_run(IngestKind::TwitterioApiUserFollowers, CoreUserId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.sync_mode, SyncMode::Incremental);
    }

    #[tokio::test]
    async fn defers_when_lock_is_already_held() {
        let client = Arc::new(FakeClient {
            profiles: vec![profile(1, "subject")],
            follower_pages: StdMutex::new(Vec::new()),
        });
        let store = Arc::new(MemStore::new());
        let resolver = resolver(client, store.clone())
            .with_lock_timing(Duration::from_millis(20), Duration::from_millis(5));

        let requirement = IngestRequirement {
            kind: IngestKind::TwitterioApiUserFollowers,
            target_user_id: CoreUserId(1),
            freshness_ms: 60_000,
            requested_by_materialization_id: None,
        };
        let key = advisory_lock_key(requirement.kind, requirement.target_user_id);
        let held = store.try_advisory_lock(key).await.unwrap();
        assert!(held.is_some());

        let outcome = resolver.resolve_one(&requirement).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Deferred);
    }

    #[test]
    fn advisory_lock_key_is_stable_and_kind_specific() {
        let a = advisory_lock_key(IngestKind::TwitterioApiUserFollowers, CoreUserId(7));
        let b = advisory_lock_key(IngestKind::TwitterioApiUserFollowers, CoreUserId(7));
        let c = advisory_lock_key(IngestKind::TwitterioApiUserFollowings, CoreUserId(7));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
