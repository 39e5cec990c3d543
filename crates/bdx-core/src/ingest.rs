// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ingest run records.
//!
//! Every sync against the upstream provider writes a parent [`IngestEvent`]
//! row plus one kind-specific child row ([`FollowersRun`], [`FollowingsRun`],
//! [`PostsRun`]) that tracks status, sync mode, cursor exhaustion, and the
//! last HTTP request/response snapshot.

use crate::ids::{IngestEventId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of upstream sync a run performs.
///
/// Variant names mirror the provider's own API surface so that a run row's
/// `ingest_kind` column reads the same in logs, the store, and an operator's
/// mental model of "which endpoint did this call". `IftttWebhookNewFollow`
/// is written only by the out-of-scope webhook receiver; the engine never
/// originates it but must be able to round-trip rows written by that
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestKind {
    /// `twitterio_api_user_followers`
    TwitterioApiUserFollowers,
    /// `twitterio_api_user_followings`
    TwitterioApiUserFollowings,
    /// `twitterio_api_users_posts`
    TwitterioApiUsersPosts,
    /// `twitterio_api_users_by_ids`
    TwitterioApiUsersByIds,
    /// `twitterio_api_posts_by_ids`
    TwitterioApiPostsByIds,
    /// `ifttt_webhook_new_follow` — written by the webhook receiver, not by
    /// this engine's ingest services.
    IftttWebhookNewFollow,
}

impl IngestKind {
    /// The stable lowercase-with-underscores wire name, matching the
    /// `ingest_kind` column values named in the persistence layout.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TwitterioApiUserFollowers => "twitterio_api_user_followers",
            Self::TwitterioApiUserFollowings => "twitterio_api_user_followings",
            Self::TwitterioApiUsersPosts => "twitterio_api_users_posts",
            Self::TwitterioApiUsersByIds => "twitterio_api_users_by_ids",
            Self::TwitterioApiPostsByIds => "twitterio_api_posts_by_ids",
            Self::IftttWebhookNewFollow => "ifttt_webhook_new_follow",
        }
    }
}

/// Reconciliation strategy a sync run uses against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Caller supplies the full set of active counterparts; the store
    /// soft-deletes anything missing and revives/upserts the rest.
    FullRefresh,
    /// Only upserts; stops early once a page contains no previously
    /// inactive edges (followers/followings) or nothing new (posts).
    Incremental,
}

/// Status of any sync-run row. `InProgress` and `completed_at.is_none()`
/// are kept in lockstep by every `Store` method that transitions a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run started; `completed_at` is `None`.
    InProgress,
    /// Run finished successfully; `completed_at` is `Some`.
    Success,
    /// Run finished with an error; `completed_at` is `Some`.
    Error,
}

/// Size-capped snapshot of the last HTTP request/response pair the run
/// issued, retained for ingest-run metadata and operator debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// HTTP method, e.g. `"GET"`.
    pub method: String,
    /// Request URL with auth query params/headers redacted.
    pub url: String,
    /// Response HTTP status code, if a response was received.
    pub response_status: Option<u16>,
    /// Response body, truncated to the configured cap.
    pub response_body: String,
    /// When this snapshot was captured.
    pub captured_at: DateTime<Utc>,
}

/// Parent row for every sync run, regardless of kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEvent {
    /// Primary key.
    pub id: IngestEventId,
    /// Which kind of sync this event represents.
    pub ingest_kind: IngestKind,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Fields shared by every per-kind sync-run child row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommon {
    /// Parent `IngestEvent` id.
    pub ingest_event_id: IngestEventId,
    /// The user this run targeted (followers/followings) or drove queries
    /// against (posts, indirectly via its members).
    pub target_user_id: UserId,
    /// Current status.
    pub status: RunStatus,
    /// Reconciliation mode used.
    pub sync_mode: SyncMode,
    /// `true` iff the upstream cursor was exhausted (vs. the run stopping
    /// early for an incremental "no new" condition or a posts window
    /// shift that never bottomed out).
    pub cursor_exhausted: bool,
    /// Last HTTP status code observed, if any call was made.
    pub last_api_status: Option<u16>,
    /// Last API error message, set only on `status = Error`.
    pub last_api_error: Option<String>,
    /// Last request/response snapshot captured during the run.
    pub last_snapshot: Option<RequestSnapshot>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished; `None` iff `status == InProgress`.
    pub completed_at: Option<DateTime<Utc>>,
}

/// `followers` sync-run child row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowersRun {
    /// Fields shared with every sync-run kind.
    pub common: RunCommon,
}

/// `followings` sync-run child row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowingsRun {
    /// Fields shared with every sync-run kind.
    pub common: RunCommon,
}

/// `posts` sync-run child row. Carries the posts-specific `synced_since`
/// watermark, set only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostsRun {
    /// Fields shared with every sync-run kind.
    pub common: RunCommon,
    /// Earliest `posted_at` this run observed and is willing to vouch for
    /// as "fully synced from here forward"; set on success only.
    pub synced_since: Option<DateTime<Utc>>,
}

impl RunCommon {
    /// Enforce the `(status == InProgress) <=> (completed_at is none)`
    /// invariant named throughout the design. Used by `Store` test fakes
    /// and by property tests; the real invariant is also enforced by a
    /// Postgres `CHECK` constraint in the production schema.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        (self.status == RunStatus::InProgress) == self.completed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_kind_wire_names_match_persistence_layout() {
        assert_eq!(
            IngestKind::TwitterioApiUserFollowers.as_str(),
            "twitterio_api_user_followers"
        );
        assert_eq!(
            IngestKind::IftttWebhookNewFollow.as_str(),
            "ifttt_webhook_new_follow"
        );
    }

    fn run(status: RunStatus, completed_at: Option<DateTime<Utc>>) -> RunCommon {
        RunCommon {
            ingest_event_id: IngestEventId(1),
            target_user_id: UserId(1),
            status,
            sync_mode: SyncMode::Incremental,
            cursor_exhausted: false,
            last_api_status: None,
            last_api_error: None,
            last_snapshot: None,
            started_at: Utc::now(),
            completed_at,
        }
    }

    #[test]
    fn invariant_holds_for_in_progress_without_completed_at() {
        assert!(run(RunStatus::InProgress, None).invariant_holds());
    }

    #[test]
    fn invariant_holds_for_success_with_completed_at() {
        assert!(run(RunStatus::Success, Some(Utc::now())).invariant_holds());
    }

    #[test]
    fn invariant_violated_when_in_progress_has_completed_at() {
        assert!(!run(RunStatus::InProgress, Some(Utc::now())).invariant_holds());
    }

    #[test]
    fn invariant_violated_when_success_missing_completed_at() {
        assert!(!run(RunStatus::Success, None).invariant_holds());
    }
}
