// SPDX-License-Identifier: MIT OR Apache-2.0
//! Users, follow edges, posts, and handle history.

use crate::ids::{PostId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A social-graph user as last observed by ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Provider-assigned user id; stable across handle changes.
    pub id: UserId,
    /// Current display handle, or `None` if the user has no handle (rare,
    /// or the account was suspended and the provider stopped returning
    /// one).
    pub handle: Option<String>,
    /// Lowercased `handle`, used for the at-most-one-user-per-handle
    /// uniqueness constraint. `None` iff `handle` is `None`.
    pub handle_norm: Option<String>,
    /// Soft-delete flag; `true` once the provider reports the account
    /// gone or it was superseded by a handle-theft upsert.
    pub is_deleted: bool,
    /// The `IngestEvent` that last wrote this row, if any.
    pub last_ingest_event_id: Option<crate::ids::IngestEventId>,
    /// Last-write timestamp.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Normalize a handle the way the store does: lowercase, no leading
    /// `@`. Returns `None` for an empty or all-whitespace handle.
    #[must_use]
    pub fn normalize_handle(handle: &str) -> Option<String> {
        let trimmed = handle.trim().trim_start_matches('@');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_lowercase())
        }
    }
}

/// A directed follow edge: `follower_id` follows `target_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    /// The user being followed.
    pub target_id: UserId,
    /// The user doing the following.
    pub follower_id: UserId,
    /// Soft-delete flag; `true` once a full-refresh reconciliation no
    /// longer observes the edge. Edges are revived, never re-created, when
    /// they reappear.
    pub is_deleted: bool,
}

/// A post as last observed by ingest. Author and post time are immutable
/// once written — a conflicting upsert keeps the original values and only
/// updates mutable fields (text, lang, soft-delete, raw payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Provider-assigned post id.
    pub id: PostId,
    /// Author of the post; immutable after first insert.
    pub author_id: UserId,
    /// Time the post was published upstream; immutable after first insert.
    pub posted_at: DateTime<Utc>,
    /// Post body text.
    pub text: String,
    /// BCP-47-ish language tag as reported by the provider, if any.
    pub lang: Option<String>,
    /// Raw upstream payload, retained for forward-compatible reprocessing.
    pub raw_payload: serde_json::Value,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

/// One row of a user's handle-change history, written by the handle-theft
/// upsert contract.
///
/// A "theft" writes two rows in the same transaction: one for the user who
/// lost the handle (`new_handle == ""`) and one for the user who gained it
/// (`old_handle` = whatever they held before, possibly `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleHistoryEntry {
    /// The user whose handle changed.
    pub user_id: UserId,
    /// The handle they held before, if any.
    pub old_handle: Option<String>,
    /// The handle they hold now. Empty string signals "handle was seized
    /// by another user", distinct from `None` which means "never had one".
    pub new_handle: String,
    /// When the change was recorded.
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handle_lowercases_and_strips_at() {
        assert_eq!(User::normalize_handle("@Alice"), Some("alice".to_string()));
        assert_eq!(User::normalize_handle("BOB"), Some("bob".to_string()));
        assert_eq!(User::normalize_handle("   "), None);
        assert_eq!(User::normalize_handle(""), None);
    }
}
