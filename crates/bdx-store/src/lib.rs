// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Persistence facade over the birdex domain model.
//!
//! [`Store`] is a trait object boundary (`#[async_trait]`) so the engine
//! and resolver can be exercised in tests against [`mem::MemStore`], an
//! in-memory fake, without a live Postgres instance. [`pg::PgStore`] is
//! the production implementation; its SQL text is hand-written inline in
//! each method, no query builder, because the composite-key upserts and
//! advisory-lock calls are load-bearing enough that a builder would
//! obscure them.

/// In-memory `Store` implementation, built for tests.
pub mod mem;
/// Postgres-backed `Store` implementation.
pub mod pg;

use async_trait::async_trait;
use bdx_core::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceFanoutRootId, AssetInstanceId,
    AssetInstanceMembership, AssetInstanceRoot, AssetInstanceRootId, AssetMaterialization,
    AssetParams, AssetParamsId, AssetParamsValue, AssetSlug, DependencyEdge, FanoutMode,
    FollowEdge, FollowersRun, FollowingsRun, HandleHistoryEntry, IngestEvent, IngestEventId,
    IngestKind, ItemId, MaterializationId, MaterializationStatus, PlannerDecision, Post, PostId,
    PostsRun, RequestEdge, RequestSnapshot, RunStatus, SyncMode, TriggerReason, User, UserId,
};
use bdx_error::BdxError;
use chrono::{DateTime, Utc};

pub use pg::PgStore;

/// Inputs to [`Store::upsert_user`].
#[derive(Debug, Clone, PartialEq)]
pub struct UserUpsert {
    /// Provider-assigned user id.
    pub id: UserId,
    /// Current display handle, or `None`.
    pub handle: Option<String>,
    /// The ingest event performing this write.
    pub ingest_event_id: Option<IngestEventId>,
}

/// Outcome of a [`Store::upsert_user`] call, reporting any handle-theft
/// history rows written alongside the upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertUserOutcome {
    /// The user row as it stands after the upsert.
    pub user: User,
    /// History rows written by a handle-theft, if one occurred.
    pub handle_history: Vec<HandleHistoryEntry>,
}

/// Inputs to [`Store::reconcile_follows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileFollowsOutcome {
    /// Edges that became active (newly created or revived).
    pub activated: usize,
    /// Edges soft-deleted because they were missing from a full-refresh set.
    pub deactivated: usize,
}

/// Inputs to [`Store::get_or_create_asset_params`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamsKey {
    /// The slug the params belong to.
    pub asset_slug: AssetSlug,
    /// Hex-encoded params hash.
    pub params_hash: String,
    /// Version of the params-hash algorithm.
    pub params_hash_version: i32,
    /// Typed fields to store if this key does not already exist.
    pub value: AssetParamsValue,
}

/// A dependency requirement the planner asks the resolver to satisfy
/// before computing a target instance's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequirement {
    /// Kind of ingest required.
    pub kind: IngestKind,
    /// The user this requirement targets.
    pub target_user_id: UserId,
    /// How fresh the latest successful run must be, in milliseconds.
    pub freshness_ms: i64,
    /// If set, attribute this ingest to the given materialization for
    /// lineage (used by `post_corpus_for_segment`'s per-member requests).
    pub requested_by_materialization_id: Option<MaterializationId>,
}

/// Fields needed to create a new sync-run row via
/// [`Store::start_ingest_run`].
#[derive(Debug, Clone, PartialEq)]
pub struct StartRunInput {
    /// Kind of ingest starting.
    pub kind: IngestKind,
    /// The user this run targets.
    pub target_user_id: UserId,
    /// Reconciliation mode this run uses.
    pub sync_mode: SyncMode,
}

/// Terminal update applied to a sync-run row via
/// [`Store::complete_ingest_run`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteRunInput {
    /// Final status; must not be `InProgress`.
    pub status: RunStatus,
    /// Whether the upstream cursor was exhausted.
    pub cursor_exhausted: bool,
    /// Last HTTP status code observed, if any call was made.
    pub last_api_status: Option<u16>,
    /// Error message, set only on `status == Error`.
    pub last_api_error: Option<String>,
    /// Last request/response snapshot captured.
    pub last_snapshot: Option<RequestSnapshot>,
    /// Posts-only watermark; ignored for followers/followings runs.
    pub synced_since: Option<DateTime<Utc>>,
}

/// The latest run recorded for one `(kind, target)` pair, used by the
/// resolver to decide freshness and sync mode.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestRun {
    /// Parent ingest event id.
    pub ingest_event_id: IngestEventId,
    /// Status of the run.
    pub status: RunStatus,
    /// When the run completed, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Reconciliation mode the run used.
    pub sync_mode: SyncMode,
}

/// Inputs to [`Store::begin_materialization`].
#[derive(Debug, Clone, PartialEq)]
pub struct BeginMaterializationInput {
    /// The instance being materialized.
    pub asset_instance_id: AssetInstanceId,
    /// Denormalized slug.
    pub asset_slug: AssetSlug,
    /// Version of the inputs-hash algorithm used.
    pub inputs_hash_version: i32,
    /// Hex-encoded inputs hash.
    pub inputs_hash: String,
    /// Version of the dependency-revisions-hash algorithm used.
    pub dependency_revisions_hash_version: i32,
    /// Hex-encoded dependency-revisions hash.
    pub dependency_revisions_hash: String,
    /// Why this materialization was attempted.
    pub trigger_reason: TriggerReason,
}

/// Inputs to [`Store::complete_materialization`].
#[derive(Debug, Clone)]
pub struct CompleteMaterializationInput {
    /// Members computed for this materialization, sorted ascending,
    /// deduplicated.
    pub membership: Vec<ItemId>,
    /// Dependency materializations this one pinned.
    pub dependency_edges: Vec<MaterializationId>,
    /// Materializations this one requested ingest or nested computes on
    /// behalf of.
    pub request_edges: Vec<RequestEdge>,
}

/// Membership diff produced by a successful materialization, used to
/// write enter/exit events and decide whether `output_revision` advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Items present now but not in the prior checkpoint.
    pub entered: Vec<ItemId>,
    /// Items present in the prior checkpoint but not now.
    pub exited: Vec<ItemId>,
    /// Items entering for the very first time in this instance's history.
    pub first_appearances: Vec<ItemId>,
}

impl MembershipDiff {
    /// `true` iff membership actually changed — an empty diff means the
    /// new materialization's `output_revision` must repeat the prior one.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.entered.is_empty() || !self.exited.is_empty()
    }
}

/// Fields needed to write one [`Store::record_planner_event`] row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPlannerEventInput {
    /// The instance this decision concerns.
    pub asset_instance_id: AssetInstanceId,
    /// Opaque identifier grouping every event from one planner tick.
    pub tick_id: String,
    /// The decision reached.
    pub decision: PlannerDecision,
    /// Human-readable detail (short-circuit cause, validation message,
    /// error summary, ...).
    pub reason: String,
}

/// Errors a `Store` implementation can raise beyond the unified
/// [`BdxError`] taxonomy — reserved for storage-layer invariant
/// violations that should never occur given a correct caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Wraps a [`BdxError`] raised by the underlying storage.
    #[error(transparent)]
    Bdx(#[from] BdxError),
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// A held advisory lock, released by calling [`LockGuard::release`] on
/// every exit path. A guard dropped without an explicit release is not a
/// correctness bug — the underlying session-scoped lock still falls away
/// once its connection closes — but it is logged, since it means a caller
/// missed a cleanup path.
#[async_trait]
pub trait LockGuard: Send {
    /// Release the lock.
    async fn release(self: Box<Self>);
}

/// Persistence facade over the birdex domain model.
#[async_trait]
pub trait Store: Send + Sync {
    // -- advisory locks ---------------------------------------------------

    /// Attempt to acquire a process-cluster-wide advisory lock keyed by
    /// `key` (the caller hashes a string key into an `i64` before calling,
    /// matching the `hashtext(...)` scheme used throughout the design).
    /// Returns `None` immediately if already held elsewhere; never blocks.
    async fn try_advisory_lock(&self, key: i64) -> Result<Option<Box<dyn LockGuard>>, StoreError>;

    // -- users / follows / posts -------------------------------------

    /// Upsert a user, applying handle-theft semantics: any other user
    /// holding the same normalized handle has it cleared, with history
    /// rows written for both parties, all in one transaction.
    async fn upsert_user(&self, input: UserUpsert) -> Result<UpsertUserOutcome, StoreError>;

    /// Reconcile `target_id`'s incoming follow edges (its followers)
    /// against `follower_ids`. In `FullRefresh` mode, edges missing from
    /// `follower_ids` are soft-deleted; in `Incremental` mode only
    /// upserts happen.
    async fn reconcile_followers(
        &self,
        target_id: UserId,
        follower_ids: &[UserId],
        mode: SyncMode,
    ) -> Result<ReconcileFollowsOutcome, StoreError>;

    /// Reconcile `follower_id`'s outgoing follow edges (who it follows)
    /// against `target_ids`, symmetric with [`Store::reconcile_followers`].
    async fn reconcile_followings(
        &self,
        follower_id: UserId,
        target_ids: &[UserId],
        mode: SyncMode,
    ) -> Result<ReconcileFollowsOutcome, StoreError>;

    /// Upsert a post. Author and post time are immutable after first
    /// insert; a conflicting upsert only updates mutable fields.
    async fn upsert_post(&self, post: Post) -> Result<Post, StoreError>;

    /// Active (non-soft-deleted) follow edges into `target_id`.
    async fn active_followers(&self, target_id: UserId) -> Result<Vec<FollowEdge>, StoreError>;

    /// Active (non-soft-deleted) follow edges out of `follower_id`.
    async fn active_followings(&self, follower_id: UserId) -> Result<Vec<FollowEdge>, StoreError>;

    /// Active posts authored by any of `author_ids`.
    async fn active_posts_by_authors(&self, author_ids: &[UserId]) -> Result<Vec<Post>, StoreError>;

    // -- ingest runs ----------------------------------------------------

    /// Create a parent `IngestEvent` plus the kind-specific child row,
    /// both `status=in_progress`, in one transaction.
    async fn start_ingest_run(&self, input: StartRunInput) -> Result<IngestEventId, StoreError>;

    /// Transition a run to a terminal status, setting `completed_at`.
    async fn complete_ingest_run(&self, ingest_event_id: IngestEventId, input: CompleteRunInput) -> Result<(), StoreError>;

    /// Record the in-flight snapshot of a run still in progress, without
    /// changing its status — used between pages of a long sync.
    async fn record_ingest_progress(&self, ingest_event_id: IngestEventId, snapshot: RequestSnapshot) -> Result<(), StoreError>;

    /// The most recent run (any status) for a `(kind, target)` pair.
    async fn latest_run(&self, kind: IngestKind, target_user_id: UserId) -> Result<Option<LatestRun>, StoreError>;

    /// Whether any run for `(kind, target)` has ever completed
    /// successfully in `FullRefresh` mode.
    async fn has_successful_full_refresh(&self, kind: IngestKind, target_user_id: UserId) -> Result<bool, StoreError>;

    // -- asset identity ---------------------------------------------------

    /// Look up an `AssetParams` row by its unique key, creating one if
    /// absent.
    async fn get_or_create_asset_params(&self, key: ParamsKey) -> Result<AssetParams, StoreError>;

    /// Look up an `AssetInstance` by `params_id`, creating one if absent.
    async fn get_or_create_asset_instance(&self, params_id: AssetParamsId) -> Result<AssetInstance, StoreError>;

    /// Look up an `AssetInstance` by its own id, for planner enumeration
    /// over roots and fanout roots, which only record the instance id.
    async fn get_asset_instance(&self, instance_id: AssetInstanceId) -> Result<AssetInstance, StoreError>;

    /// Look up an `AssetParams` row by id, for recovering the typed value
    /// and slug an instance was created from.
    async fn get_asset_params(&self, params_id: AssetParamsId) -> Result<AssetParams, StoreError>;

    /// Every enabled root, for planner enumeration.
    async fn enabled_roots(&self) -> Result<Vec<AssetInstanceRoot>, StoreError>;

    /// Every enabled fanout root, for planner enumeration.
    async fn enabled_fanout_roots(&self) -> Result<Vec<AssetInstanceFanoutRoot>, StoreError>;

    /// Insert a root row, or update its existing row if one already
    /// exists for `instance_id`. Returns the row's id.
    async fn upsert_root(&self, instance_id: AssetInstanceId, disabled: bool) -> Result<AssetInstanceRootId, StoreError>;

    /// Disable a root by id. Idempotent.
    async fn disable_root(&self, root_id: AssetInstanceRootId) -> Result<(), StoreError>;

    /// Insert a fanout root row, or update its existing row if one
    /// already exists for `(source_instance_id, target_asset_slug,
    /// fanout_mode)`. Returns the row's id.
    async fn upsert_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
        fanout_mode: FanoutMode,
        disabled: bool,
    ) -> Result<AssetInstanceFanoutRootId, StoreError>;

    /// Disable a fanout root by id. Idempotent.
    async fn disable_fanout_root(&self, fanout_root_id: AssetInstanceFanoutRootId) -> Result<(), StoreError>;

    // -- materializations -------------------------------------------------

    /// The most recent successful materialization of an instance, if any.
    async fn latest_successful_materialization(&self, instance_id: AssetInstanceId) -> Result<Option<AssetMaterialization>, StoreError>;

    /// Insert a new `in_progress` materialization row.
    async fn begin_materialization(&self, input: BeginMaterializationInput) -> Result<MaterializationId, StoreError>;

    /// Complete a materialization successfully: compute the membership
    /// diff against the prior checkpoint, write enter/exit events,
    /// replace the membership snapshot, insert dependency/request edges,
    /// set `output_revision`, and advance the instance's checkpoint — all
    /// atomically.
    async fn complete_materialization(
        &self,
        materialization_id: MaterializationId,
        input: CompleteMaterializationInput,
    ) -> Result<MembershipDiff, StoreError>;

    /// Fail a materialization, recording the error payload.
    async fn fail_materialization(&self, materialization_id: MaterializationId, error: bdx_error::ErrorPayload) -> Result<(), StoreError>;

    /// Current membership snapshot for an instance.
    async fn current_membership(&self, instance_id: AssetInstanceId) -> Result<Vec<AssetInstanceMembership>, StoreError>;

    /// Membership as it stood at `target_materialization_id`, reconstructed
    /// by replaying enter/exit events from the instance's earliest
    /// successful materialization forward to the target.
    async fn membership_as_of(&self, instance_id: AssetInstanceId, target_materialization_id: MaterializationId) -> Result<Vec<ItemId>, StoreError>;

    /// The dependency materializations pinned by `materialization_id`.
    async fn dependency_edges(&self, materialization_id: MaterializationId) -> Result<Vec<DependencyEdge>, StoreError>;

    // -- planner observability --------------------------------------------

    /// Record one planner decision for one instance on one tick. Every
    /// terminal outcome the planner reaches for an instance writes exactly
    /// one of these.
    async fn record_planner_event(&self, input: RecordPlannerEventInput) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_diff_changed_is_false_for_empty_diff() {
        let diff = MembershipDiff {
            entered: vec![],
            exited: vec![],
            first_appearances: vec![],
        };
        assert!(!diff.changed());
    }

    #[test]
    fn membership_diff_changed_is_true_when_items_entered() {
        let diff = MembershipDiff {
            entered: vec![ItemId::user(UserId(1))],
            exited: vec![],
            first_appearances: vec![ItemId::user(UserId(1))],
        };
        assert!(diff.changed());
    }
}
