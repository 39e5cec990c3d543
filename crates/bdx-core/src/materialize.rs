// SPDX-License-Identifier: MIT OR Apache-2.0
//! Materializations, membership snapshots, enter/exit events, and planner
//! events.

use crate::asset::AssetSlug;
use crate::ids::{AssetInstanceId, ItemId, MaterializationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a materialization was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// A root instance was due for its scheduled pass.
    RootScheduled,
    /// An enabled fanout root expanded to this (new or existing) instance.
    FanoutExpansion,
    /// A dependent instance required this one to materialize first.
    DependencyRequest,
    /// An operator explicitly requested it via the CLI.
    Manual,
}

/// Lifecycle status of an `AssetMaterialization` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationStatus {
    /// Row inserted; `completed_at` is `None`.
    InProgress,
    /// Membership computed and snapshot replaced successfully.
    Success,
    /// Failed; `error_payload` is set.
    Error,
}

/// A single attempt (successful or not) to materialize one asset instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMaterialization {
    /// Primary key.
    pub id: MaterializationId,
    /// The instance this materialization belongs to.
    pub asset_instance_id: AssetInstanceId,
    /// Denormalized slug, for querying without a join.
    pub asset_slug: AssetSlug,
    /// Version of the inputs-hash algorithm used.
    pub inputs_hash_version: i32,
    /// Hex-encoded inputs hash.
    pub inputs_hash: String,
    /// Version of the dependency-revisions-hash algorithm used.
    pub dependency_revisions_hash_version: i32,
    /// Hex-encoded dependency-revisions hash.
    pub dependency_revisions_hash: String,
    /// Monotonically nondecreasing revision counter for this instance;
    /// increments by exactly 1 when membership changed vs. the previous
    /// successful materialization, else repeats it.
    pub output_revision: i64,
    /// Current status.
    pub status: MaterializationStatus,
    /// Why this materialization was attempted.
    pub trigger_reason: TriggerReason,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished; `None` iff `status == InProgress`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Structured error, set only on `status == Error`.
    pub error_payload: Option<bdx_error::ErrorPayload>,
}

impl AssetMaterialization {
    /// Enforce the `(status == InProgress) <=> (completed_at is none)`
    /// invariant named throughout the design.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        (self.status == MaterializationStatus::InProgress) == self.completed_at.is_none()
    }
}

/// A dependency edge: `materialization_id` depends on
/// `dependency_materialization_id`, pinned at the revision it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent materialization.
    pub materialization_id: MaterializationId,
    /// The materialization it depends on.
    pub dependency_materialization_id: MaterializationId,
}

/// A request edge: `materialization_id` requested ingest or a nested
/// compute on behalf of `requested_by_materialization_id` (used to
/// attribute shared ingest, e.g. a post corpus's per-member posts sync
/// requested by the corpus materialization itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEdge {
    /// The materialization that issued the request.
    pub requested_by_materialization_id: MaterializationId,
    /// The materialization that fulfilled it, if the request was itself a
    /// nested compute rather than a bare ingest call.
    pub fulfilled_by_materialization_id: Option<MaterializationId>,
}

/// One row of the membership snapshot under a checkpoint materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInstanceMembership {
    /// The instance this membership row belongs to.
    pub instance_id: AssetInstanceId,
    /// The member item.
    pub item_id: ItemId,
    /// The materialization whose snapshot this row is current under.
    pub checkpoint_materialization_id: MaterializationId,
}

/// An item entering an instance's membership at a given materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEnterEvent {
    /// The materialization at which this item entered.
    pub materialization_id: MaterializationId,
    /// The item that entered.
    pub item_id: ItemId,
    /// `true` iff this item has never appeared in this instance's
    /// membership before (vs. re-entering after a prior exit).
    pub is_first_appearance: bool,
}

/// An item exiting an instance's membership at a given materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetExitEvent {
    /// The materialization at which this item exited.
    pub materialization_id: MaterializationId,
    /// The item that exited.
    pub item_id: ItemId,
}

/// Outcome the planner recorded for one instance on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerDecision {
    /// A new materialization was produced.
    Materialized,
    /// The materialization key matched the checkpoint; nothing written.
    ShortCircuited,
    /// An advisory lock was held or a prerequisite wasn't ready; retry next
    /// tick.
    Deferred,
    /// The instance was not due, or its root/fanout root is disabled.
    Skipped,
    /// `validate_inputs` returned a warning; the instance still
    /// materialized.
    ValidationWarning,
    /// `validate_inputs` returned an error; the instance was skipped.
    ValidationError,
    /// Materialization attempted and failed.
    Error,
}

/// One planner decision for one instance on one tick, kept for operator
/// observability and for the `worker tick` command's summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerEvent {
    /// Primary key; assigned by the store on insert.
    pub id: i64,
    /// The instance this decision concerns.
    pub asset_instance_id: AssetInstanceId,
    /// Opaque identifier grouping every event from one planner tick.
    pub tick_id: String,
    /// The decision reached.
    pub decision: PlannerDecision,
    /// Human-readable detail (short-circuit cause, validation message,
    /// error summary, ...).
    pub reason: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materialization(status: MaterializationStatus, completed_at: Option<DateTime<Utc>>) -> AssetMaterialization {
        AssetMaterialization {
            id: MaterializationId(1),
            asset_instance_id: AssetInstanceId(1),
            asset_slug: AssetSlug::SegmentFollowers,
            inputs_hash_version: 1,
            inputs_hash: "a".repeat(64),
            dependency_revisions_hash_version: 1,
            dependency_revisions_hash: "b".repeat(64),
            output_revision: 0,
            status,
            trigger_reason: TriggerReason::RootScheduled,
            started_at: Utc::now(),
            completed_at,
            error_payload: None,
        }
    }

    #[test]
    fn invariant_holds_for_in_progress_without_completed_at() {
        assert!(materialization(MaterializationStatus::InProgress, None).invariant_holds());
    }

    #[test]
    fn invariant_violated_when_success_missing_completed_at() {
        assert!(!materialization(MaterializationStatus::Success, None).invariant_holds());
    }

    #[test]
    fn invariant_violated_when_in_progress_has_completed_at() {
        assert!(!materialization(MaterializationStatus::InProgress, Some(Utc::now())).invariant_holds());
    }
}
