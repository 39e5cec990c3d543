// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory [`Store`] implementation, built for tests.
//!
//! Every method locks a single [`std::sync::Mutex`] for the duration of
//! the call. No method holds the lock across an `.await` point, so this
//! is safe despite using a sync mutex inside async functions — there are
//! no real suspension points to begin with, only plain data manipulation.

use crate::{
    BeginMaterializationInput, CompleteMaterializationInput, CompleteRunInput, LatestRun,
    MembershipDiff, ParamsKey, ReconcileFollowsOutcome, RecordPlannerEventInput, StartRunInput,
    Store, StoreError, UpsertUserOutcome, UserUpsert,
};
use async_trait::async_trait;
use bdx_core::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceFanoutRootId, AssetInstanceId,
    AssetInstanceMembership, AssetInstanceRoot, AssetInstanceRootId, AssetMaterialization,
    AssetParams, AssetParamsId, AssetSlug, DependencyEdge, FanoutMode, FollowEdge,
    HandleHistoryEntry, IngestEventId, IngestKind, ItemId, MaterializationId,
    MaterializationStatus, PlannerEvent, Post, PostId, RequestEdge, RequestSnapshot, RunStatus,
    SyncMode, TriggerReason, User, UserId,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct RunRow {
    kind: IngestKind,
    target_user_id: UserId,
    status: RunStatus,
    sync_mode: SyncMode,
    cursor_exhausted: bool,
    completed_at: Option<chrono::DateTime<Utc>>,
    #[allow(dead_code)]
    last_snapshot: Option<RequestSnapshot>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    handle_index: HashMap<String, UserId>,
    handle_history: Vec<HandleHistoryEntry>,
    follow_edges: HashMap<(UserId, UserId), FollowEdge>,
    posts: HashMap<PostId, Post>,

    next_ingest_event_id: i64,
    runs: HashMap<IngestEventId, RunRow>,

    next_params_id: i64,
    params: HashMap<AssetParamsId, AssetParams>,
    params_index: HashMap<(AssetSlug, String, i32), AssetParamsId>,

    next_instance_id: i64,
    instances: HashMap<AssetInstanceId, AssetInstance>,
    instance_by_params: HashMap<AssetParamsId, AssetInstanceId>,

    next_root_id: i64,
    roots: HashMap<AssetInstanceRootId, AssetInstanceRoot>,
    root_by_instance: HashMap<AssetInstanceId, AssetInstanceRootId>,

    next_fanout_root_id: i64,
    fanout_roots: HashMap<AssetInstanceFanoutRootId, AssetInstanceFanoutRoot>,
    fanout_index: HashMap<(AssetInstanceId, AssetSlug, FanoutMode), AssetInstanceFanoutRootId>,

    next_materialization_id: i64,
    materializations: HashMap<MaterializationId, AssetMaterialization>,
    successful_history: HashMap<AssetInstanceId, Vec<MaterializationId>>,
    dependency_edges: Vec<DependencyEdge>,
    request_edges: Vec<RequestEdge>,
    enters: HashMap<MaterializationId, Vec<(ItemId, bool)>>,
    exits: HashMap<MaterializationId, Vec<ItemId>>,
    membership: HashMap<AssetInstanceId, BTreeMap<ItemId, MaterializationId>>,

    next_planner_event_id: i64,
    planner_events: Vec<PlannerEvent>,
}

/// In-memory [`Store`] for exercising the resolver and engine without a
/// live Postgres instance.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
    advisory_locks: std::sync::Arc<Mutex<HashSet<i64>>>,
}

struct MemLockGuard {
    locks: std::sync::Arc<Mutex<HashSet<i64>>>,
    key: i64,
}

#[async_trait]
impl crate::LockGuard for MemLockGuard {
    async fn release(self: Box<Self>) {
        self.locks.lock().expect("mem store poisoned").remove(&self.key);
    }
}

impl MemStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every planner event recorded so far, oldest first. Test-only
    /// accessor; `Store` itself has no "list planner events" method since
    /// production readers query Postgres directly.
    #[must_use]
    pub fn planner_events(&self) -> Vec<PlannerEvent> {
        self.inner.lock().expect("mem store poisoned").planner_events.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn try_advisory_lock(&self, key: i64) -> Result<Option<Box<dyn crate::LockGuard>>, StoreError> {
        let mut locks = self.advisory_locks.lock().expect("mem store poisoned");
        if locks.insert(key) {
            Ok(Some(Box::new(MemLockGuard {
                locks: self.advisory_locks.clone(),
                key,
            })))
        } else {
            Ok(None)
        }
    }

    async fn upsert_user(&self, input: UserUpsert) -> Result<UpsertUserOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let handle_norm = input.handle.as_deref().and_then(User::normalize_handle);

        let mut history = Vec::new();
        if let Some(ref norm) = handle_norm {
            if let Some(&holder_id) = inner.handle_index.get(norm) {
                if holder_id != input.id {
                    let now = Utc::now();
                    if let Some(holder) = inner.users.get_mut(&holder_id) {
                        let old_handle = holder.handle.clone();
                        holder.handle = None;
                        holder.handle_norm = None;
                        holder.updated_at = now;
                        history.push(HandleHistoryEntry {
                            user_id: holder_id,
                            old_handle,
                            new_handle: String::new(),
                            changed_at: now,
                        });
                    }
                    inner.handle_index.remove(norm);
                }
            }
        }

        let now = Utc::now();
        let previous = inner.users.get(&input.id).cloned();
        if let Some(old_norm) = previous.as_ref().and_then(|u| u.handle_norm.clone()) {
            if Some(&old_norm) != handle_norm.as_ref() {
                inner.handle_index.remove(&old_norm);
            }
        }
        if let Some(ref norm) = handle_norm {
            inner.handle_index.insert(norm.clone(), input.id);
        }

        let handle_changed = previous.as_ref().map(|u| &u.handle) != Some(&input.handle);
        if handle_changed {
            if let Some(ref new_handle) = input.handle {
                history.push(HandleHistoryEntry {
                    user_id: input.id,
                    old_handle: previous.as_ref().and_then(|u| u.handle.clone()),
                    new_handle: new_handle.clone(),
                    changed_at: now,
                });
            }
        }

        let user = User {
            id: input.id,
            handle: input.handle,
            handle_norm,
            is_deleted: false,
            last_ingest_event_id: input.ingest_event_id,
            updated_at: now,
        };
        inner.users.insert(input.id, user.clone());
        inner.handle_history.extend(history.clone());

        Ok(UpsertUserOutcome { user, handle_history: history })
    }

    async fn reconcile_followers(&self, target_id: UserId, follower_ids: &[UserId], mode: SyncMode) -> Result<ReconcileFollowsOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let wanted: HashSet<UserId> = follower_ids.iter().copied().collect();
        let mut activated = 0usize;
        let mut deactivated = 0usize;

        for &follower_id in &wanted {
            let key = (target_id, follower_id);
            let entry = inner.follow_edges.entry(key).or_insert(FollowEdge {
                target_id,
                follower_id,
                is_deleted: true,
            });
            if entry.is_deleted {
                entry.is_deleted = false;
                activated += 1;
            }
        }

        if mode == SyncMode::FullRefresh {
            for ((t, f), edge) in inner.follow_edges.iter_mut() {
                if *t == target_id && !wanted.contains(f) && !edge.is_deleted {
                    edge.is_deleted = true;
                    deactivated += 1;
                }
            }
        }

        Ok(ReconcileFollowsOutcome { activated, deactivated })
    }

    async fn reconcile_followings(&self, follower_id: UserId, target_ids: &[UserId], mode: SyncMode) -> Result<ReconcileFollowsOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let wanted: HashSet<UserId> = target_ids.iter().copied().collect();
        let mut activated = 0usize;
        let mut deactivated = 0usize;

        for &target_id in &wanted {
            let key = (target_id, follower_id);
            let entry = inner.follow_edges.entry(key).or_insert(FollowEdge {
                target_id,
                follower_id,
                is_deleted: true,
            });
            if entry.is_deleted {
                entry.is_deleted = false;
                activated += 1;
            }
        }

        if mode == SyncMode::FullRefresh {
            for ((t, f), edge) in inner.follow_edges.iter_mut() {
                if *f == follower_id && !wanted.contains(t) && !edge.is_deleted {
                    edge.is_deleted = true;
                    deactivated += 1;
                }
            }
        }

        Ok(ReconcileFollowsOutcome { activated, deactivated })
    }

    async fn upsert_post(&self, post: Post) -> Result<Post, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let stored = inner.posts.entry(post.id).or_insert_with(|| post.clone());
        stored.text = post.text;
        stored.lang = post.lang;
        stored.raw_payload = post.raw_payload;
        stored.is_deleted = post.is_deleted;
        Ok(stored.clone())
    }

    async fn active_followers(&self, target_id: UserId) -> Result<Vec<FollowEdge>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner
            .follow_edges
            .values()
            .filter(|e| e.target_id == target_id && !e.is_deleted)
            .copied()
            .collect())
    }

    async fn active_followings(&self, follower_id: UserId) -> Result<Vec<FollowEdge>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner
            .follow_edges
            .values()
            .filter(|e| e.follower_id == follower_id && !e.is_deleted)
            .copied()
            .collect())
    }

    async fn active_posts_by_authors(&self, author_ids: &[UserId]) -> Result<Vec<Post>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        let authors: HashSet<UserId> = author_ids.iter().copied().collect();
        Ok(inner
            .posts
            .values()
            .filter(|p| !p.is_deleted && authors.contains(&p.author_id))
            .cloned()
            .collect())
    }

    async fn start_ingest_run(&self, input: StartRunInput) -> Result<IngestEventId, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        inner.next_ingest_event_id += 1;
        let id = IngestEventId(inner.next_ingest_event_id);
        inner.runs.insert(
            id,
            RunRow {
                kind: input.kind,
                target_user_id: input.target_user_id,
                status: RunStatus::InProgress,
                sync_mode: input.sync_mode,
                cursor_exhausted: false,
                completed_at: None,
                last_snapshot: None,
            },
        );
        Ok(id)
    }

    async fn complete_ingest_run(&self, ingest_event_id: IngestEventId, input: CompleteRunInput) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let row = inner
            .runs
            .get_mut(&ingest_event_id)
            .ok_or_else(|| StoreError::NotFound(format!("ingest event {ingest_event_id}")))?;
        row.status = input.status;
        row.cursor_exhausted = input.cursor_exhausted;
        row.completed_at = Some(Utc::now());
        row.last_snapshot = input.last_snapshot;
        Ok(())
    }

    async fn record_ingest_progress(&self, ingest_event_id: IngestEventId, snapshot: RequestSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let row = inner
            .runs
            .get_mut(&ingest_event_id)
            .ok_or_else(|| StoreError::NotFound(format!("ingest event {ingest_event_id}")))?;
        row.last_snapshot = Some(snapshot);
        Ok(())
    }

    async fn latest_run(&self, kind: IngestKind, target_user_id: UserId) -> Result<Option<LatestRun>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        let latest = inner
            .runs
            .iter()
            .filter(|(_, row)| row.kind == kind && row.target_user_id == target_user_id)
            .max_by_key(|(id, _)| id.get());
        Ok(latest.map(|(id, row)| LatestRun {
            ingest_event_id: *id,
            status: row.status,
            completed_at: row.completed_at,
            sync_mode: row.sync_mode,
        }))
    }

    async fn has_successful_full_refresh(&self, kind: IngestKind, target_user_id: UserId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner.runs.values().any(|row| {
            row.kind == kind
                && row.target_user_id == target_user_id
                && row.status == RunStatus::Success
                && row.sync_mode == SyncMode::FullRefresh
        }))
    }

    async fn get_or_create_asset_params(&self, key: ParamsKey) -> Result<AssetParams, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let lookup_key = (key.asset_slug, key.params_hash.clone(), key.params_hash_version);
        if let Some(&id) = inner.params_index.get(&lookup_key) {
            return Ok(inner.params[&id].clone());
        }
        inner.next_params_id += 1;
        let id = AssetParamsId(inner.next_params_id);
        let row = AssetParams {
            id,
            params_hash: key.params_hash,
            params_hash_version: key.params_hash_version,
            value: key.value,
            created_at: Utc::now(),
        };
        inner.params.insert(id, row.clone());
        inner.params_index.insert(lookup_key, id);
        Ok(row)
    }

    async fn get_or_create_asset_instance(&self, params_id: AssetParamsId) -> Result<AssetInstance, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        if let Some(&id) = inner.instance_by_params.get(&params_id) {
            return Ok(inner.instances[&id].clone());
        }
        inner.next_instance_id += 1;
        let id = AssetInstanceId(inner.next_instance_id);
        let row = AssetInstance {
            id,
            params_id,
            checkpoint_materialization_id: None,
            created_at: Utc::now(),
        };
        inner.instances.insert(id, row.clone());
        inner.instance_by_params.insert(params_id, id);
        Ok(row)
    }

    async fn get_asset_instance(&self, instance_id: AssetInstanceId) -> Result<AssetInstance, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        inner
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("asset instance {instance_id}")))
    }

    async fn get_asset_params(&self, params_id: AssetParamsId) -> Result<AssetParams, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        inner
            .params
            .get(&params_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("asset params {params_id}")))
    }

    async fn enabled_roots(&self) -> Result<Vec<AssetInstanceRoot>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner.roots.values().filter(|r| r.disabled_at.is_none()).cloned().collect())
    }

    async fn enabled_fanout_roots(&self) -> Result<Vec<AssetInstanceFanoutRoot>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner.fanout_roots.values().filter(|r| r.disabled_at.is_none()).cloned().collect())
    }

    async fn upsert_root(&self, instance_id: AssetInstanceId, disabled: bool) -> Result<AssetInstanceRootId, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        if let Some(&id) = inner.root_by_instance.get(&instance_id) {
            let row = inner.roots.get_mut(&id).expect("root index out of sync");
            row.disabled_at = if disabled { Some(Utc::now()) } else { None };
            return Ok(id);
        }
        inner.next_root_id += 1;
        let id = AssetInstanceRootId(inner.next_root_id);
        inner.roots.insert(
            id,
            AssetInstanceRoot {
                id,
                instance_id,
                disabled_at: if disabled { Some(Utc::now()) } else { None },
            },
        );
        inner.root_by_instance.insert(instance_id, id);
        Ok(id)
    }

    async fn disable_root(&self, root_id: AssetInstanceRootId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let row = inner
            .roots
            .get_mut(&root_id)
            .ok_or_else(|| StoreError::NotFound(format!("root {root_id}")))?;
        if row.disabled_at.is_none() {
            row.disabled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
        fanout_mode: FanoutMode,
        disabled: bool,
    ) -> Result<AssetInstanceFanoutRootId, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let key = (source_instance_id, target_asset_slug, fanout_mode);
        if let Some(&id) = inner.fanout_index.get(&key) {
            let row = inner.fanout_roots.get_mut(&id).expect("fanout index out of sync");
            row.disabled_at = if disabled { Some(Utc::now()) } else { None };
            return Ok(id);
        }
        inner.next_fanout_root_id += 1;
        let id = AssetInstanceFanoutRootId(inner.next_fanout_root_id);
        inner.fanout_roots.insert(
            id,
            AssetInstanceFanoutRoot {
                id,
                source_instance_id,
                target_asset_slug,
                fanout_mode,
                disabled_at: if disabled { Some(Utc::now()) } else { None },
            },
        );
        inner.fanout_index.insert(key, id);
        Ok(id)
    }

    async fn disable_fanout_root(&self, fanout_root_id: AssetInstanceFanoutRootId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let row = inner
            .fanout_roots
            .get_mut(&fanout_root_id)
            .ok_or_else(|| StoreError::NotFound(format!("fanout root {fanout_root_id}")))?;
        if row.disabled_at.is_none() {
            row.disabled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn latest_successful_materialization(&self, instance_id: AssetInstanceId) -> Result<Option<AssetMaterialization>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        let history = inner.successful_history.get(&instance_id);
        Ok(history
            .and_then(|ids| ids.last())
            .and_then(|id| inner.materializations.get(id))
            .cloned())
    }

    async fn begin_materialization(&self, input: BeginMaterializationInput) -> Result<MaterializationId, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        inner.next_materialization_id += 1;
        let id = MaterializationId(inner.next_materialization_id);
        let prior_revision = inner
            .successful_history
            .get(&input.asset_instance_id)
            .and_then(|ids| ids.last())
            .and_then(|mid| inner.materializations.get(mid))
            .map(|m| m.output_revision)
            .unwrap_or(0);
        inner.materializations.insert(
            id,
            AssetMaterialization {
                id,
                asset_instance_id: input.asset_instance_id,
                asset_slug: input.asset_slug,
                inputs_hash_version: input.inputs_hash_version,
                inputs_hash: input.inputs_hash,
                dependency_revisions_hash_version: input.dependency_revisions_hash_version,
                dependency_revisions_hash: input.dependency_revisions_hash,
                output_revision: prior_revision,
                status: MaterializationStatus::InProgress,
                trigger_reason: input.trigger_reason,
                started_at: Utc::now(),
                completed_at: None,
                error_payload: None,
            },
        );
        Ok(id)
    }

    async fn complete_materialization(&self, materialization_id: MaterializationId, input: CompleteMaterializationInput) -> Result<MembershipDiff, StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let instance_id = inner
            .materializations
            .get(&materialization_id)
            .ok_or_else(|| StoreError::NotFound(format!("materialization {materialization_id}")))?
            .asset_instance_id;

        let prior_members: HashSet<ItemId> = inner
            .membership
            .get(&instance_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        let ever_appeared: HashSet<ItemId> = inner
            .successful_history
            .get(&instance_id)
            .into_iter()
            .flatten()
            .filter_map(|mat_id| inner.enters.get(mat_id))
            .flat_map(|v| v.iter().map(|(item, _)| *item))
            .collect();

        let new_members: HashSet<ItemId> = input.membership.iter().copied().collect();
        let mut entered: Vec<ItemId> = new_members.difference(&prior_members).copied().collect();
        let mut exited: Vec<ItemId> = prior_members.difference(&new_members).copied().collect();
        entered.sort();
        exited.sort();
        let first_appearances: Vec<ItemId> = entered.iter().copied().filter(|item| !ever_appeared.contains(item)).collect();

        let prior_revision = inner.materializations[&materialization_id].output_revision;
        let changed = !entered.is_empty() || !exited.is_empty();
        let output_revision = if changed { prior_revision + 1 } else { prior_revision };

        {
            let entry = inner.enters.entry(materialization_id).or_default();
            for &item in &entered {
                entry.push((item, first_appearances.contains(&item)));
            }
        }
        inner.exits.insert(materialization_id, exited.clone());

        let snapshot = inner.membership.entry(instance_id).or_default();
        for item in &exited {
            snapshot.remove(item);
        }
        for item in &entered {
            snapshot.insert(*item, materialization_id);
        }
        for item in input.membership.iter() {
            snapshot.insert(*item, materialization_id);
        }

        for dep_id in input.dependency_edges {
            inner.dependency_edges.push(DependencyEdge {
                materialization_id,
                dependency_materialization_id: dep_id,
            });
        }
        inner.request_edges.extend(input.request_edges);

        inner.successful_history.entry(instance_id).or_default().push(materialization_id);

        let row = inner.materializations.get_mut(&materialization_id).expect("checked above");
        row.status = MaterializationStatus::Success;
        row.completed_at = Some(Utc::now());
        row.output_revision = output_revision;

        if let Some(instance) = inner.instances.get_mut(&instance_id) {
            instance.checkpoint_materialization_id = Some(materialization_id);
        }

        Ok(MembershipDiff { entered, exited, first_appearances })
    }

    async fn fail_materialization(&self, materialization_id: MaterializationId, error: bdx_error::ErrorPayload) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        let row = inner
            .materializations
            .get_mut(&materialization_id)
            .ok_or_else(|| StoreError::NotFound(format!("materialization {materialization_id}")))?;
        row.status = MaterializationStatus::Error;
        row.completed_at = Some(Utc::now());
        row.error_payload = Some(error);
        Ok(())
    }

    async fn current_membership(&self, instance_id: AssetInstanceId) -> Result<Vec<AssetInstanceMembership>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner
            .membership
            .get(&instance_id)
            .map(|snapshot| {
                snapshot
                    .iter()
                    .map(|(item_id, checkpoint)| AssetInstanceMembership {
                        instance_id,
                        item_id: *item_id,
                        checkpoint_materialization_id: *checkpoint,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn membership_as_of(&self, instance_id: AssetInstanceId, target_materialization_id: MaterializationId) -> Result<Vec<ItemId>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        let history = inner
            .successful_history
            .get(&instance_id)
            .ok_or_else(|| StoreError::NotFound(format!("instance {instance_id}")))?;

        let mut members: BTreeMap<ItemId, ()> = BTreeMap::new();
        for &mat_id in history {
            if let Some(enters) = inner.enters.get(&mat_id) {
                for (item, _) in enters {
                    members.insert(*item, ());
                }
            }
            if let Some(exits) = inner.exits.get(&mat_id) {
                for item in exits {
                    members.remove(item);
                }
            }
            if mat_id == target_materialization_id {
                break;
            }
        }
        Ok(members.into_keys().collect())
    }

    async fn dependency_edges(&self, materialization_id: MaterializationId) -> Result<Vec<DependencyEdge>, StoreError> {
        let inner = self.inner.lock().expect("mem store poisoned");
        Ok(inner
            .dependency_edges
            .iter()
            .filter(|e| e.materialization_id == materialization_id)
            .copied()
            .collect())
    }

    async fn record_planner_event(&self, input: RecordPlannerEventInput) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mem store poisoned");
        inner.next_planner_event_id += 1;
        let id = inner.next_planner_event_id;
        inner.planner_events.push(PlannerEvent {
            id,
            asset_instance_id: input.asset_instance_id,
            tick_id: input.tick_id,
            decision: input.decision,
            reason: input.reason,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
