// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The planner: enumerates due work every tick, resolves each instance's
//! dependency closure bottom-up, and drives `bdx-registry` and
//! `bdx-resolver` through the six-step per-instance materialize algorithm.
//!
//! Dependency resolution recurses through the same per-instance function
//! that drives top-level targets -- a dependency is just another instance,
//! materialized first if its checkpoint doesn't already satisfy the
//! current hashes. A `(slug, params_hash)` cache scoped to one tick means
//! two targets sharing a dependency only compute it once.

use bdx_core::{
    AssetInstanceId, AssetParamsValue, AssetSlug, FanoutMode, MaterializationId, PlannerDecision,
    RequestEdge, TriggerReason,
};
use bdx_error::{BdxError, ErrorPayload};
use bdx_hash::{DependencyRevision, MaterializationKey};
use bdx_registry::{DependencyTarget, Registry, RegistryError, ResolvedDependency, ValidationIssue};
use bdx_resolver::{ResolveOutcome, Resolver};
use bdx_store::{
    BeginMaterializationInput, CompleteMaterializationInput, ParamsKey, RecordPlannerEventInput,
    Store, StoreError,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Default bound on concurrently materializing top-level instances within
/// one tick, overridden by `bdx-config`'s `engine_max_parallel_instances`.
pub const DEFAULT_MAX_PARALLEL_INSTANCES: usize = 1;

fn store_err(err: StoreError) -> BdxError {
    match err {
        StoreError::Bdx(inner) => inner,
        StoreError::NotFound(what) => BdxError::fatal(format!("store row not found: {what}")),
    }
}

fn registry_err(err: &RegistryError) -> BdxError {
    match err {
        RegistryError::MissingDependency(name) => BdxError::fatal(format!("missing resolved dependency '{name}'")),
        RegistryError::Store(inner) => store_err(inner.clone()),
        RegistryError::DuplicateSlug(slug) => BdxError::fatal(format!("duplicate asset slug registered: {slug}")),
        RegistryError::CyclicDependency(detail) => BdxError::fatal(format!("cyclic asset dependency: {detail}")),
    }
}

/// Deterministic lock key for one instance id, folded the same way
/// `bdx-resolver`'s ingest lock keys are: a local FNV-1a fold into an
/// `i64`, namespaced `materialize:` so an instance lock can never collide
/// with an ingest lock's key even though both share Postgres's single
/// advisory-lock keyspace.
fn instance_lock_key(instance_id: AssetInstanceId) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let key = format!("materialize:{}", instance_id.get());
    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// A target instance discovered during work enumeration: either an
/// enabled root, or one item of an enabled fanout root's current
/// membership mapped through `params_from_fanout_item`.
struct Target {
    asset_slug: AssetSlug,
    params: AssetParamsValue,
    trigger_reason: TriggerReason,
}

/// The subset of a successfully resolved instance's state a dependent
/// instance needs, cached within one tick so a shared dependency is only
/// materialized once no matter how many targets reach it.
#[derive(Debug, Clone)]
struct CachedMaterialization {
    instance_id: AssetInstanceId,
    materialization_id: MaterializationId,
    params_hash: String,
    output_revision: i64,
    membership: Vec<bdx_core::ItemId>,
}

type TickCache = Mutex<BTreeMap<(AssetSlug, String), Option<CachedMaterialization>>>;

/// Outcome counts for one `tick()` call, used by the `worker tick` CLI
/// command's human-readable summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSummary {
    /// Opaque identifier grouping every `PlannerEvent` this tick wrote.
    pub tick_id: String,
    /// Instances that wrote a new materialization.
    pub materialized: u64,
    /// Instances whose materialization key matched their checkpoint.
    pub short_circuited: u64,
    /// Instances deferred to the next tick (lock contention or an unready
    /// prerequisite).
    pub deferred: u64,
    /// Instances skipped (unreachable via the engine's own enumeration,
    /// kept for completeness since `PlannerDecision::Skipped` is shared
    /// with other callers of the type).
    pub skipped: u64,
    /// Instances that materialized despite a non-blocking validation issue.
    pub validation_warnings: u64,
    /// Instances skipped due to a blocking validation issue.
    pub validation_errors: u64,
    /// Instances whose materialization failed.
    pub errors: u64,
}

impl TickSummary {
    fn new(tick_id: String) -> Self {
        Self {
            tick_id,
            materialized: 0,
            short_circuited: 0,
            deferred: 0,
            skipped: 0,
            validation_warnings: 0,
            validation_errors: 0,
            errors: 0,
        }
    }

    fn record(&mut self, decision: PlannerDecision) {
        match decision {
            PlannerDecision::Materialized => self.materialized += 1,
            PlannerDecision::ShortCircuited => self.short_circuited += 1,
            PlannerDecision::Deferred => self.deferred += 1,
            PlannerDecision::Skipped => self.skipped += 1,
            PlannerDecision::ValidationWarning => self.validation_warnings += 1,
            PlannerDecision::ValidationError => self.validation_errors += 1,
            PlannerDecision::Error => self.errors += 1,
        }
    }

    /// Total instances that reached a terminal decision this tick.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.materialized
            + self.short_circuited
            + self.deferred
            + self.skipped
            + self.validation_warnings
            + self.validation_errors
            + self.errors
    }
}

/// Drives one planner tick: enumerate due work, resolve each target's
/// dependency closure, materialize what needs it.
pub struct Engine {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    max_parallel_instances: usize,
    tick_counter: AtomicU64,
}

impl Engine {
    /// Build an engine over the given store, registry, and resolver, with
    /// `DEFAULT_MAX_PARALLEL_INSTANCES` top-level concurrency.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, resolver: Arc<Resolver>) -> Self {
        Self {
            store,
            registry,
            resolver,
            max_parallel_instances: DEFAULT_MAX_PARALLEL_INSTANCES,
            tick_counter: AtomicU64::new(0),
        }
    }

    /// Override how many top-level targets this engine materializes
    /// concurrently within one tick.
    #[must_use]
    pub fn with_max_parallel_instances(mut self, n: usize) -> Self {
        self.max_parallel_instances = n.max(1);
        self
    }

    fn next_tick_id(&self) -> String {
        let n = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        format!("tick-{}-{n}", Utc::now().timestamp_millis())
    }

    /// Run one planner tick: enumerate enabled roots and fanout roots,
    /// then materialize every resulting target (and, transitively, every
    /// dependency they need) up to `max_parallel_instances` at a time.
    pub async fn tick(engine: &Arc<Engine>) -> Result<TickSummary, BdxError> {
        let tick_id = engine.next_tick_id();
        let targets = engine.enumerate_targets().await?;
        let cache: Arc<TickCache> = Arc::new(Mutex::new(BTreeMap::new()));
        let summary = Arc::new(Mutex::new(TickSummary::new(tick_id.clone())));
        let semaphore = Arc::new(Semaphore::new(engine.max_parallel_instances));

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let engine = Arc::clone(engine);
            let cache = Arc::clone(&cache);
            let summary = Arc::clone(&summary);
            let semaphore = Arc::clone(&semaphore);
            let tick_id = tick_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("tick semaphore is never closed");
                if let Err(err) =
                    Engine::materialize_instance(&engine, target.asset_slug, target.params, target.trigger_reason, &tick_id, &cache, &summary)
                        .await
                {
                    warn!(error = %err, slug = %target.asset_slug, "top-level instance materialize failed");
                }
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|err| BdxError::fatal(format!("instance materialize task panicked: {err}")))?;
        }

        let summary = match Arc::try_unwrap(summary) {
            Ok(mutex) => mutex.into_inner(),
            Err(still_shared) => {
                warn!("tick summary still had outstanding references after every instance task completed");
                still_shared.lock().await.clone()
            }
        };
        Ok(summary)
    }

    async fn enumerate_targets(&self) -> Result<Vec<Target>, BdxError> {
        let mut targets = Vec::new();

        for root in self.store.enabled_roots().await.map_err(store_err)? {
            let instance = self.store.get_asset_instance(root.instance_id).await.map_err(store_err)?;
            let params_row = self.store.get_asset_params(instance.params_id).await.map_err(store_err)?;
            targets.push(Target {
                asset_slug: params_row.value.asset_slug(),
                params: params_row.value,
                trigger_reason: TriggerReason::RootScheduled,
            });
        }

        for fanout in self.store.enabled_fanout_roots().await.map_err(store_err)? {
            let Some(target_def) = self.registry.get(fanout.target_asset_slug) else {
                warn!(slug = %fanout.target_asset_slug, "fanout root targets an unregistered asset slug, skipping");
                continue;
            };
            let source_instance = self
                .store
                .get_asset_instance(fanout.source_instance_id)
                .await
                .map_err(store_err)?;
            let source_params = self.store.get_asset_params(source_instance.params_id).await.map_err(store_err)?;
            let fanout_source_hash = match fanout.fanout_mode {
                FanoutMode::GlobalPerItem => None,
                FanoutMode::ScopedBySource => Some(source_params.params_hash.clone()),
            };
            let members = self.store.current_membership(fanout.source_instance_id).await.map_err(store_err)?;
            for member in members {
                if let Some(params) =
                    target_def.params_from_fanout_item(member.item_id.kind, member.item_id.id, fanout_source_hash.as_deref())
                {
                    targets.push(Target {
                        asset_slug: fanout.target_asset_slug,
                        params,
                        trigger_reason: TriggerReason::FanoutExpansion,
                    });
                }
            }
        }

        // Deterministic tie-break by slug then params hash, per the
        // bottom-up resolution order the design names.
        let mut keyed: Vec<(String, Target)> = targets.into_iter().map(|t| (bdx_hash::params_hash(&t.params), t)).collect();
        keyed.sort_by(|a, b| (a.1.asset_slug, &a.0).cmp(&(b.1.asset_slug, &b.0)));
        Ok(keyed.into_iter().map(|(_, t)| t).collect())
    }

    async fn emit(&self, tick_id: &str, instance_id: AssetInstanceId, decision: PlannerDecision, reason: impl Into<String>, summary: &Mutex<TickSummary>) {
        let reason = reason.into();
        if let Err(err) = self
            .store
            .record_planner_event(RecordPlannerEventInput {
                asset_instance_id: instance_id,
                tick_id: tick_id.to_string(),
                decision,
                reason: reason.clone(),
            })
            .await
        {
            warn!(%instance_id, error = %err, "failed to record planner event");
        }
        summary.lock().await.record(decision);
        match decision {
            PlannerDecision::Error | PlannerDecision::ValidationError => {
                warn!(%instance_id, decision = ?decision, %reason, "planner decision");
            }
            _ => debug!(%instance_id, decision = ?decision, %reason, "planner decision"),
        }
    }

    /// Materialize one instance, recursing into its dependency closure
    /// first. Boxed because `AssetDefinition::dependencies` resolution is
    /// recursive and async fns can't recurse without indirection.
    fn materialize_instance<'a>(
        engine: &'a Arc<Engine>,
        slug: AssetSlug,
        params: AssetParamsValue,
        trigger_reason: TriggerReason,
        tick_id: &'a str,
        cache: &'a TickCache,
        summary: &'a Mutex<TickSummary>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CachedMaterialization>, BdxError>> + Send + 'a>> {
        Box::pin(async move {
            let params_hash = bdx_hash::params_hash(&params);
            let cache_key = (slug, params_hash.clone());
            if let Some(hit) = cache.lock().await.get(&cache_key).cloned() {
                return Ok(hit);
            }

            let params_row = engine
                .store
                .get_or_create_asset_params(ParamsKey {
                    asset_slug: slug,
                    params_hash: params_hash.clone(),
                    params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                    value: params.clone(),
                })
                .await
                .map_err(store_err)?;
            let instance = engine.store.get_or_create_asset_instance(params_row.id).await.map_err(store_err)?;

            let Some(definition) = engine.registry.get(slug) else {
                engine
                    .emit(tick_id, instance.id, PlannerDecision::Error, format!("no asset definition registered for {slug}"), summary)
                    .await;
                cache.lock().await.insert(cache_key, None);
                return Ok(None);
            };

            let (blocking, warnings): (Vec<ValidationIssue>, Vec<ValidationIssue>) =
                definition.validate_inputs(&params).into_iter().partition(ValidationIssue::is_blocking);
            if !blocking.is_empty() {
                let reason = blocking.into_iter().map(|i| i.message).collect::<Vec<_>>().join("; ");
                engine.emit(tick_id, instance.id, PlannerDecision::ValidationError, reason, summary).await;
                cache.lock().await.insert(cache_key, None);
                return Ok(None);
            }

            let lock_key = instance_lock_key(instance.id);
            let guard = match engine.store.try_advisory_lock(lock_key).await.map_err(store_err)? {
                Some(guard) => guard,
                None => {
                    engine
                        .emit(tick_id, instance.id, PlannerDecision::Deferred, "advisory lock held elsewhere, retry next tick", summary)
                        .await;
                    cache.lock().await.insert(cache_key, None);
                    return Ok(None);
                }
            };

            let outcome = Self::materialize_under_lock(engine, definition, slug, &params, &params_row.params_hash, &instance, trigger_reason, &warnings, tick_id, cache, summary).await;
            guard.release().await;
            let result = outcome?;
            cache.lock().await.insert(cache_key, result.clone());
            Ok(result)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize_under_lock<'a>(
        engine: &'a Arc<Engine>,
        definition: &'a dyn bdx_registry::AssetDefinition,
        slug: AssetSlug,
        params: &'a AssetParamsValue,
        params_hash: &'a str,
        instance: &'a bdx_core::AssetInstance,
        trigger_reason: TriggerReason,
        warnings: &'a [ValidationIssue],
        tick_id: &'a str,
        cache: &'a TickCache,
        summary: &'a Mutex<TickSummary>,
    ) -> Result<Option<CachedMaterialization>, BdxError> {
        // Step 2: resolve dependencies to their latest successful
        // materializations, recursively materializing any that are
        // missing or stale.
        let mut resolved_deps = Vec::new();
        for spec in definition.dependencies(params) {
            let dep_params = match &spec.target {
                DependencyTarget::Params(value) => value.clone(),
                DependencyTarget::ExistingParamsId(params_id) => {
                    engine.store.get_asset_params(*params_id).await.map_err(store_err)?.value
                }
            };
            let dep = Engine::materialize_instance(engine, spec.asset_slug, dep_params, TriggerReason::DependencyRequest, tick_id, cache, summary).await?;
            let Some(dep) = dep else {
                engine
                    .emit(
                        tick_id,
                        instance.id,
                        PlannerDecision::Deferred,
                        format!("dependency '{}' ({}) is not ready", spec.name, spec.asset_slug),
                        summary,
                    )
                    .await;
                return Ok(None);
            };
            resolved_deps.push(ResolvedDependency {
                name: spec.name,
                asset_slug: spec.asset_slug,
                params_hash: dep.params_hash,
                instance_id: dep.instance_id,
                materialization_id: dep.materialization_id,
                output_revision: dep.output_revision,
                membership: dep.membership,
            });
        }

        // Step 4: satisfy ingest prerequisites. A post corpus attributes
        // each per-member posts sync back to the source segment's own
        // materialization, which becomes a request edge on this
        // materialization once one exists.
        let requirements = definition.ingest_requirements(params, &resolved_deps);
        let mut request_edges: Vec<RequestEdge> = Vec::new();
        if !requirements.is_empty() {
            let outcomes = match engine.resolver.resolve_all(&requirements).await {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    let decision = if err.is_retryable() { PlannerDecision::Deferred } else { PlannerDecision::Error };
                    engine.emit(tick_id, instance.id, decision, err.to_string(), summary).await;
                    return Ok(None);
                }
            };
            if outcomes.iter().any(|o| matches!(o, ResolveOutcome::Deferred)) {
                engine
                    .emit(tick_id, instance.id, PlannerDecision::Deferred, "an ingest requirement's advisory lock was contended", summary)
                    .await;
                return Ok(None);
            }
            for requirement in &requirements {
                if let Some(requested_by) = requirement.requested_by_materialization_id {
                    request_edges.push(RequestEdge {
                        requested_by_materialization_id: requested_by,
                        fulfilled_by_materialization_id: None,
                    });
                }
            }
            request_edges.sort_by_key(|e| e.requested_by_materialization_id.0);
            request_edges.dedup();
        }

        // Step 5: compute the materialization key and short-circuit if it
        // matches the checkpoint.
        let inputs_hash = bdx_hash::inputs_hash(slug, &definition.inputs_hash_parts(params));
        let dependency_revisions_hash = bdx_hash::dependency_revisions_hash(
            &resolved_deps
                .iter()
                .map(|d| DependencyRevision {
                    name: d.name.clone(),
                    asset_slug: d.asset_slug,
                    params_hash: d.params_hash.clone(),
                    output_revision: d.output_revision,
                })
                .collect::<Vec<_>>(),
        );
        let key = MaterializationKey {
            inputs_hash: inputs_hash.clone(),
            dependency_revisions_hash: dependency_revisions_hash.clone(),
        };

        let prior = engine.store.latest_successful_materialization(instance.id).await.map_err(store_err)?;
        if let Some(prior) = &prior {
            let versions_match = prior.inputs_hash_version == bdx_hash::INPUTS_HASH_VERSION
                && prior.dependency_revisions_hash_version == bdx_hash::DEPENDENCY_REVISIONS_HASH_VERSION;
            if versions_match && key.matches(&prior.inputs_hash, &prior.dependency_revisions_hash) {
                let decision = if warnings.is_empty() { PlannerDecision::ShortCircuited } else { PlannerDecision::ValidationWarning };
                engine.emit(tick_id, instance.id, decision, "materialization key unchanged since checkpoint", summary).await;
                let membership = engine.store.current_membership(instance.id).await.map_err(store_err)?;
                return Ok(Some(CachedMaterialization {
                    instance_id: instance.id,
                    materialization_id: prior.id,
                    params_hash: params_hash.to_string(),
                    output_revision: prior.output_revision,
                    membership: membership.into_iter().map(|m| m.item_id).collect(),
                }));
            }
        }

        // Step 6: a fresh materialization is required.
        let materialization_id = engine
            .store
            .begin_materialization(BeginMaterializationInput {
                asset_instance_id: instance.id,
                asset_slug: slug,
                inputs_hash_version: bdx_hash::INPUTS_HASH_VERSION,
                inputs_hash,
                dependency_revisions_hash_version: bdx_hash::DEPENDENCY_REVISIONS_HASH_VERSION,
                dependency_revisions_hash,
                trigger_reason,
            })
            .await
            .map_err(store_err)?;

        let membership = match definition.compute_membership(params, &resolved_deps, engine.store.as_ref()).await {
            Ok(members) => members,
            Err(err) => {
                let payload = ErrorPayload::new(registry_err(&err)).with_context("asset_slug", slug.to_string());
                engine.store.fail_materialization(materialization_id, payload).await.map_err(store_err)?;
                engine.emit(tick_id, instance.id, PlannerDecision::Error, err.to_string(), summary).await;
                return Ok(None);
            }
        };

        let dependency_edges = resolved_deps.iter().map(|d| d.materialization_id).collect();
        let diff = match engine
            .store
            .complete_materialization(
                materialization_id,
                CompleteMaterializationInput {
                    membership: membership.clone(),
                    dependency_edges,
                    request_edges,
                },
            )
            .await
        {
            Ok(diff) => diff,
            Err(err) => {
                let payload = ErrorPayload::new(store_err(err));
                engine.store.fail_materialization(materialization_id, payload).await.map_err(store_err)?;
                engine
                    .emit(tick_id, instance.id, PlannerDecision::Error, "failed to complete materialization", summary)
                    .await;
                return Ok(None);
            }
        };

        let fresh = engine
            .store
            .latest_successful_materialization(instance.id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| BdxError::fatal("materialization vanished immediately after completing"))?;

        let decision = if warnings.is_empty() { PlannerDecision::Materialized } else { PlannerDecision::ValidationWarning };
        engine
            .emit(
                tick_id,
                instance.id,
                decision,
                format!("{} entered, {} exited", diff.entered.len(), diff.exited.len()),
                summary,
            )
            .await;

        Ok(Some(CachedMaterialization {
            instance_id: instance.id,
            materialization_id: fresh.id,
            params_hash: params_hash.to_string(),
            output_revision: fresh.output_revision,
            membership,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bdx_core::{PostId, UserId};
    use bdx_registry::Registry;
    use bdx_store::mem::MemStore;
    use bdx_upstream::{Page, RequestSnapshot, UpstreamClient, UpstreamPost, UserProfile};

    struct NoopClient;

    #[async_trait]
    impl UpstreamClient for NoopClient {
        async fn fetch_user_profile_by_handle(&self, _handle: &str) -> Result<UserProfile, BdxError> {
            Err(BdxError::fatal("not used in these tests"))
        }
        async fn fetch_users_by_ids(&self, _ids: &[UserId], _batch_size: usize) -> Result<Vec<UserProfile>, BdxError> {
            Ok(Vec::new())
        }
        async fn fetch_followers_page(&self, _handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            Ok(Page { items: Vec::new(), next_cursor: None })
        }
        async fn fetch_followings_page(&self, _handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            Ok(Page { items: Vec::new(), next_cursor: None })
        }
        async fn fetch_posts_page(&self, _query: &str, _cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError> {
            Ok(Page { items: Vec::new(), next_cursor: None })
        }
        async fn fetch_posts_by_ids(&self, _ids: &[PostId], _batch_size: usize) -> Result<Vec<UpstreamPost>, BdxError> {
            Ok(Vec::new())
        }
        fn last_snapshot(&self) -> Option<RequestSnapshot> {
            None
        }
    }

    fn profile(id: i64) -> UserProfile {
        UserProfile {
            id: UserId(id),
            handle: Some(format!("u{id}")),
            is_deleted: false,
        }
    }

    /// Serves a fixed follow graph for the subject handled "subject"
    /// (`UserId(1)`): followers `{2, 3}`, followings `{2, 4}`.
    struct FakeFollowGraphClient;

    #[async_trait]
    impl UpstreamClient for FakeFollowGraphClient {
        async fn fetch_user_profile_by_handle(&self, _handle: &str) -> Result<UserProfile, BdxError> {
            Err(BdxError::fatal("not used in these tests"))
        }
        async fn fetch_users_by_ids(&self, ids: &[UserId], _batch_size: usize) -> Result<Vec<UserProfile>, BdxError> {
            Ok(ids.iter().filter(|id| id.0 == 1).map(|_| profile(1)).collect())
        }
        async fn fetch_followers_page(&self, handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            let items = if handle == "u1" { vec![profile(2), profile(3)] } else { Vec::new() };
            Ok(Page { items, next_cursor: None })
        }
        async fn fetch_followings_page(&self, handle: &str, _cursor: Option<&str>) -> Result<Page<UserProfile>, BdxError> {
            let items = if handle == "u1" { vec![profile(2), profile(4)] } else { Vec::new() };
            Ok(Page { items, next_cursor: None })
        }
        async fn fetch_posts_page(&self, _query: &str, _cursor: Option<&str>) -> Result<Page<UpstreamPost>, BdxError> {
            Ok(Page { items: Vec::new(), next_cursor: None })
        }
        async fn fetch_posts_by_ids(&self, _ids: &[PostId], _batch_size: usize) -> Result<Vec<UpstreamPost>, BdxError> {
            Ok(Vec::new())
        }
        fn last_snapshot(&self) -> Option<RequestSnapshot> {
            None
        }
    }

    fn test_engine_with_client(store: Arc<dyn Store>, client: Arc<dyn UpstreamClient>) -> Arc<Engine> {
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            bdx_ingest::FollowersSync::new(client.clone(), store.clone()),
            bdx_ingest::FollowingsSync::new(client.clone(), store.clone()),
            bdx_ingest::PostsSync::new(client, store.clone(), 256),
        ));
        let registry = Arc::new(Registry::with_builtin_assets().expect("builtin registry is acyclic"));
        Arc::new(Engine::new(store, registry, resolver))
    }

    fn test_engine(store: Arc<dyn Store>) -> Arc<Engine> {
        test_engine_with_client(store, Arc::new(NoopClient))
    }

    #[tokio::test]
    async fn specified_users_root_materializes_on_first_tick() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let engine = test_engine(store.clone());

        let params = store
            .get_or_create_asset_params(ParamsKey {
                asset_slug: AssetSlug::SegmentSpecifiedUsers,
                params_hash: bdx_hash::params_hash(&AssetParamsValue::SegmentSpecifiedUsers {
                    stable_key: "vips".into(),
                    specified_user_ids: vec![UserId(1), UserId(2)],
                    fanout_source_params_hash: None,
                }),
                params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                value: AssetParamsValue::SegmentSpecifiedUsers {
                    stable_key: "vips".into(),
                    specified_user_ids: vec![UserId(1), UserId(2)],
                    fanout_source_params_hash: None,
                },
            })
            .await
            .unwrap();
        let instance = store.get_or_create_asset_instance(params.id).await.unwrap();
        store.upsert_root(instance.id, false).await.unwrap();

        let summary = Engine::tick(&engine).await.unwrap();
        assert_eq!(summary.materialized, 1);
        assert_eq!(summary.total(), 1);

        let checkpoint = store.latest_successful_materialization(instance.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.output_revision, 1);
        let membership = store.current_membership(instance.id).await.unwrap();
        assert_eq!(membership.len(), 2);
    }

    #[tokio::test]
    async fn second_tick_with_unchanged_inputs_short_circuits() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let engine = test_engine(store.clone());

        let value = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "vips".into(),
            specified_user_ids: vec![UserId(1)],
            fanout_source_params_hash: None,
        };
        let params = store
            .get_or_create_asset_params(ParamsKey {
                asset_slug: AssetSlug::SegmentSpecifiedUsers,
                params_hash: bdx_hash::params_hash(&value),
                params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                value: value.clone(),
            })
            .await
            .unwrap();
        let instance = store.get_or_create_asset_instance(params.id).await.unwrap();
        store.upsert_root(instance.id, false).await.unwrap();

        Engine::tick(&engine).await.unwrap();
        let second = Engine::tick(&engine).await.unwrap();
        assert_eq!(second.short_circuited, 1);
        assert_eq!(second.materialized, 0);

        let checkpoint = store.latest_successful_materialization(instance.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.output_revision, 1, "short circuit must not bump output_revision");
    }

    #[tokio::test]
    async fn empty_specified_users_root_materializes_with_a_validation_warning() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let engine = test_engine(store.clone());

        let value = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "empty".into(),
            specified_user_ids: Vec::new(),
            fanout_source_params_hash: None,
        };
        let params = store
            .get_or_create_asset_params(ParamsKey {
                asset_slug: AssetSlug::SegmentSpecifiedUsers,
                params_hash: bdx_hash::params_hash(&value),
                params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                value,
            })
            .await
            .unwrap();
        let instance = store.get_or_create_asset_instance(params.id).await.unwrap();
        store.upsert_root(instance.id, false).await.unwrap();

        let summary = Engine::tick(&engine).await.unwrap();
        assert_eq!(summary.validation_warnings, 1);
        assert_eq!(summary.materialized, 0);
    }

    #[tokio::test]
    async fn held_instance_lock_defers_the_tick() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let engine = test_engine(store.clone());

        let value = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "vips".into(),
            specified_user_ids: vec![UserId(1)],
            fanout_source_params_hash: None,
        };
        let params = store
            .get_or_create_asset_params(ParamsKey {
                asset_slug: AssetSlug::SegmentSpecifiedUsers,
                params_hash: bdx_hash::params_hash(&value),
                params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                value,
            })
            .await
            .unwrap();
        let instance = store.get_or_create_asset_instance(params.id).await.unwrap();
        store.upsert_root(instance.id, false).await.unwrap();

        let held = store.try_advisory_lock(instance_lock_key(instance.id)).await.unwrap();
        assert!(held.is_some());

        let summary = Engine::tick(&engine).await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert!(store.latest_successful_materialization(instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mutuals_root_recursively_materializes_its_followers_and_followed_dependencies() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let engine = test_engine_with_client(store.clone(), Arc::new(FakeFollowGraphClient));
        let value = AssetParamsValue::SegmentMutuals {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let params = store
            .get_or_create_asset_params(ParamsKey {
                asset_slug: AssetSlug::SegmentMutuals,
                params_hash: bdx_hash::params_hash(&value),
                params_hash_version: bdx_hash::PARAMS_HASH_VERSION,
                value,
            })
            .await
            .unwrap();
        let instance = store.get_or_create_asset_instance(params.id).await.unwrap();
        store.upsert_root(instance.id, false).await.unwrap();

        let summary = Engine::tick(&engine).await.unwrap();
        assert_eq!(summary.materialized, 3, "mutuals + its followers dep + its followed dep");

        let membership = store.current_membership(instance.id).await.unwrap();
        assert_eq!(membership.len(), 1);
        assert_eq!(membership[0].item_id, bdx_core::ItemId::user(UserId(2)));
    }
}
