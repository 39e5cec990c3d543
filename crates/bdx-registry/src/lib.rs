// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Per-slug contracts: dependency shape, ingest prerequisites, and the
//! membership compute function for each of the six asset kinds.
//!
//! An [`AssetDefinition`] is the declarative unit the engine drives; a
//! [`Registry`] owns one per [`AssetSlug`] and rejects both duplicate
//! registration and a cyclic *static* dependency graph (the graph of which
//! slugs can ever depend on which, not the per-instance dependency
//! resolution the engine performs every tick).

use async_trait::async_trait;
use bdx_core::{
    AssetInstanceId, AssetParamsId, AssetParamsValue, AssetSlug, IngestKind, ItemId, ItemKind,
    MaterializationId, UserId,
};
use bdx_store::{IngestRequirement, Store};
use std::collections::{BTreeMap, BTreeSet};

/// Default freshness window for an ingest requirement: 6 hours.
pub const DEFAULT_FRESHNESS_MS: i64 = 6 * 60 * 60 * 1000;

/// Severity of a [`ValidationIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Input is unusual but not invalid; the instance still materializes.
    Warning,
    /// Input is invalid; the planner skips the instance for this tick.
    Error,
}

/// One issue raised by [`AssetDefinition::validate_inputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Whether this issue blocks materialization.
    pub severity: ValidationSeverity,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    /// Construct a non-blocking warning.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Warning,
            message: message.into(),
        }
    }

    /// Construct a blocking error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            message: message.into(),
        }
    }

    /// `true` iff this issue should skip the instance.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.severity == ValidationSeverity::Error
    }
}

/// Where an [`AssetDefinition::dependencies`] entry's params come from.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyTarget {
    /// Construct the dependency's params directly; the engine looks up or
    /// creates the `AssetParams`/`AssetInstance` rows from this value.
    Params(AssetParamsValue),
    /// The dependency params row already exists (e.g. a post corpus's
    /// source segment, created independently via a root or fanout); refer
    /// to it by id rather than reconstructing its typed value.
    ExistingParamsId(AssetParamsId),
}

/// One statically declared dependency of an asset definition, named so the
/// dependency-revisions hash and `compute_membership`/`ingest_requirements`
/// can refer back to it.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencySpec {
    /// Name used in the dependency-revisions hash and in
    /// [`ResolvedDependency::name`] lookups.
    pub name: String,
    /// The dependency's asset slug.
    pub asset_slug: AssetSlug,
    /// How to resolve the dependency's params.
    pub target: DependencyTarget,
}

/// A dependency after the engine has resolved it to its latest successful
/// materialization and replayed its membership as-of that checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDependency {
    /// Matches the `name` of the [`DependencySpec`] that produced this.
    pub name: String,
    /// The dependency's asset slug.
    pub asset_slug: AssetSlug,
    /// The dependency instance's params hash, pinned for the
    /// dependency-revisions hash.
    pub params_hash: String,
    /// The dependency's instance id.
    pub instance_id: AssetInstanceId,
    /// The pinned materialization id.
    pub materialization_id: MaterializationId,
    /// The pinned `output_revision`.
    pub output_revision: i64,
    /// Membership as of the pinned materialization, sorted ascending.
    pub membership: Vec<ItemId>,
}

impl ResolvedDependency {
    /// Membership as a set, for intersection/difference computations.
    #[must_use]
    pub fn membership_set(&self) -> BTreeSet<ItemId> {
        self.membership.iter().copied().collect()
    }
}

/// Errors raised while registering or evaluating asset definitions.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two definitions were registered for the same slug.
    #[error("duplicate asset slug registered: {0}")]
    DuplicateSlug(AssetSlug),
    /// The static dependency graph contains a cycle.
    #[error("cyclic asset dependency detected: {0}")]
    CyclicDependency(String),
    /// A required named dependency was not present among resolved
    /// dependencies passed to `compute_membership`.
    #[error("missing resolved dependency named '{0}'")]
    MissingDependency(String),
    /// The store raised an error while computing membership.
    #[error(transparent)]
    Store(#[from] bdx_store::StoreError),
}

/// Per-slug asset contract.
#[async_trait]
pub trait AssetDefinition: Send + Sync {
    /// The kind of item this asset's membership contains.
    fn output_item_kind(&self) -> ItemKind;

    /// The slugs this definition can ever statically depend on, used only
    /// by [`Registry::check_acyclic`]. Not the per-instance dependency
    /// list — see [`AssetDefinition::dependencies`] for that.
    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        Vec::new()
    }

    /// This instance's declared dependencies, given its params. Static per
    /// params: calling this twice with the same value yields the same
    /// list.
    fn dependencies(&self, params: &AssetParamsValue) -> Vec<DependencySpec>;

    /// Ingest prerequisites this instance needs satisfied before
    /// `compute_membership` can run. May depend on `resolved_deps` (e.g. a
    /// post corpus needs one requirement per member of its pinned source
    /// segment).
    fn ingest_requirements(&self, params: &AssetParamsValue, resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement>;

    /// Deterministic, sorted parts this instance's `inputs_hash`
    /// contributes beyond its dependency revisions (empty for every slug
    /// except `segment_specified_users`, whose membership is operator
    /// input rather than derived from ingest or dependencies).
    fn inputs_hash_parts(&self, params: &AssetParamsValue) -> Vec<String>;

    /// Compute this instance's membership: sorted ascending, deduplicated.
    async fn compute_membership(
        &self,
        params: &AssetParamsValue,
        resolved_deps: &[ResolvedDependency],
        store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError>;

    /// Validate `params` before computing membership. Default: no issues.
    fn validate_inputs(&self, _params: &AssetParamsValue) -> Vec<ValidationIssue> {
        Vec::new()
    }

    /// Map one fanned-out item to this slug's params, if this slug can be
    /// a fanout target. Default: not a valid fanout target.
    fn params_from_fanout_item(
        &self,
        _item_kind: ItemKind,
        _item_external_id: i64,
        _fanout_source_params_hash: Option<&str>,
    ) -> Option<AssetParamsValue> {
        None
    }
}

fn sorted_deduped(mut items: Vec<ItemId>) -> Vec<ItemId> {
    items.sort_unstable();
    items.dedup();
    items
}

fn find_dependency<'a>(resolved_deps: &'a [ResolvedDependency], name: &str) -> Result<&'a ResolvedDependency, RegistryError> {
    resolved_deps
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| RegistryError::MissingDependency(name.to_string()))
}

// ---------------------------------------------------------------------------
// segment_specified_users
// ---------------------------------------------------------------------------

struct SegmentSpecifiedUsersAsset;

#[async_trait]
impl AssetDefinition for SegmentSpecifiedUsersAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn dependencies(&self, _params: &AssetParamsValue) -> Vec<DependencySpec> {
        Vec::new()
    }

    fn ingest_requirements(&self, _params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        Vec::new()
    }

    fn inputs_hash_parts(&self, params: &AssetParamsValue) -> Vec<String> {
        let AssetParamsValue::SegmentSpecifiedUsers { specified_user_ids, .. } = params else {
            return Vec::new();
        };
        let mut ids: Vec<i64> = specified_user_ids.iter().map(|id| id.get()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|id| format!("user_external_id={id}")).collect()
    }

    async fn compute_membership(
        &self,
        params: &AssetParamsValue,
        _resolved_deps: &[ResolvedDependency],
        _store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let AssetParamsValue::SegmentSpecifiedUsers { specified_user_ids, .. } = params else {
            return Ok(Vec::new());
        };
        Ok(sorted_deduped(specified_user_ids.iter().copied().map(ItemId::user).collect()))
    }

    fn validate_inputs(&self, params: &AssetParamsValue) -> Vec<ValidationIssue> {
        let AssetParamsValue::SegmentSpecifiedUsers { specified_user_ids, .. } = params else {
            return Vec::new();
        };
        if specified_user_ids.is_empty() {
            vec![ValidationIssue::warning("segment_specified_users has no members")]
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// segment_followers / segment_followed
// ---------------------------------------------------------------------------

struct SegmentFollowersAsset;

#[async_trait]
impl AssetDefinition for SegmentFollowersAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn dependencies(&self, _params: &AssetParamsValue) -> Vec<DependencySpec> {
        Vec::new()
    }

    fn ingest_requirements(&self, params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        let AssetParamsValue::SegmentFollowers { subject_external_id, .. } = params else {
            return Vec::new();
        };
        vec![IngestRequirement {
            kind: IngestKind::TwitterioApiUserFollowers,
            target_user_id: *subject_external_id,
            freshness_ms: DEFAULT_FRESHNESS_MS,
            requested_by_materialization_id: None,
        }]
    }

    fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
        Vec::new()
    }

    async fn compute_membership(
        &self,
        params: &AssetParamsValue,
        _resolved_deps: &[ResolvedDependency],
        store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let AssetParamsValue::SegmentFollowers { subject_external_id, .. } = params else {
            return Ok(Vec::new());
        };
        let edges = store.active_followers(*subject_external_id).await?;
        Ok(sorted_deduped(edges.into_iter().map(|e| ItemId::user(e.follower_id)).collect()))
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_external_id: i64,
        fanout_source_params_hash: Option<&str>,
    ) -> Option<AssetParamsValue> {
        (item_kind == ItemKind::User).then(|| AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(item_external_id),
            fanout_source_params_hash: fanout_source_params_hash.map(str::to_string),
        })
    }
}

struct SegmentFollowedAsset;

#[async_trait]
impl AssetDefinition for SegmentFollowedAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn dependencies(&self, _params: &AssetParamsValue) -> Vec<DependencySpec> {
        Vec::new()
    }

    fn ingest_requirements(&self, params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        let AssetParamsValue::SegmentFollowed { subject_external_id, .. } = params else {
            return Vec::new();
        };
        vec![IngestRequirement {
            kind: IngestKind::TwitterioApiUserFollowings,
            target_user_id: *subject_external_id,
            freshness_ms: DEFAULT_FRESHNESS_MS,
            requested_by_materialization_id: None,
        }]
    }

    fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
        Vec::new()
    }

    async fn compute_membership(
        &self,
        params: &AssetParamsValue,
        _resolved_deps: &[ResolvedDependency],
        store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let AssetParamsValue::SegmentFollowed { subject_external_id, .. } = params else {
            return Ok(Vec::new());
        };
        let edges = store.active_followings(*subject_external_id).await?;
        Ok(sorted_deduped(edges.into_iter().map(|e| ItemId::user(e.target_id)).collect()))
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_external_id: i64,
        fanout_source_params_hash: Option<&str>,
    ) -> Option<AssetParamsValue> {
        (item_kind == ItemKind::User).then(|| AssetParamsValue::SegmentFollowed {
            subject_external_id: UserId(item_external_id),
            fanout_source_params_hash: fanout_source_params_hash.map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// segment_mutuals / segment_unreciprocated_followed
// ---------------------------------------------------------------------------

fn followers_followed_deps(subject_external_id: UserId) -> Vec<DependencySpec> {
    vec![
        DependencySpec {
            name: "followers".to_string(),
            asset_slug: AssetSlug::SegmentFollowers,
            target: DependencyTarget::Params(AssetParamsValue::SegmentFollowers {
                subject_external_id,
                fanout_source_params_hash: None,
            }),
        },
        DependencySpec {
            name: "followed".to_string(),
            asset_slug: AssetSlug::SegmentFollowed,
            target: DependencyTarget::Params(AssetParamsValue::SegmentFollowed {
                subject_external_id,
                fanout_source_params_hash: None,
            }),
        },
    ]
}

struct SegmentMutualsAsset;

#[async_trait]
impl AssetDefinition for SegmentMutualsAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        vec![AssetSlug::SegmentFollowers, AssetSlug::SegmentFollowed]
    }

    fn dependencies(&self, params: &AssetParamsValue) -> Vec<DependencySpec> {
        let AssetParamsValue::SegmentMutuals { subject_external_id, .. } = params else {
            return Vec::new();
        };
        followers_followed_deps(*subject_external_id)
    }

    fn ingest_requirements(&self, _params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        Vec::new()
    }

    fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
        Vec::new()
    }

    async fn compute_membership(
        &self,
        _params: &AssetParamsValue,
        resolved_deps: &[ResolvedDependency],
        _store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let followers = find_dependency(resolved_deps, "followers")?.membership_set();
        let followed = find_dependency(resolved_deps, "followed")?.membership_set();
        Ok(followers.intersection(&followed).copied().collect())
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_external_id: i64,
        fanout_source_params_hash: Option<&str>,
    ) -> Option<AssetParamsValue> {
        (item_kind == ItemKind::User).then(|| AssetParamsValue::SegmentMutuals {
            subject_external_id: UserId(item_external_id),
            fanout_source_params_hash: fanout_source_params_hash.map(str::to_string),
        })
    }
}

struct SegmentUnreciprocatedFollowedAsset;

#[async_trait]
impl AssetDefinition for SegmentUnreciprocatedFollowedAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        vec![AssetSlug::SegmentFollowers, AssetSlug::SegmentFollowed]
    }

    fn dependencies(&self, params: &AssetParamsValue) -> Vec<DependencySpec> {
        let AssetParamsValue::SegmentUnreciprocatedFollowed { subject_external_id, .. } = params else {
            return Vec::new();
        };
        followers_followed_deps(*subject_external_id)
    }

    fn ingest_requirements(&self, _params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        Vec::new()
    }

    fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
        Vec::new()
    }

    async fn compute_membership(
        &self,
        _params: &AssetParamsValue,
        resolved_deps: &[ResolvedDependency],
        _store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let followers = find_dependency(resolved_deps, "followers")?.membership_set();
        let followed = find_dependency(resolved_deps, "followed")?.membership_set();
        Ok(followed.difference(&followers).copied().collect())
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_external_id: i64,
        fanout_source_params_hash: Option<&str>,
    ) -> Option<AssetParamsValue> {
        (item_kind == ItemKind::User).then(|| AssetParamsValue::SegmentUnreciprocatedFollowed {
            subject_external_id: UserId(item_external_id),
            fanout_source_params_hash: fanout_source_params_hash.map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// post_corpus_for_segment
// ---------------------------------------------------------------------------

struct PostCorpusForSegmentAsset;

#[async_trait]
impl AssetDefinition for PostCorpusForSegmentAsset {
    fn output_item_kind(&self) -> ItemKind {
        ItemKind::Post
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        vec![
            AssetSlug::SegmentSpecifiedUsers,
            AssetSlug::SegmentFollowers,
            AssetSlug::SegmentFollowed,
            AssetSlug::SegmentMutuals,
            AssetSlug::SegmentUnreciprocatedFollowed,
        ]
    }

    fn dependencies(&self, params: &AssetParamsValue) -> Vec<DependencySpec> {
        let AssetParamsValue::PostCorpusForSegment {
            source_segment_asset_slug,
            source_segment_params_id,
            ..
        } = params
        else {
            return Vec::new();
        };
        vec![DependencySpec {
            name: "source_segment".to_string(),
            asset_slug: *source_segment_asset_slug,
            target: DependencyTarget::ExistingParamsId(*source_segment_params_id),
        }]
    }

    fn ingest_requirements(&self, _params: &AssetParamsValue, resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
        let Ok(source) = find_dependency(resolved_deps, "source_segment") else {
            return Vec::new();
        };
        source
            .membership
            .iter()
            .filter(|item| item.kind == ItemKind::User)
            .map(|item| IngestRequirement {
                kind: IngestKind::TwitterioApiUsersPosts,
                target_user_id: UserId(item.id),
                freshness_ms: DEFAULT_FRESHNESS_MS,
                requested_by_materialization_id: Some(source.materialization_id),
            })
            .collect()
    }

    fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
        Vec::new()
    }

    async fn compute_membership(
        &self,
        _params: &AssetParamsValue,
        resolved_deps: &[ResolvedDependency],
        store: &dyn Store,
    ) -> Result<Vec<ItemId>, RegistryError> {
        let source = find_dependency(resolved_deps, "source_segment")?;
        let author_ids: Vec<UserId> = source
            .membership
            .iter()
            .filter(|item| item.kind == ItemKind::User)
            .map(|item| UserId(item.id))
            .collect();
        let posts = store.active_posts_by_authors(&author_ids).await?;
        Ok(sorted_deduped(posts.into_iter().map(|p| ItemId::post(p.id)).collect()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns one [`AssetDefinition`] per [`AssetSlug`].
#[derive(Default)]
pub struct Registry {
    definitions: BTreeMap<AssetSlug, Box<dyn AssetDefinition>>,
}

impl Registry {
    /// Build the registry with the six built-in asset definitions,
    /// rejecting (impossible here, but checked for future additions) any
    /// duplicate and verifying the static dependency graph is acyclic.
    pub fn with_builtin_assets() -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        registry.register(AssetSlug::SegmentSpecifiedUsers, Box::new(SegmentSpecifiedUsersAsset))?;
        registry.register(AssetSlug::SegmentFollowers, Box::new(SegmentFollowersAsset))?;
        registry.register(AssetSlug::SegmentFollowed, Box::new(SegmentFollowedAsset))?;
        registry.register(AssetSlug::SegmentMutuals, Box::new(SegmentMutualsAsset))?;
        registry.register(
            AssetSlug::SegmentUnreciprocatedFollowed,
            Box::new(SegmentUnreciprocatedFollowedAsset),
        )?;
        registry.register(AssetSlug::PostCorpusForSegment, Box::new(PostCorpusForSegmentAsset))?;
        registry.check_acyclic()?;
        Ok(registry)
    }

    /// Register a definition for `slug`. Errors if one is already
    /// registered.
    pub fn register(&mut self, slug: AssetSlug, definition: Box<dyn AssetDefinition>) -> Result<(), RegistryError> {
        if self.definitions.contains_key(&slug) {
            return Err(RegistryError::DuplicateSlug(slug));
        }
        self.definitions.insert(slug, definition);
        Ok(())
    }

    /// Look up the definition for `slug`, if registered.
    #[must_use]
    pub fn get(&self, slug: AssetSlug) -> Option<&dyn AssetDefinition> {
        self.definitions.get(&slug).map(std::convert::AsRef::as_ref)
    }

    /// Verify the static dependency graph (declared via
    /// [`AssetDefinition::static_dependency_slugs`]) has no cycle, via DFS
    /// with a recursion stack.
    pub fn check_acyclic(&self) -> Result<(), RegistryError> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();
        for &slug in self.definitions.keys() {
            self.visit(slug, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit(&self, slug: AssetSlug, visited: &mut BTreeSet<AssetSlug>, stack: &mut Vec<AssetSlug>) -> Result<(), RegistryError> {
        if let Some(pos) = stack.iter().position(|&s| s == slug) {
            let cycle: Vec<String> = stack[pos..].iter().map(AssetSlug::to_string).collect();
            return Err(RegistryError::CyclicDependency(cycle.join(" -> ") + &format!(" -> {slug}")));
        }
        if visited.contains(&slug) {
            return Ok(());
        }
        stack.push(slug);
        if let Some(def) = self.get(slug) {
            for dep_slug in def.static_dependency_slugs() {
                self.visit(dep_slug, visited, stack)?;
            }
        }
        stack.pop();
        visited.insert(slug);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdx_core::Post;
    use bdx_store::mem::MemStore;

    fn registry() -> Registry {
        Registry::with_builtin_assets().expect("builtin registry is acyclic")
    }

    #[test]
    fn builtin_registry_is_acyclic_and_complete() {
        let registry = registry();
        for slug in AssetSlug::ALL {
            assert!(registry.get(slug).is_some(), "missing definition for {slug}");
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::default();
        registry
            .register(AssetSlug::SegmentFollowers, Box::new(SegmentFollowersAsset))
            .unwrap();
        let err = registry
            .register(AssetSlug::SegmentFollowers, Box::new(SegmentFollowersAsset))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSlug(AssetSlug::SegmentFollowers)));
    }

    struct CyclicA;
    struct CyclicB;

    #[async_trait]
    impl AssetDefinition for CyclicA {
        fn output_item_kind(&self) -> ItemKind {
            ItemKind::User
        }
        fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
            vec![AssetSlug::SegmentFollowed]
        }
        fn dependencies(&self, _params: &AssetParamsValue) -> Vec<DependencySpec> {
            Vec::new()
        }
        fn ingest_requirements(&self, _params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
            Vec::new()
        }
        fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
            Vec::new()
        }
        async fn compute_membership(
            &self,
            _params: &AssetParamsValue,
            _resolved_deps: &[ResolvedDependency],
            _store: &dyn Store,
        ) -> Result<Vec<ItemId>, RegistryError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl AssetDefinition for CyclicB {
        fn output_item_kind(&self) -> ItemKind {
            ItemKind::User
        }
        fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
            vec![AssetSlug::SegmentFollowers]
        }
        fn dependencies(&self, _params: &AssetParamsValue) -> Vec<DependencySpec> {
            Vec::new()
        }
        fn ingest_requirements(&self, _params: &AssetParamsValue, _resolved_deps: &[ResolvedDependency]) -> Vec<IngestRequirement> {
            Vec::new()
        }
        fn inputs_hash_parts(&self, _params: &AssetParamsValue) -> Vec<String> {
            Vec::new()
        }
        async fn compute_membership(
            &self,
            _params: &AssetParamsValue,
            _resolved_deps: &[ResolvedDependency],
            _store: &dyn Store,
        ) -> Result<Vec<ItemId>, RegistryError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn cyclic_static_dependency_graph_is_rejected() {
        let mut registry = Registry::default();
        registry.register(AssetSlug::SegmentFollowers, Box::new(CyclicA)).unwrap();
        registry.register(AssetSlug::SegmentFollowed, Box::new(CyclicB)).unwrap();
        let err = registry.check_acyclic().unwrap_err();
        assert!(matches!(err, RegistryError::CyclicDependency(_)));
    }

    #[tokio::test]
    async fn segment_specified_users_returns_sorted_deduped_members() {
        let def = SegmentSpecifiedUsersAsset;
        let store = MemStore::new();
        let params = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "vips".to_string(),
            specified_user_ids: vec![UserId(3), UserId(1), UserId(3), UserId(2)],
            fanout_source_params_hash: None,
        };
        let members = def.compute_membership(&params, &[], &store).await.unwrap();
        assert_eq!(
            members,
            vec![ItemId::user(UserId(1)), ItemId::user(UserId(2)), ItemId::user(UserId(3))]
        );
    }

    #[test]
    fn segment_specified_users_warns_on_empty_set() {
        let def = SegmentSpecifiedUsersAsset;
        let params = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "vips".to_string(),
            specified_user_ids: Vec::new(),
            fanout_source_params_hash: None,
        };
        let issues = def.validate_inputs(&params);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationSeverity::Warning);
    }

    #[tokio::test]
    async fn segment_followers_reads_active_followers_from_store() {
        let store = MemStore::new();
        store
            .upsert_user(bdx_store::UserUpsert {
                id: UserId(1),
                handle: Some("subject".to_string()),
                ingest_event_id: None,
            })
            .await
            .unwrap();
        store
            .reconcile_followers(UserId(1), &[UserId(2), UserId(3)], bdx_core::SyncMode::FullRefresh)
            .await
            .unwrap();

        let def = SegmentFollowersAsset;
        let params = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let members = def.compute_membership(&params, &[], &store).await.unwrap();
        assert_eq!(members, vec![ItemId::user(UserId(2)), ItemId::user(UserId(3))]);
    }

    fn resolved(name: &str, membership: Vec<ItemId>) -> ResolvedDependency {
        ResolvedDependency {
            name: name.to_string(),
            asset_slug: AssetSlug::SegmentFollowers,
            params_hash: "h".repeat(64),
            instance_id: AssetInstanceId(1),
            materialization_id: MaterializationId(1),
            output_revision: 0,
            membership,
        }
    }

    #[tokio::test]
    async fn segment_mutuals_intersects_followers_and_followed() {
        let def = SegmentMutualsAsset;
        let store = MemStore::new();
        let followers = resolved("followers", vec![ItemId::user(UserId(1)), ItemId::user(UserId(2))]);
        let followed = resolved("followed", vec![ItemId::user(UserId(2)), ItemId::user(UserId(3))]);
        let params = AssetParamsValue::SegmentMutuals {
            subject_external_id: UserId(9),
            fanout_source_params_hash: None,
        };
        let members = def.compute_membership(&params, &[followers, followed], &store).await.unwrap();
        assert_eq!(members, vec![ItemId::user(UserId(2))]);
    }

    #[tokio::test]
    async fn segment_unreciprocated_followed_is_followed_minus_followers() {
        let def = SegmentUnreciprocatedFollowedAsset;
        let store = MemStore::new();
        let followers = resolved("followers", vec![ItemId::user(UserId(1))]);
        let followed = resolved("followed", vec![ItemId::user(UserId(1)), ItemId::user(UserId(2))]);
        let params = AssetParamsValue::SegmentUnreciprocatedFollowed {
            subject_external_id: UserId(9),
            fanout_source_params_hash: None,
        };
        let members = def.compute_membership(&params, &[followers, followed], &store).await.unwrap();
        assert_eq!(members, vec![ItemId::user(UserId(2))]);
    }

    #[tokio::test]
    async fn post_corpus_requests_one_ingest_per_source_member() {
        let def = PostCorpusForSegmentAsset;
        let source = resolved("source_segment", vec![ItemId::user(UserId(1)), ItemId::user(UserId(2))]);
        let params = AssetParamsValue::PostCorpusForSegment {
            source_segment_asset_slug: AssetSlug::SegmentFollowers,
            source_segment_params_id: AssetParamsId(7),
            source_segment_params_hash: "h".repeat(64),
            fanout_source_params_hash: None,
        };
        let reqs = def.ingest_requirements(&params, std::slice::from_ref(&source));
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.requested_by_materialization_id == Some(MaterializationId(1))));
    }

    #[tokio::test]
    async fn post_corpus_computes_membership_from_author_posts() {
        let store = MemStore::new();
        store
            .upsert_post(Post {
                id: bdx_core::PostId(100),
                author_id: UserId(1),
                posted_at: chrono::Utc::now(),
                text: "hi".to_string(),
                lang: None,
                raw_payload: serde_json::json!({}),
                is_deleted: false,
            })
            .await
            .unwrap();
        let def = PostCorpusForSegmentAsset;
        let source = resolved("source_segment", vec![ItemId::user(UserId(1))]);
        let params = AssetParamsValue::PostCorpusForSegment {
            source_segment_asset_slug: AssetSlug::SegmentFollowers,
            source_segment_params_id: AssetParamsId(7),
            source_segment_params_hash: "h".repeat(64),
            fanout_source_params_hash: None,
        };
        let members = def.compute_membership(&params, &[source], &store).await.unwrap();
        assert_eq!(members, vec![ItemId::post(bdx_core::PostId(100))]);
    }
}
