// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Deterministic content-addressing hashes.
//!
//! Every hash here is a pure function of its inputs: no network, no clock,
//! no store lookups. That's deliberate — the planner needs to recompute a
//! materialization key on every tick without paying for I/O, and a pure
//! function is the only kind of code you can unit-test exhaustively with
//! `proptest` and trust completely.

use bdx_core::{AssetParamsValue, AssetSlug};
use sha2::{Digest, Sha256};

/// Version of the params-hash algorithm implemented by [`params_hash`].
pub const PARAMS_HASH_VERSION: i32 = 1;
/// Version of the inputs-hash algorithm implemented by [`inputs_hash`].
pub const INPUTS_HASH_VERSION: i32 = 1;
/// Version of the dependency-revisions-hash algorithm implemented by
/// [`dependency_revisions_hash`].
pub const DEPENDENCY_REVISIONS_HASH_VERSION: i32 = 1;

fn sha256_hex_of_lines(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Identity parts for one asset slug's params hash, in the fixed order
/// named for that slug. `fanout_source_params_hash`, if present, is
/// appended last by the caller, not by this function.
fn identity_parts(value: &AssetParamsValue) -> Vec<String> {
    match value {
        AssetParamsValue::SegmentSpecifiedUsers { stable_key, .. } => {
            vec![format!("stable_key={stable_key}")]
        }
        AssetParamsValue::SegmentFollowers {
            subject_external_id, ..
        }
        | AssetParamsValue::SegmentFollowed {
            subject_external_id, ..
        }
        | AssetParamsValue::SegmentMutuals {
            subject_external_id, ..
        }
        | AssetParamsValue::SegmentUnreciprocatedFollowed {
            subject_external_id, ..
        } => {
            vec![format!("subject_external_id={}", subject_external_id.get())]
        }
        AssetParamsValue::PostCorpusForSegment {
            source_segment_asset_slug,
            source_segment_params_hash,
            ..
        } => vec![
            format!("source_segment.asset_slug={source_segment_asset_slug}"),
            format!("source_segment.params_hash={source_segment_params_hash}"),
        ],
    }
}

/// Compute the params hash (v1) for a given params value.
///
/// Returns the lowercase hex SHA-256 digest described by the hashing
/// design: `kind=params_hash:v1`, `asset_slug=<slug>`, the slug's identity
/// parts in order, then `fanout_source_params_hash=<hex>` if set.
#[must_use]
pub fn params_hash(value: &AssetParamsValue) -> String {
    let mut lines = vec![
        "kind=params_hash:v1".to_string(),
        format!("asset_slug={}", value.asset_slug()),
    ];
    lines.extend(identity_parts(value));
    if let Some(fanout_hash) = value.fanout_source_params_hash() {
        lines.push(format!("fanout_source_params_hash={fanout_hash}"));
    }
    sha256_hex_of_lines(&lines)
}

/// Compute the inputs hash (v1) for a slug given its already-sorted,
/// slug-specific parts (e.g. `user_external_id=<n>` lines for
/// `segment_specified_users`; empty for every other slug per the design).
///
/// Callers are responsible for sorting `sorted_parts` deterministically;
/// this function only joins and hashes.
#[must_use]
pub fn inputs_hash(slug: AssetSlug, sorted_parts: &[String]) -> String {
    let mut lines = vec!["kind=inputs_hash:v1".to_string(), format!("asset_slug={slug}")];
    lines.extend(sorted_parts.iter().cloned());
    sha256_hex_of_lines(&lines)
}

/// One dependency's contribution to a [`dependency_revisions_hash`] input,
/// keyed by the name the registry gave the dependency in
/// `AssetDefinition::dependencies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRevision {
    /// Name the declaring `AssetDefinition` gave this dependency.
    pub name: String,
    /// The dependency instance's slug.
    pub asset_slug: AssetSlug,
    /// The dependency instance's params hash.
    pub params_hash: String,
    /// The dependency's `output_revision` at the pinned materialization.
    pub output_revision: i64,
}

/// Compute the dependency-revisions hash (v1) over a dependency list in
/// declaration order. An empty slice hashes to the fixed value of the bare
/// `kind=dep_rev_hash:v1` line.
#[must_use]
pub fn dependency_revisions_hash(deps: &[DependencyRevision]) -> String {
    let mut lines = vec!["kind=dep_rev_hash:v1".to_string()];
    for dep in deps {
        let name = &dep.name;
        lines.push(format!("dep.{name}.asset_slug={}", dep.asset_slug));
        lines.push(format!("dep.{name}.params_hash={}", dep.params_hash));
        lines.push(format!("dep.{name}.output_revision={}", dep.output_revision));
    }
    sha256_hex_of_lines(&lines)
}

/// The three hashes identifying whether a fresh materialization is
/// required, bundled together since every caller that computes one
/// computes all three.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializationKey {
    /// Hex-encoded inputs hash.
    pub inputs_hash: String,
    /// Hex-encoded dependency-revisions hash.
    pub dependency_revisions_hash: String,
}

impl MaterializationKey {
    /// `true` iff this key matches the hashes recorded on a prior
    /// successful materialization at the current hash versions. Callers
    /// are expected to have already checked the hash *versions* match
    /// before calling this — a version bump always forces a fresh
    /// materialization regardless of hash equality.
    #[must_use]
    pub fn matches(&self, prior_inputs_hash: &str, prior_dependency_revisions_hash: &str) -> bool {
        self.inputs_hash == prior_inputs_hash && self.dependency_revisions_hash == prior_dependency_revisions_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdx_core::UserId;
    use proptest::prelude::*;

    #[test]
    fn params_hash_is_64_char_lowercase_hex() {
        let value = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(42),
            fanout_source_params_hash: None,
        };
        let hash = params_hash(&value);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn params_hash_differs_by_subject() {
        let a = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let b = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(2),
            fanout_source_params_hash: None,
        };
        assert_ne!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn params_hash_differs_by_slug_for_same_subject() {
        let followers = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let followed = AssetParamsValue::SegmentFollowed {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        assert_ne!(params_hash(&followers), params_hash(&followed));
    }

    #[test]
    fn params_hash_changes_with_fanout_source_hash() {
        let bare = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        let fanned = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: Some("deadbeef".into()),
        };
        assert_ne!(params_hash(&bare), params_hash(&fanned));
    }

    #[test]
    fn inputs_hash_is_stable_for_empty_parts() {
        let a = inputs_hash(AssetSlug::SegmentFollowers, &[]);
        let b = inputs_hash(AssetSlug::SegmentFollowed, &[]);
        assert_ne!(a, b, "asset_slug line must participate in the hash");
    }

    #[test]
    fn inputs_hash_changes_when_parts_change() {
        let a = inputs_hash(
            AssetSlug::SegmentSpecifiedUsers,
            &["user_external_id=1".to_string()],
        );
        let b = inputs_hash(
            AssetSlug::SegmentSpecifiedUsers,
            &["user_external_id=2".to_string()],
        );
        assert_ne!(a, b);
    }

    #[test]
    fn empty_dependency_set_hashes_to_fixed_value() {
        let expected = sha256_hex_of_lines(&["kind=dep_rev_hash:v1".to_string()]);
        assert_eq!(dependency_revisions_hash(&[]), expected);
    }

    #[test]
    fn dependency_revisions_hash_is_sensitive_to_output_revision() {
        let dep = |rev: i64| DependencyRevision {
            name: "followers".into(),
            asset_slug: AssetSlug::SegmentFollowers,
            params_hash: "a".repeat(64),
            output_revision: rev,
        };
        assert_ne!(
            dependency_revisions_hash(&[dep(0)]),
            dependency_revisions_hash(&[dep(1)])
        );
    }

    #[test]
    fn dependency_revisions_hash_is_order_sensitive() {
        let followers = DependencyRevision {
            name: "followers".into(),
            asset_slug: AssetSlug::SegmentFollowers,
            params_hash: "a".repeat(64),
            output_revision: 0,
        };
        let followed = DependencyRevision {
            name: "followed".into(),
            asset_slug: AssetSlug::SegmentFollowed,
            params_hash: "b".repeat(64),
            output_revision: 0,
        };
        let forward = dependency_revisions_hash(&[followers.clone(), followed.clone()]);
        let backward = dependency_revisions_hash(&[followed, followers]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn materialization_key_matches_is_exact() {
        let key = MaterializationKey {
            inputs_hash: "x".repeat(64),
            dependency_revisions_hash: "y".repeat(64),
        };
        assert!(key.matches(&"x".repeat(64), &"y".repeat(64)));
        assert!(!key.matches(&"z".repeat(64), &"y".repeat(64)));
    }

    proptest! {
        #[test]
        fn params_hash_is_deterministic(subject in 1i64..1_000_000) {
            let value = AssetParamsValue::SegmentFollowers {
                subject_external_id: UserId(subject),
                fanout_source_params_hash: None,
            };
            prop_assert_eq!(params_hash(&value), params_hash(&value));
        }
    }
}
