// SPDX-License-Identifier: MIT OR Apache-2.0
//! Asset identity: slugs, typed params, instances, roots, and fanout roots.

use crate::ids::{AssetInstanceFanoutRootId, AssetInstanceId, AssetInstanceRootId, AssetParamsId, MaterializationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The six asset kinds this engine knows how to materialize.
///
/// Stored as its lowercase wire name everywhere (params rows, planner
/// events, CLI arguments) so logs and the `asset_slug` column always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSlug {
    /// An operator-specified, fixed set of users.
    SegmentSpecifiedUsers,
    /// Active followers of a subject user.
    SegmentFollowers,
    /// Active followings ("followed") of a subject user.
    SegmentFollowed,
    /// Intersection of a subject's followers and followings.
    SegmentMutuals,
    /// Followed accounts that do not follow back.
    SegmentUnreciprocatedFollowed,
    /// Posts authored by the members of a source segment.
    PostCorpusForSegment,
}

impl AssetSlug {
    /// All known slugs, in declaration order. Used by the registry to
    /// iterate a fixed, stable set and by tests enumerating coverage.
    pub const ALL: [AssetSlug; 6] = [
        AssetSlug::SegmentSpecifiedUsers,
        AssetSlug::SegmentFollowers,
        AssetSlug::SegmentFollowed,
        AssetSlug::SegmentMutuals,
        AssetSlug::SegmentUnreciprocatedFollowed,
        AssetSlug::PostCorpusForSegment,
    ];

    /// The stable lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SegmentSpecifiedUsers => "segment_specified_users",
            Self::SegmentFollowers => "segment_followers",
            Self::SegmentFollowed => "segment_followed",
            Self::SegmentMutuals => "segment_mutuals",
            Self::SegmentUnreciprocatedFollowed => "segment_unreciprocated_followed",
            Self::PostCorpusForSegment => "post_corpus_for_segment",
        }
    }
}

impl std::fmt::Display for AssetSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetSlug {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|slug| slug.as_str() == s)
            .ok_or_else(|| format!("unknown asset slug: {s}"))
    }
}

/// How a fanout root expands into derived target instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// One derived instance per item, shared across every source instance
    /// that fans out to the same target slug. The derived params carry no
    /// `fanout_source_params_hash`.
    GlobalPerItem,
    /// One derived instance per item, scoped to the originating source
    /// instance's params hash via `fanout_source_params_hash`. Two sources
    /// fanning out the same item to the same slug get distinct instances.
    ScopedBySource,
}

/// Typed per-slug identity and configuration fields carried by an
/// `AssetParams` row.
///
/// Each variant's fields are exactly the identity parts named for that
/// slug's params hash, plus whatever non-identity configuration the slug
/// needs (e.g. `specified_user_ids`, which is content but not part of the
/// hash — two params rows with the same `stable_key` but different member
/// lists would collide on purpose, since the stable key *is* the identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "asset_slug", rename_all = "snake_case")]
pub enum AssetParamsValue {
    /// `segment_specified_users` params.
    SegmentSpecifiedUsers {
        /// Operator-chosen stable identity key for this segment.
        stable_key: String,
        /// The fixed member set; content, not identity.
        specified_user_ids: Vec<UserId>,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
    /// `segment_followers` params.
    SegmentFollowers {
        /// The user whose followers this segment tracks.
        subject_external_id: UserId,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
    /// `segment_followed` params.
    SegmentFollowed {
        /// The user whose followings this segment tracks.
        subject_external_id: UserId,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
    /// `segment_mutuals` params.
    SegmentMutuals {
        /// The user whose mutuals this segment tracks.
        subject_external_id: UserId,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
    /// `segment_unreciprocated_followed` params.
    SegmentUnreciprocatedFollowed {
        /// The user whose one-way followed accounts this segment tracks.
        subject_external_id: UserId,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
    /// `post_corpus_for_segment` params.
    PostCorpusForSegment {
        /// Slug of the source segment this corpus is derived from.
        source_segment_asset_slug: AssetSlug,
        /// Params id of the source segment instance.
        source_segment_params_id: AssetParamsId,
        /// Params hash of the source segment instance, duplicated out for
        /// hashing without a store round trip.
        source_segment_params_hash: String,
        /// Set iff this instance was created by a fanout expansion.
        fanout_source_params_hash: Option<String>,
    },
}

impl AssetParamsValue {
    /// The slug this params value belongs to.
    #[must_use]
    pub fn asset_slug(&self) -> AssetSlug {
        match self {
            Self::SegmentSpecifiedUsers { .. } => AssetSlug::SegmentSpecifiedUsers,
            Self::SegmentFollowers { .. } => AssetSlug::SegmentFollowers,
            Self::SegmentFollowed { .. } => AssetSlug::SegmentFollowed,
            Self::SegmentMutuals { .. } => AssetSlug::SegmentMutuals,
            Self::SegmentUnreciprocatedFollowed { .. } => AssetSlug::SegmentUnreciprocatedFollowed,
            Self::PostCorpusForSegment { .. } => AssetSlug::PostCorpusForSegment,
        }
    }

    /// The `fanout_source_params_hash` field carried by every variant.
    #[must_use]
    pub fn fanout_source_params_hash(&self) -> Option<&str> {
        match self {
            Self::SegmentSpecifiedUsers {
                fanout_source_params_hash,
                ..
            }
            | Self::SegmentFollowers {
                fanout_source_params_hash,
                ..
            }
            | Self::SegmentFollowed {
                fanout_source_params_hash,
                ..
            }
            | Self::SegmentMutuals {
                fanout_source_params_hash,
                ..
            }
            | Self::SegmentUnreciprocatedFollowed {
                fanout_source_params_hash,
                ..
            }
            | Self::PostCorpusForSegment {
                fanout_source_params_hash,
                ..
            } => fanout_source_params_hash.as_deref(),
        }
    }
}

/// Row identifying one unique `(asset_slug, params_hash, params_hash_version)`
/// combination and its typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetParams {
    /// Primary key.
    pub id: AssetParamsId,
    /// Hex-encoded params hash.
    pub params_hash: String,
    /// Version of the params-hash algorithm that produced `params_hash`.
    pub params_hash_version: i32,
    /// Typed identity and configuration fields.
    pub value: AssetParamsValue,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One materialized instance of a given `AssetParams`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInstance {
    /// Primary key.
    pub id: AssetInstanceId,
    /// The params this is an instance of; unique per instance.
    pub params_id: AssetParamsId,
    /// The current checkpoint materialization, if any has ever succeeded.
    pub checkpoint_materialization_id: Option<MaterializationId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An enabled (or previously enabled) root: an instance the planner should
/// materialize directly, without being reached via a fanout or dependency
/// edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInstanceRoot {
    /// Primary key.
    pub id: AssetInstanceRootId,
    /// The instance this root points at; unique per root row.
    pub instance_id: AssetInstanceId,
    /// When this root was disabled, if it has been.
    pub disabled_at: Option<DateTime<Utc>>,
}

/// A fanout root: "expand this source instance's membership into derived
/// instances of `target_asset_slug`, one per item, per `fanout_mode`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInstanceFanoutRoot {
    /// Primary key.
    pub id: AssetInstanceFanoutRootId,
    /// The instance whose membership drives this fanout.
    pub source_instance_id: AssetInstanceId,
    /// The slug derived instances belong to.
    pub target_asset_slug: AssetSlug,
    /// How derived instances are scoped.
    pub fanout_mode: FanoutMode,
    /// When this fanout root was disabled, if it has been.
    pub disabled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_slug_round_trips_through_str() {
        for slug in AssetSlug::ALL {
            let s = slug.to_string();
            assert_eq!(s.parse::<AssetSlug>().unwrap(), slug);
        }
    }

    #[test]
    fn unknown_slug_string_is_rejected() {
        assert!("segment_unknown".parse::<AssetSlug>().is_err());
    }

    #[test]
    fn params_value_reports_its_own_slug() {
        let v = AssetParamsValue::SegmentFollowers {
            subject_external_id: UserId(1),
            fanout_source_params_hash: None,
        };
        assert_eq!(v.asset_slug(), AssetSlug::SegmentFollowers);
        assert_eq!(v.fanout_source_params_hash(), None);
    }

    #[test]
    fn params_value_exposes_fanout_source_hash() {
        let v = AssetParamsValue::SegmentSpecifiedUsers {
            stable_key: "k".into(),
            specified_user_ids: vec![],
            fanout_source_params_hash: Some("abc".into()),
        };
        assert_eq!(v.fanout_source_params_hash(), Some("abc"));
    }
}
