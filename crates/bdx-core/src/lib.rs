// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Stable domain types for the birdex asset materialization engine.
//!
//! If you only take one dependency from this workspace, take this one: it
//! defines the newtype ids, enums, and plain-data records that every other
//! `bdx-*` crate passes across its boundaries.

/// Newtype identifiers over `i64`/`String` primary keys.
pub mod ids;
/// Ingest run records: the parent `IngestEvent` and per-kind child rows.
pub mod ingest;
/// Asset identity: slugs, params, instances, roots, fanout roots.
pub mod asset;
/// Materializations, membership snapshots, and enter/exit events.
pub mod materialize;
/// Users, follow edges, posts, and handle history.
pub mod social;

pub use ids::*;
pub use ingest::*;
pub use asset::*;
pub use materialize::*;
pub use social::*;

/// Current schema/contract version string, embedded in planner events and
/// logs for forward-compatibility triage.
pub const CONTRACT_VERSION: &str = "birdex/v1";

/// The hash algorithm version used by every hash the `bdx-hash` crate
/// produces today. Bumped only alongside a matching change to the hashing
/// rules.
pub const PARAMS_HASH_VERSION: i32 = 1;
