// SPDX-License-Identifier: MIT OR Apache-2.0
//! Newtype identifiers.
//!
//! Every primary key in the data model is wrapped in a distinct type so
//! that, say, an `AssetInstanceId` can never be passed where a
//! `MaterializationId` is expected — the compiler catches the mixup instead
//! of a query silently joining on the wrong column.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! int64_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// The wrapped raw value.
            #[must_use]
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

int64_id!(UserId, "Primary key of a `User` row; also the provider's external user id.");
int64_id!(PostId, "Primary key of a `Post` row; also the provider's external post id.");
int64_id!(IngestEventId, "Primary key of the parent `IngestEvent` row for one sync run.");
int64_id!(AssetParamsId, "Primary key of an `AssetParams` row.");
int64_id!(AssetInstanceId, "Primary key of an `AssetInstance` row; unique per `params_id`.");
int64_id!(AssetInstanceRootId, "Primary key of an `AssetInstanceRoot` row.");
int64_id!(AssetInstanceFanoutRootId, "Primary key of an `AssetInstanceFanoutRoot` row.");
int64_id!(MaterializationId, "Primary key of an `AssetMaterialization` row.");

/// An item under an asset's membership: either a user or a post.
///
/// Unlike the other newtypes this carries the [`ItemKind`] with it, since
/// membership rows and enter/exit events always need both to disambiguate
/// `item_id` across the two kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// Which table `id` refers to.
    pub kind: ItemKind,
    /// The raw id: a `UserId` or `PostId` depending on `kind`.
    pub id: i64,
}

impl ItemId {
    /// Construct an item id for a user.
    #[must_use]
    pub fn user(id: UserId) -> Self {
        Self {
            kind: ItemKind::User,
            id: id.0,
        }
    }

    /// Construct an item id for a post.
    #[must_use]
    pub fn post(id: PostId) -> Self {
        Self {
            kind: ItemKind::Post,
            id: id.0,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// The kind of entity an asset's membership contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Membership rows refer to `User` ids.
    User,
    /// Membership rows refer to `Post` ids.
    Post,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let u = UserId(7);
        let p = PostId(7);
        assert_eq!(u.get(), p.get());
        // The point of the newtype: this wouldn't compile if uncommented.
        // let _: UserId = p;
    }

    #[test]
    fn item_id_display() {
        assert_eq!(ItemId::user(UserId(42)).to_string(), "User:42");
        assert_eq!(ItemId::post(PostId(9)).to_string(), "Post:9");
    }

    #[test]
    fn item_id_ordering_is_by_kind_then_id() {
        let mut v = vec![ItemId::post(PostId(1)), ItemId::user(UserId(5)), ItemId::user(UserId(1))];
        v.sort();
        assert_eq!(
            v,
            vec![
                ItemId::user(UserId(1)),
                ItemId::user(UserId(5)),
                ItemId::post(PostId(1)),
            ]
        );
    }
}
