//! Permission levels, users, and effective-level resolution.
//!
//! # Invariants
//! - Resolution order per document: explicit user entry, then `default`,
//!   then the parent document, then `None`.
//! - Gamemaster-equivalent users always resolve to `Owner`.
//! - Resolution is pure: nothing is cached between calls.

use crate::model::source::SourceData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Source key holding the permission map.
pub const PERMISSION_KEY: &str = "permission";
/// Permission map key for the level granted to everyone not listed.
pub const DEFAULT_PERMISSION_KEY: &str = "default";

pub type UserId = String;

/// Access level a user holds over a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    None = 0,
    Limited = 1,
    Observer = 2,
    Owner = 3,
}

impl PermissionLevel {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.as_i64()? {
            0 => Some(Self::None),
            1 => Some(Self::Limited),
            2 => Some(Self::Observer),
            3 => Some(Self::Owner),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn is_owner(self) -> bool {
        self >= Self::Owner
    }

    /// Exactly `Limited`, not "at least".
    pub fn is_limited(self) -> bool {
        self == Self::Limited
    }

    pub fn is_visible(self) -> bool {
        self >= Self::Limited
    }
}

/// Platform-level role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    None = 0,
    Player = 1,
    Trusted = 2,
    Assistant = 3,
    Gamemaster = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
}

impl User {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    /// Assistants count as gamemasters for permission purposes.
    pub fn is_gm(&self) -> bool {
        self.role >= UserRole::Assistant
    }

    pub fn can_create_documents(&self) -> bool {
        self.role >= UserRole::Player
    }
}

/// Parsed view of one document's `permission` object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMap {
    pub default: Option<PermissionLevel>,
    pub users: BTreeMap<UserId, PermissionLevel>,
}

impl PermissionMap {
    /// Reads the map from `source`; malformed entries are ignored.
    pub fn from_source(source: &SourceData) -> Self {
        let Some(entries) = source.get(PERMISSION_KEY).and_then(Value::as_object) else {
            return Self::default();
        };

        let mut map = Self::default();
        for (key, value) in entries {
            let Some(level) = PermissionLevel::from_value(value) else {
                continue;
            };
            if key == DEFAULT_PERMISSION_KEY {
                map.default = Some(level);
            } else {
                map.users.insert(key.clone(), level);
            }
        }
        map
    }

    pub fn with_default(mut self, level: PermissionLevel) -> Self {
        self.default = Some(level);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>, level: PermissionLevel) -> Self {
        self.users.insert(user_id.into(), level);
        self
    }

    /// Own entry for `user_id`: explicit level first, then `default`.
    pub fn entry_for(&self, user_id: &str) -> Option<PermissionLevel> {
        self.users.get(user_id).copied().or(self.default)
    }

    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        if let Some(level) = self.default {
            object.insert(DEFAULT_PERMISSION_KEY.to_string(), level.as_i64().into());
        }
        for (user_id, level) in &self.users {
            object.insert(user_id.clone(), level.as_i64().into());
        }
        Value::Object(object)
    }
}

/// Resolves the effective level of `user` over a lineage of permission maps.
///
/// `lineage` starts with the document itself and continues with its parent,
/// grandparent and so on.
pub fn resolve_permission<I>(user: &User, lineage: I) -> PermissionLevel
where
    I: IntoIterator<Item = PermissionMap>,
{
    if user.is_gm() {
        return PermissionLevel::Owner;
    }
    lineage
        .into_iter()
        .find_map(|map| map.entry_for(&user.id))
        .unwrap_or(PermissionLevel::None)
}

/// Resolves `user`'s level over a document given its source and the sources
/// of its ancestors, nearest first.
pub fn permission_level(
    user: &User,
    source: &SourceData,
    ancestors: &[&SourceData],
) -> PermissionLevel {
    resolve_permission(
        user,
        std::iter::once(source)
            .chain(ancestors.iter().copied())
            .map(PermissionMap::from_source),
    )
}

#[cfg(test)]
mod tests {
    use super::{permission_level, PermissionLevel, PermissionMap, User, UserRole};
    use crate::model::source::SourceData;
    use serde_json::json;

    fn source(permission: serde_json::Value) -> SourceData {
        json!({"_id": "abcdefghijklmnop", "permission": permission})
            .as_object()
            .cloned()
            .expect("object")
    }

    fn player(id: &str) -> User {
        User::new(id, id, UserRole::Player)
    }

    #[test]
    fn explicit_entry_wins_over_default() {
        let doc = source(json!({"default": 1, "alice": 3}));
        assert_eq!(
            permission_level(&player("alice"), &doc, &[]),
            PermissionLevel::Owner
        );
        assert_eq!(
            permission_level(&player("bob"), &doc, &[]),
            PermissionLevel::Limited
        );
    }

    #[test]
    fn falls_back_to_parent_then_none() {
        let child = source(json!({}));
        let parent = source(json!({"bob": 2}));
        assert_eq!(
            permission_level(&player("bob"), &child, &[&parent]),
            PermissionLevel::Observer
        );
        assert_eq!(
            permission_level(&player("carol"), &child, &[&parent]),
            PermissionLevel::None
        );
    }

    #[test]
    fn own_default_shadows_parent_entry() {
        let child = source(json!({"default": 0}));
        let parent = source(json!({"bob": 3}));
        assert_eq!(
            permission_level(&player("bob"), &child, &[&parent]),
            PermissionLevel::None
        );
    }

    #[test]
    fn gamemaster_bypasses_the_map() {
        let doc = source(json!({"default": 0}));
        let gm = User::new("gm", "GM", UserRole::Gamemaster);
        let assistant = User::new("asst", "Assistant", UserRole::Assistant);
        assert_eq!(permission_level(&gm, &doc, &[]), PermissionLevel::Owner);
        assert_eq!(
            permission_level(&assistant, &doc, &[]),
            PermissionLevel::Owner
        );
    }

    #[test]
    fn limited_is_exact_and_visible_is_at_least() {
        assert!(PermissionLevel::Limited.is_limited());
        assert!(!PermissionLevel::Observer.is_limited());
        assert!(PermissionLevel::Observer.is_visible());
        assert!(!PermissionLevel::None.is_visible());
        assert!(PermissionLevel::Owner.is_owner());
        assert!(!PermissionLevel::Observer.is_owner());
    }

    #[test]
    fn malformed_entries_are_ignored_and_map_round_trips() {
        let doc = source(json!({"default": 9, "alice": "owner", "bob": 2}));
        let map = PermissionMap::from_source(&doc);
        assert_eq!(map.default, None);
        assert_eq!(map.users.len(), 1);
        assert_eq!(map.to_value(), json!({"bob": 2}));
    }

    #[test]
    fn granting_a_higher_explicit_level_never_lowers_resolution() {
        let levels = [
            PermissionLevel::None,
            PermissionLevel::Limited,
            PermissionLevel::Observer,
            PermissionLevel::Owner,
        ];
        for default in levels {
            let baseline = permission_level(
                &player("dave"),
                &source(json!({"default": default.as_i64()})),
                &[],
            );
            for explicit in levels.iter().filter(|level| **level >= default) {
                let map = PermissionMap::default()
                    .with_default(default)
                    .with_user("dave", *explicit);
                let granted = permission_level(&player("dave"), &source(map.to_value()), &[]);
                assert!(granted >= baseline);
            }
        }
    }
}
