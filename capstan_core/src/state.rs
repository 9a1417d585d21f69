//! The internal model shared by every stage of a reconciliation cycle.
//!
//! Desired state is rebuilt from scratch each cycle and never mutated in
//! place; actual state is re-read from the target each cycle and never
//! cached across cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Skip;

/// A logical partition of the target system. Users, groups, and asset
/// grants are all scoped to a namespace.
#[derive(Clone, Deserialize, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Namespace(pub String);

impl Namespace {
    /// The namespace applied when a manifest entry omits one.
    pub const DEFAULT: &'static str = "default";
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace(Self::DEFAULT.to_owned())
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Namespace {
    fn from(val: &str) -> Self {
        Namespace(val.to_owned())
    }
}

/// The target system's user role tiers, ordered by ascending privilege.
///
/// The variant order matters: the optional precedence policy resolves
/// ambiguous role membership by privilege.
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Read-only consumer of published assets.
    Reader,
    /// Can author and publish assets.
    Author,
    /// Full administrative access within the namespace.
    Admin,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Reader => "READER",
            Role::Author => "AUTHOR",
            Role::Admin => "ADMIN",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READER" => Ok(Role::Reader),
            "AUTHOR" => Ok(Role::Author),
            "ADMIN" => Ok(Role::Admin),
            other => Err(format!("unrecognized role: {other}")),
        }
    }
}

/// The category of a governed asset.
///
/// Unrecognized categories are carried through opaquely rather than
/// rejected, so a manifest can govern asset types the reconciler has no
/// special knowledge of.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssetCategory {
    /// A data set.
    Dataset,
    /// A dashboard.
    Dashboard,
    /// A display theme.
    Theme,
    /// An analysis workspace.
    Analysis,
    /// A category the reconciler passes through without interpretation.
    Other(String),
}

impl AssetCategory {
    /// The permission levels a category supports, or `None` when the
    /// category is opaque and any level is accepted.
    pub fn supported_levels(&self) -> Option<&'static [PermissionLevel]> {
        match self {
            AssetCategory::Dataset | AssetCategory::Analysis => Some(&[
                PermissionLevel::Read,
                PermissionLevel::Write,
                PermissionLevel::Admin,
            ]),
            AssetCategory::Dashboard | AssetCategory::Theme => {
                Some(&[PermissionLevel::Read, PermissionLevel::Admin])
            }
            AssetCategory::Other(_) => None,
        }
    }
}

impl From<String> for AssetCategory {
    fn from(val: String) -> Self {
        match val.to_lowercase().as_str() {
            "dataset" => AssetCategory::Dataset,
            "dashboard" => AssetCategory::Dashboard,
            "theme" => AssetCategory::Theme,
            "analysis" => AssetCategory::Analysis,
            _ => AssetCategory::Other(val),
        }
    }
}

impl From<AssetCategory> for String {
    fn from(val: AssetCategory) -> Self {
        val.to_string()
    }
}

impl Display for AssetCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssetCategory::Dataset => "dataset",
            AssetCategory::Dashboard => "dashboard",
            AssetCategory::Theme => "theme",
            AssetCategory::Analysis => "analysis",
            AssetCategory::Other(o) => o.as_str(),
        };
        write!(f, "{s}")
    }
}

/// Strength of a permission grant. No total order is assumed across
/// categories; each category declares the levels it supports.
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    /// View the asset and its metadata.
    Read,
    /// Modify the asset.
    Write,
    /// Manage the asset, including its permissions.
    Admin,
}

impl Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionLevel::Read => "READ",
            PermissionLevel::Write => "WRITE",
            PermissionLevel::Admin => "ADMIN",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READ" => Ok(PermissionLevel::Read),
            "WRITE" => Ok(PermissionLevel::Write),
            "ADMIN" => Ok(PermissionLevel::Admin),
            other => Err(format!("unrecognized permission level: {other}")),
        }
    }
}

/// Composite key identifying a governed asset in the target system.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    /// The namespace the asset lives in.
    pub namespace: Namespace,
    /// The asset's category.
    pub category: AssetCategory,
    /// The asset's name, unique within (namespace, category).
    pub name: String,
}

impl Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.category, self.name)
    }
}

/// A user as fetched from the identity provider: identity plus the raw set
/// of provider group names they belong to.
///
/// This is also the persisted snapshot entry; the serialized shape
/// (`username`, `email`, `groups`) is a stable contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The provider-side login, used as the unique key.
    pub username: String,
    /// The user's email address.
    pub email: String,
    /// Names of every provider group the user belongs to, governed or not.
    pub groups: BTreeSet<String>,
}

/// How a recognized provider group maps into the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// The group designates a target-system role.
    Role(Role),
    /// The group is mirrored into the target system as a plain group.
    Governed,
}

impl GroupKind {
    /// Whether this group designates a role.
    pub fn is_role(&self) -> bool {
        matches!(self, GroupKind::Role(_))
    }

    /// Whether this group is mirrored as a plain target-system group.
    pub fn is_governed(&self) -> bool {
        matches!(self, GroupKind::Governed)
    }
}

/// A recognized identity-provider group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// The provider group name (unique key).
    pub name: String,
    /// The group's classification under the governance config.
    pub kind: GroupKind,
}

/// A governed asset and its desired permission grants, produced by the
/// manifest loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// The asset's composite key.
    pub key: AssetKey,
    /// Desired grants: group name to permission level.
    pub grants: BTreeMap<String, PermissionLevel>,
}

/// A target-system user as it should exist (desired) or as observed
/// (actual) within one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    /// The user's email address.
    pub email: String,
    /// The user's role in the namespace.
    pub role: Role,
    /// The governed groups the user belongs to in the namespace.
    pub member_of: BTreeSet<String>,
}

/// Users and groups within one namespace. The same shape serves desired
/// and actual state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceState {
    /// Users keyed by username.
    pub users: BTreeMap<String, UserSpec>,
    /// Governed group names present in the namespace.
    pub groups: BTreeSet<String>,
}

/// The full computed target of a cycle: what the target system should look
/// like. Built fresh each cycle from (users, groups, assets); immutable by
/// convention once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// Per-namespace users and groups.
    pub namespaces: BTreeMap<Namespace, NamespaceState>,
    /// Per-asset desired grants.
    pub grants: BTreeMap<AssetKey, BTreeMap<String, PermissionLevel>>,
    /// Per-entity items excluded while building, reported rather than
    /// silently dropped.
    pub skips: Vec<Skip>,
}

/// The target system's observed state at read time. May be stale by apply
/// time; the apply engine's idempotent retries absorb that, not locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualState {
    /// Per-namespace users and groups, for namespaces that exist and were
    /// read successfully.
    pub namespaces: BTreeMap<Namespace, NamespaceState>,
    /// Namespaces that do not exist in the target yet.
    pub missing: BTreeSet<Namespace>,
    /// Asset inventory and observed grants. Key presence means the asset
    /// exists in the target, even with no grants.
    pub assets: BTreeMap<AssetKey, BTreeMap<String, PermissionLevel>>,
    /// Namespaces whose read failed this cycle, with the failure reason.
    /// These are excluded from reconciliation and retried next cycle.
    pub unavailable: Vec<(Namespace, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_display() {
        for role in [Role::Reader, Role::Author, Role::Admin] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn role_ordering_follows_privilege() {
        assert!(Role::Reader < Role::Author);
        assert!(Role::Author < Role::Admin);
    }

    #[test]
    fn permission_level_parse_is_case_insensitive() {
        assert_eq!("read".parse::<PermissionLevel>(), Ok(PermissionLevel::Read));
        assert_eq!(
            "Write".parse::<PermissionLevel>(),
            Ok(PermissionLevel::Write)
        );
        assert!("owner".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn unknown_categories_pass_through() {
        let cat = AssetCategory::from("topic".to_owned());
        assert_eq!(cat, AssetCategory::Other("topic".to_owned()));
        assert_eq!(cat.supported_levels(), None);
        assert_eq!(cat.to_string(), "topic");
    }

    #[test]
    fn dashboard_does_not_support_write() {
        let levels = AssetCategory::Dashboard.supported_levels().unwrap();
        assert!(!levels.contains(&PermissionLevel::Write));
    }
}
