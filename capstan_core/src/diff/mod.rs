//! Computing the edit set: the minimal ordered list of corrective
//! operations that takes actual state to desired state.
//!
//! Policy:
//! - Create: present in desired, absent in actual.
//! - Update: present in both with a different value.
//! - Delete: present in actual, absent in desired, and only ever within
//!   namespaces that are present in desired state and were successfully
//!   read this cycle. Partial information never causes destructive action.
//!
//! Ordering: creates before updates before deletes; within each phase,
//! namespace and group operations precede user operations precede asset
//! grant operations, since grants reference groups that must exist first.

pub mod grants;
pub mod groups;
pub mod users;

use std::collections::BTreeSet;
use std::fmt::Display;

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::config::CapstanConfig;
use crate::errors::Skip;
use crate::state::{ActualState, AssetKey, DesiredState, Namespace, PermissionLevel, Role};

/// All the diffs for a cycle, grouped by entity family.
#[derive(Debug, Clone, Default)]
pub struct GlobalDiffs {
    /// Namespaces that need to be created in the target
    pub namespaces: Vec<Namespace>,
    /// All the group-level diffs
    pub groups: Vec<groups::Diff>,
    /// All the user-level diffs
    pub users: Vec<users::Diff>,
    /// All the asset-grant diffs
    pub grants: Vec<grants::Diff>,
    /// Everything excluded from this cycle, with reasons
    pub skips: Vec<Skip>,
}

/// Get all the diffs between desired and actual state.
pub fn get_diffs(
    desired: &DesiredState,
    actual: &ActualState,
    config: &CapstanConfig,
) -> GlobalDiffs {
    let mut skips = desired.skips.clone();

    // Namespaces that failed to read are excluded from every family.
    let excluded: BTreeSet<Namespace> = actual
        .unavailable
        .iter()
        .map(|(ns, reason)| {
            skips.push(Skip::NamespaceUnavailable {
                namespace: ns.to_owned(),
                reason: reason.to_owned(),
            });
            ns.to_owned()
        })
        .collect();

    let namespaces = desired
        .namespaces
        .keys()
        .filter(|ns| actual.missing.contains(*ns) && !excluded.contains(*ns))
        .cloned()
        .collect();

    let group_diffs = groups::generate_diffs(desired, actual, &excluded);
    let user_diffs = users::generate_diffs(desired, actual, &excluded, config.policies.user_removal);
    let (grant_diffs, grant_skips) = grants::generate_diffs(desired, actual, &excluded);
    skips.extend(grant_skips);

    GlobalDiffs {
        namespaces,
        groups: group_diffs,
        users: user_diffs,
        grants: grant_diffs,
        skips,
    }
}

impl Display for GlobalDiffs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for namespace in &self.namespaces {
            writeln!(f, "{}", format!("+ namespace: {namespace}").green())?;
        }
        for diff in &self.groups {
            write!(f, "{diff}")?;
        }
        for diff in &self.users {
            write!(f, "{diff}")?;
        }
        for diff in &self.grants {
            write!(f, "{diff}")?;
        }
        Ok(())
    }
}

impl GlobalDiffs {
    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.groups.is_empty()
            && self.users.is_empty()
            && self.grants.is_empty()
    }

    /// Flatten the diffs into the ordered operation list the apply engine
    /// executes.
    pub fn into_edit_set(self) -> EditSet {
        let mut ops = Vec::new();

        for namespace in self.namespaces {
            ops.push(Operation {
                phase: Phase::Create,
                namespace,
                kind: OpKind::EnsureNamespace,
            });
        }

        for diff in self.groups {
            let (phase, kind) = match diff.details {
                groups::DiffDetails::AddGroup => (
                    Phase::Create,
                    OpKind::CreateGroup {
                        group: diff.group_name,
                    },
                ),
                groups::DiffDetails::RemoveGroup => (
                    Phase::Delete,
                    OpKind::DeleteGroup {
                        group: diff.group_name,
                    },
                ),
            };
            ops.push(Operation {
                phase,
                namespace: diff.namespace,
                kind,
            });
        }

        for diff in self.users {
            match diff.details {
                users::DiffDetails::AddUser {
                    email,
                    role,
                    member_of,
                } => {
                    ops.push(Operation {
                        phase: Phase::Create,
                        namespace: diff.namespace.clone(),
                        kind: OpKind::CreateUser {
                            username: diff.username.clone(),
                            email,
                            role,
                        },
                    });
                    for group in member_of {
                        ops.push(Operation {
                            phase: Phase::Create,
                            namespace: diff.namespace.clone(),
                            kind: OpKind::AddMember {
                                group,
                                username: diff.username.clone(),
                            },
                        });
                    }
                }
                users::DiffDetails::ModifyUser {
                    role,
                    add_member_of,
                    remove_member_of,
                } => {
                    if let Some((_, wanted)) = role {
                        ops.push(Operation {
                            phase: Phase::Update,
                            namespace: diff.namespace.clone(),
                            kind: OpKind::SetUserRole {
                                username: diff.username.clone(),
                                role: wanted,
                            },
                        });
                    }
                    for group in add_member_of {
                        ops.push(Operation {
                            phase: Phase::Create,
                            namespace: diff.namespace.clone(),
                            kind: OpKind::AddMember {
                                group,
                                username: diff.username.clone(),
                            },
                        });
                    }
                    for group in remove_member_of {
                        ops.push(Operation {
                            phase: Phase::Delete,
                            namespace: diff.namespace.clone(),
                            kind: OpKind::RemoveMember {
                                group,
                                username: diff.username.clone(),
                            },
                        });
                    }
                }
                users::DiffDetails::RetireUser => {
                    ops.push(Operation {
                        phase: Phase::Delete,
                        namespace: diff.namespace,
                        kind: OpKind::RetireUser {
                            username: diff.username,
                        },
                    });
                }
                users::DiffDetails::RemoveUser => {
                    ops.push(Operation {
                        phase: Phase::Delete,
                        namespace: diff.namespace,
                        kind: OpKind::DeleteUser {
                            username: diff.username,
                        },
                    });
                }
            }
        }

        for diff in self.grants {
            let namespace = diff.asset.namespace.clone();
            match diff.details {
                grants::DiffDetails::SetGrant { level, prior } => {
                    ops.push(Operation {
                        phase: if prior.is_some() {
                            Phase::Update
                        } else {
                            Phase::Create
                        },
                        namespace,
                        kind: OpKind::SetGrant {
                            asset: diff.asset,
                            group: diff.group_name,
                            level,
                        },
                    });
                }
                grants::DiffDetails::RevokeGrant => {
                    ops.push(Operation {
                        phase: Phase::Delete,
                        namespace,
                        kind: OpKind::RevokeGrant {
                            asset: diff.asset,
                            group: diff.group_name,
                        },
                    });
                }
            }
        }

        ops.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        EditSet {
            ops,
            skips: self.skips,
        }
    }
}

/// Which edit phase an operation belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Present in desired, absent in actual.
    Create,
    /// Present in both with a different value.
    Update,
    /// Present in actual, absent in desired.
    Delete,
}

/// One corrective operation against the target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// The operation's edit phase, used for ordering and idempotent
    /// error absorption.
    pub phase: Phase,
    /// The namespace the operation applies to.
    pub namespace: Namespace,
    /// What to do.
    pub kind: OpKind,
}

/// The concrete operation kinds the apply engine can dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Create the namespace itself.
    EnsureNamespace,
    /// Create a group.
    CreateGroup {
        /// The group to create.
        group: String,
    },
    /// Delete a group.
    DeleteGroup {
        /// The group to delete.
        group: String,
    },
    /// Register a user.
    CreateUser {
        /// The username to register.
        username: String,
        /// The user's email.
        email: String,
        /// The initial role.
        role: Role,
    },
    /// Change a user's role.
    SetUserRole {
        /// The user to change.
        username: String,
        /// The role to set.
        role: Role,
    },
    /// Withdraw a user's role and memberships, keeping the account.
    RetireUser {
        /// The user to retire.
        username: String,
    },
    /// Delete a user's account.
    DeleteUser {
        /// The user to delete.
        username: String,
    },
    /// Add a user to a group.
    AddMember {
        /// The group to add to.
        group: String,
        /// The user to add.
        username: String,
    },
    /// Remove a user from a group.
    RemoveMember {
        /// The group to remove from.
        group: String,
        /// The user to remove.
        username: String,
    },
    /// Grant a group a level on an asset.
    SetGrant {
        /// The asset to grant on.
        asset: AssetKey,
        /// The grantee group.
        group: String,
        /// The level to grant.
        level: PermissionLevel,
    },
    /// Revoke a group's grant on an asset.
    RevokeGrant {
        /// The asset to revoke on.
        asset: AssetKey,
        /// The grantee group.
        group: String,
    },
}

impl Operation {
    /// The operation's dependency tier within its phase: namespaces and
    /// groups first, then users, then memberships, then grants.
    pub fn tier(&self) -> u8 {
        match &self.kind {
            OpKind::EnsureNamespace => 0,
            OpKind::CreateGroup { .. } | OpKind::DeleteGroup { .. } => 1,
            OpKind::CreateUser { .. }
            | OpKind::SetUserRole { .. }
            | OpKind::RetireUser { .. }
            | OpKind::DeleteUser { .. } => 2,
            OpKind::AddMember { .. } | OpKind::RemoveMember { .. } => 3,
            OpKind::SetGrant { .. } | OpKind::RevokeGrant { .. } => 4,
        }
    }

    fn sort_key(&self) -> (Phase, u8, String) {
        (self.phase, self.tier(), format!("{self}"))
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OpKind::EnsureNamespace => write!(f, "create namespace {}", self.namespace),
            OpKind::CreateGroup { group } => {
                write!(f, "create group {}/{group}", self.namespace)
            }
            OpKind::DeleteGroup { group } => {
                write!(f, "delete group {}/{group}", self.namespace)
            }
            OpKind::CreateUser { username, role, .. } => {
                write!(f, "create user {}/{username} as {role}", self.namespace)
            }
            OpKind::SetUserRole { username, role } => {
                write!(f, "set role {role} on {}/{username}", self.namespace)
            }
            OpKind::RetireUser { username } => {
                write!(f, "retire user {}/{username}", self.namespace)
            }
            OpKind::DeleteUser { username } => {
                write!(f, "delete user {}/{username}", self.namespace)
            }
            OpKind::AddMember { group, username } => {
                write!(f, "add {}/{username} to {group}", self.namespace)
            }
            OpKind::RemoveMember { group, username } => {
                write!(f, "remove {}/{username} from {group}", self.namespace)
            }
            OpKind::SetGrant {
                asset,
                group,
                level,
            } => write!(f, "grant {level} on {asset} to {group}"),
            OpKind::RevokeGrant { asset, group } => {
                write!(f, "revoke grant on {asset} from {group}")
            }
        }
    }
}

/// The ordered operation list for a cycle, plus everything that was
/// excluded with a reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditSet {
    /// Operations in apply order.
    pub ops: Vec<Operation>,
    /// Excluded items, carried into the apply report.
    pub skips: Vec<Skip>,
}

impl EditSet {
    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AssetCategory, UserSpec};

    fn config() -> CapstanConfig {
        CapstanConfig::new()
    }

    fn ns(name: &str) -> Namespace {
        Namespace::from(name)
    }

    fn user_spec(role: Role, member_of: &[&str]) -> UserSpec {
        UserSpec {
            email: "u@example.com".to_owned(),
            role,
            member_of: member_of.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn dataset(namespace: &str, name: &str) -> AssetKey {
        AssetKey {
            namespace: ns(namespace),
            category: AssetCategory::Dataset,
            name: name.to_owned(),
        }
    }

    #[test]
    fn creates_updates_and_deletes_are_detected() {
        let mut desired = DesiredState::default();
        let dns = desired.namespaces.entry(ns("default")).or_default();
        dns.users
            .insert("new@example.com".to_owned(), user_spec(Role::Author, &[]));
        dns.users.insert(
            "changed@example.com".to_owned(),
            user_spec(Role::Admin, &[]),
        );

        let mut actual = ActualState::default();
        let ans = actual.namespaces.entry(ns("default")).or_default();
        ans.users.insert(
            "changed@example.com".to_owned(),
            user_spec(Role::Reader, &[]),
        );
        ans.users
            .insert("gone@example.com".to_owned(), user_spec(Role::Reader, &[]));

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();

        assert_eq!(edit_set.ops.len(), 3);
        assert!(matches!(
            &edit_set.ops[0].kind,
            OpKind::CreateUser { username, role: Role::Author, .. } if username == "new@example.com"
        ));
        assert!(matches!(
            &edit_set.ops[1].kind,
            OpKind::SetUserRole { username, role: Role::Admin } if username == "changed@example.com"
        ));
        // default policy retires rather than deletes
        assert!(matches!(
            &edit_set.ops[2].kind,
            OpKind::RetireUser { username } if username == "gone@example.com"
        ));
    }

    #[test]
    fn operations_are_ordered_by_phase_then_tier() {
        let mut desired = DesiredState::default();
        let dns = desired.namespaces.entry(ns("default")).or_default();
        dns.groups.insert("qs_group_ops".to_owned());
        dns.users.insert(
            "new@example.com".to_owned(),
            user_spec(Role::Author, &["qs_group_ops"]),
        );
        desired
            .grants
            .entry(dataset("default", "d1"))
            .or_default()
            .insert("qs_group_ops".to_owned(), PermissionLevel::Read);

        let mut actual = ActualState::default();
        let ans = actual.namespaces.entry(ns("default")).or_default();
        ans.groups.insert("qs_group_stale".to_owned());
        actual
            .assets
            .insert(dataset("default", "d1"), Default::default());

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();
        let kinds: Vec<(Phase, u8)> = edit_set
            .ops
            .iter()
            .map(|op| (op.phase, op.tier()))
            .collect();

        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted);

        // group create precedes the membership and the grant that use it
        assert!(matches!(edit_set.ops[0].kind, OpKind::CreateGroup { .. }));
        assert!(matches!(
            edit_set.ops.last().unwrap().kind,
            OpKind::DeleteGroup { .. }
        ));
    }

    #[test]
    fn namespaces_absent_from_desired_are_never_deleted_from() {
        let mut desired = DesiredState::default();
        desired.namespaces.entry(ns("default")).or_default();

        let mut actual = ActualState::default();
        actual.namespaces.entry(ns("default")).or_default();
        // the target has another namespace the reconciler never read
        let other = actual.namespaces.entry(ns("marketing")).or_default();
        other
            .users
            .insert("x@example.com".to_owned(), user_spec(Role::Reader, &[]));

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();

        assert!(edit_set
            .ops
            .iter()
            .all(|op| op.namespace == ns("default")));
        assert!(edit_set.ops.is_empty());
    }

    #[test]
    fn unavailable_namespaces_are_skipped_not_failed() {
        let mut desired = DesiredState::default();
        let dns = desired.namespaces.entry(ns("default")).or_default();
        dns.users
            .insert("new@example.com".to_owned(), user_spec(Role::Author, &[]));
        let fns = desired.namespaces.entry(ns("finance")).or_default();
        fns.users
            .insert("fin@example.com".to_owned(), user_spec(Role::Reader, &[]));

        let mut actual = ActualState::default();
        actual.namespaces.entry(ns("default")).or_default();
        actual
            .unavailable
            .push((ns("finance"), "target read failed: 503".to_owned()));

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();

        assert!(edit_set.ops.iter().all(|op| op.namespace == ns("default")));
        assert!(edit_set.skips.iter().any(|s| matches!(
            s,
            Skip::NamespaceUnavailable { namespace, .. } if namespace == &ns("finance")
        )));
    }

    #[test]
    fn governed_asset_missing_from_target_is_a_skip() {
        let mut desired = DesiredState::default();
        desired.namespaces.entry(ns("default")).or_default();
        desired
            .grants
            .entry(dataset("default", "dataset_example_1"))
            .or_default()
            .insert("qs_group_finance".to_owned(), PermissionLevel::Read);

        let mut actual = ActualState::default();
        actual.namespaces.entry(ns("default")).or_default();

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();

        assert!(edit_set.ops.is_empty());
        assert!(matches!(
            &edit_set.skips[0],
            Skip::AssetNotFound { asset } if asset.name == "dataset_example_1"
        ));
    }

    #[test]
    fn grant_level_changes_are_updates() {
        let mut desired = DesiredState::default();
        desired.namespaces.entry(ns("default")).or_default();
        desired
            .grants
            .entry(dataset("default", "d1"))
            .or_default()
            .insert("qs_group_ops".to_owned(), PermissionLevel::Write);

        let mut actual = ActualState::default();
        actual.namespaces.entry(ns("default")).or_default();
        actual.assets.insert(
            dataset("default", "d1"),
            [("qs_group_ops".to_owned(), PermissionLevel::Read)].into(),
        );

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();

        assert_eq!(edit_set.ops.len(), 1);
        assert_eq!(edit_set.ops[0].phase, Phase::Update);
        assert!(matches!(
            &edit_set.ops[0].kind,
            OpKind::SetGrant { level: PermissionLevel::Write, .. }
        ));
    }

    #[test]
    fn missing_desired_namespace_is_created() {
        let mut desired = DesiredState::default();
        desired.namespaces.entry(ns("default")).or_default();

        let mut actual = ActualState::default();
        actual.missing.insert(ns("default"));

        let edit_set = get_diffs(&desired, &actual, &config()).into_edit_set();
        assert!(matches!(edit_set.ops[0].kind, OpKind::EnsureNamespace));
    }
}
