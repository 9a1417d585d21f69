//! Building desired state.
//!
//! `build` is a pure function of its inputs: it is rebuilt from scratch
//! every cycle, never patched incrementally, so the same users, groups,
//! and assets always produce the same desired state.

use std::collections::BTreeSet;

use crate::config::{AmbiguityPolicy, CapstanConfig};
use crate::errors::Skip;
use crate::state::{
    Asset, DesiredState, Group, GroupKind, PermissionLevel, Role, User, UserSpec,
};

/// Compute the desired target-system state from the identity snapshot and
/// the governed assets.
pub fn build(
    users: &[User],
    groups: &[Group],
    assets: &[Asset],
    config: &CapstanConfig,
) -> DesiredState {
    let identity = &config.identity;
    let home = identity.namespace.clone();

    let mut state = DesiredState::default();
    // The identity namespace is always governed, even before the first
    // user shows up in it.
    state.namespaces.entry(home.clone()).or_default();

    for user in users {
        let matched: BTreeSet<Role> = user
            .groups
            .iter()
            .filter_map(|g| match identity.classify(g) {
                Some(GroupKind::Role(role)) => Some(role),
                _ => None,
            })
            .collect();

        let role = match matched.len() {
            // No role group: the user gets no target-system account at all.
            0 => continue,
            1 => *matched.iter().next().expect("len checked"),
            _ => match config.policies.ambiguity {
                AmbiguityPolicy::Precedence => {
                    match config
                        .policies
                        .role_precedence
                        .iter()
                        .find(|r| matched.contains(r))
                    {
                        Some(role) => *role,
                        // Matched roles that the precedence list never
                        // mentions are still ambiguous.
                        None => {
                            state.skips.push(ambiguous(&home, user, &matched));
                            continue;
                        }
                    }
                }
                AmbiguityPolicy::Reject => {
                    state.skips.push(ambiguous(&home, user, &matched));
                    continue;
                }
            },
        };

        let member_of: BTreeSet<String> = user
            .groups
            .iter()
            .filter(|g| matches!(identity.classify(g), Some(GroupKind::Governed)))
            .cloned()
            .collect();

        let ns_state = state.namespaces.entry(home.clone()).or_default();
        ns_state.groups.extend(member_of.iter().cloned());
        ns_state.users.insert(
            user.username.clone(),
            UserSpec {
                email: user.email.clone(),
                role,
                member_of,
            },
        );
    }

    for group in groups {
        if group.kind.is_governed() {
            state
                .namespaces
                .entry(home.clone())
                .or_default()
                .groups
                .insert(group.name.clone());
        }
    }

    for asset in assets {
        let mut keep: Vec<(String, PermissionLevel)> = Vec::new();
        let mut materialize: Vec<String> = Vec::new();

        for (group, level) in &asset.grants {
            let known = state
                .namespaces
                .get(&asset.key.namespace)
                .map(|s| s.groups.contains(group))
                .unwrap_or(false)
                || materialize.contains(group);

            if known {
                keep.push((group.clone(), *level));
            } else if config.policies.materialize_referenced_groups
                && matches!(identity.classify(group), Some(GroupKind::Governed))
            {
                materialize.push(group.clone());
                keep.push((group.clone(), *level));
            } else {
                state.skips.push(Skip::UnknownGroupReference {
                    asset: asset.key.clone(),
                    group: group.clone(),
                });
            }
        }

        if !keep.is_empty() {
            let ns_state = state.namespaces.entry(asset.key.namespace.clone()).or_default();
            ns_state.groups.extend(materialize);
            state
                .grants
                .entry(asset.key.clone())
                .or_default()
                .extend(keep);
        }
    }

    // Keep the output independent of input ordering.
    state.skips.sort_by_key(|s| s.to_string());
    state
}

fn ambiguous(namespace: &crate::state::Namespace, user: &User, matched: &BTreeSet<Role>) -> Skip {
    Skip::AmbiguousRole {
        namespace: namespace.clone(),
        username: user.username.clone(),
        matched: matched.iter().copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest;
    use crate::state::{AssetCategory, AssetKey, Namespace};

    fn user(name: &str, groups: &[&str]) -> User {
        User {
            username: name.to_owned(),
            email: name.to_owned(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn groups_for(users: &[User], config: &CapstanConfig) -> Vec<Group> {
        crate::fetch::IdentitySnapshot {
            users: users.to_vec(),
        }
        .groups(&config.identity)
    }

    fn dataset(name: &str) -> AssetKey {
        AssetKey {
            namespace: Namespace::default(),
            category: AssetCategory::Dataset,
            name: name.to_owned(),
        }
    }

    #[test]
    fn role_resolves_from_mixed_group_sets() {
        let config = CapstanConfig::new();
        let users = vec![user(
            "qs4@example.com",
            &[
                "Everyone",
                "qs_role_author",
                "aws_012345678901_QSGovernance-FederatedQuickSightRole",
            ],
        )];
        let groups = groups_for(&users, &config);
        let state = build(&users, &groups, &[], &config);

        let ns = &state.namespaces[&Namespace::default()];
        assert_eq!(ns.users["qs4@example.com"].role, Role::Author);
        assert!(ns.users["qs4@example.com"].member_of.is_empty());
        assert!(state.skips.is_empty());
    }

    #[test]
    fn roleless_users_are_excluded_entirely() {
        let config = CapstanConfig::new();
        let users = vec![user("nobody@example.com", &["Everyone", "qs_group_ops"])];
        let groups = groups_for(&users, &config);
        let state = build(&users, &groups, &[], &config);

        let ns = &state.namespaces[&Namespace::default()];
        assert!(ns.users.is_empty());
        // The governed group still exists: it has a (roleless) member in
        // the provider, and other users may be granted through it.
        assert!(ns.groups.contains("qs_group_ops"));
        assert!(state.skips.is_empty());
    }

    #[test]
    fn ambiguous_roles_are_rejected_by_default() {
        let config = CapstanConfig::new();
        let users = vec![user("both@example.com", &["qs_role_admin", "qs_role_reader"])];
        let groups = groups_for(&users, &config);
        let state = build(&users, &groups, &[], &config);

        assert!(state.namespaces[&Namespace::default()].users.is_empty());
        assert_eq!(state.skips.len(), 1);
        assert!(matches!(
            &state.skips[0],
            Skip::AmbiguousRole { username, matched, .. }
                if username == "both@example.com" && matched.len() == 2
        ));
    }

    #[test]
    fn precedence_policy_resolves_ambiguity() {
        let mut config = CapstanConfig::new();
        config.policies.ambiguity = AmbiguityPolicy::Precedence;
        let users = vec![user("both@example.com", &["qs_role_admin", "qs_role_reader"])];
        let groups = groups_for(&users, &config);
        let state = build(&users, &groups, &[], &config);

        let ns = &state.namespaces[&Namespace::default()];
        assert_eq!(ns.users["both@example.com"].role, Role::Admin);
        assert!(state.skips.is_empty());
    }

    #[test]
    fn governed_groups_become_memberships() {
        let config = CapstanConfig::new();
        let users = vec![user(
            "qs1@example.com",
            &["qs_role_admin", "qs_group_ops", "qs_group_finance"],
        )];
        let groups = groups_for(&users, &config);
        let state = build(&users, &groups, &[], &config);

        let ns = &state.namespaces[&Namespace::default()];
        assert_eq!(
            ns.users["qs1@example.com"].member_of,
            ["qs_group_ops", "qs_group_finance"]
                .into_iter()
                .map(str::to_owned)
                .collect()
        );
        assert!(ns.groups.contains("qs_group_ops"));
        // role groups are not mirrored as plain groups
        assert!(!ns.groups.contains("qs_role_admin"));
    }

    #[test]
    fn unknown_group_references_are_skipped_not_dropped() {
        let config = CapstanConfig::new();
        let users = vec![user("qs1@example.com", &["qs_role_admin"])];
        let groups = groups_for(&users, &config);
        let assets = manifest::load(
            br#"{"assets":[{"name":"dataset_example_1","category":"dataset",
                 "groups":["qs_group_finance"],"permission":"READ"}]}"#,
        )
        .unwrap();

        let state = build(&users, &groups, &assets, &config);

        assert!(state.grants.is_empty());
        assert_eq!(state.skips.len(), 1);
        assert!(matches!(
            &state.skips[0],
            Skip::UnknownGroupReference { asset, group }
                if asset == &dataset("dataset_example_1") && group == "qs_group_finance"
        ));
    }

    #[test]
    fn materialization_policy_keeps_the_grant() {
        let mut config = CapstanConfig::new();
        config.policies.materialize_referenced_groups = true;
        let users = vec![user("qs1@example.com", &["qs_role_admin"])];
        let groups = groups_for(&users, &config);
        let assets = manifest::load(
            br#"{"assets":[{"name":"dataset_example_1","category":"dataset",
                 "groups":["qs_group_finance"],"permission":"READ"}]}"#,
        )
        .unwrap();

        let state = build(&users, &groups, &assets, &config);

        let ns = &state.namespaces[&Namespace::default()];
        assert!(ns.groups.contains("qs_group_finance"));
        assert_eq!(
            state.grants[&dataset("dataset_example_1")]["qs_group_finance"],
            PermissionLevel::Read
        );
        assert!(state.skips.is_empty());
    }

    #[test]
    fn build_is_deterministic_under_input_reordering() {
        let config = CapstanConfig::new();
        let mut users = vec![
            user("b@example.com", &["qs_role_reader", "qs_group_ops"]),
            user("a@example.com", &["qs_role_admin", "qs_group_finance"]),
            user("c@example.com", &["qs_role_admin", "qs_role_reader"]),
        ];
        let groups = groups_for(&users, &config);
        let assets = manifest::load(
            br#"{"assets":[
                {"name":"d1","category":"dataset","groups":["qs_group_ops"],"permission":"READ"},
                {"name":"d2","category":"dataset","groups":["qs_group_missing"],"permission":"READ"}
            ]}"#,
        )
        .unwrap();

        let forward = build(&users, &groups, &assets, &config);
        users.reverse();
        let mut reordered_groups = groups_for(&users, &config);
        reordered_groups.reverse();
        let mut reordered_assets = assets.clone();
        reordered_assets.reverse();
        let backward = build(&users, &reordered_groups, &reordered_assets, &config);

        assert_eq!(forward, backward);
    }
}
