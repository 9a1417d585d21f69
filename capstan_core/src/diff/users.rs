//! Diffing of desired vs actual users: identity, role, and membership

use std::collections::BTreeSet;
use std::fmt::Display;

use colored::Colorize;

use crate::config::UserRemovalPolicy;
use crate::state::{ActualState, DesiredState, Namespace, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A diff for users
pub struct Diff {
    /// The namespace the user is registered in
    pub namespace: Namespace,
    /// The user being diffed
    pub username: String,
    /// The specifics of the diff
    pub details: DiffDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outlines the diff type needed
pub enum DiffDetails {
    /// Register the user with an initial role and memberships
    AddUser {
        /// The user's email address
        email: String,
        /// The role to register with
        role: Role,
        /// The groups the user starts out in
        member_of: BTreeSet<String>,
    },
    /// Update an existing user
    ModifyUser {
        /// The role change, if any, as (current, wanted)
        role: Option<(Role, Role)>,
        /// The groups the user is joining
        add_member_of: BTreeSet<String>,
        /// The groups the user is leaving
        remove_member_of: BTreeSet<String>,
    },
    /// Withdraw the user's role and memberships but keep the account
    RetireUser,
    /// Remove the user's account
    RemoveUser,
}

impl Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut text = "".to_owned();
        match &self.details {
            DiffDetails::AddUser {
                role, member_of, ..
            } => {
                text += format!(
                    "{}",
                    format!("+ user: {}/{} ({role})\n", self.namespace, self.username).green()
                )
                .as_str();
                if !member_of.is_empty() {
                    text += "  member of:\n"
                };
                for group in member_of {
                    text += format!("{}", format!("    + {group}\n").green()).as_str();
                }
            }
            DiffDetails::ModifyUser {
                role,
                add_member_of,
                remove_member_of,
            } => {
                text += format!(
                    "{}{}\n",
                    "~ user: ".yellow(),
                    format!("{}/{}", self.namespace, self.username).yellow()
                )
                .as_str();
                if let Some((current, wanted)) = role {
                    text += format!(
                        "{}",
                        format!("    ~ role: {current} -> {wanted}\n").yellow()
                    )
                    .as_str();
                }
                if !add_member_of.is_empty() || !remove_member_of.is_empty() {
                    text += "  member of:\n"
                };
                for group in add_member_of {
                    text += format!("{}", format!("    + {group}\n").green()).as_str();
                }
                for group in remove_member_of {
                    text += format!("{}", format!("    - {group}\n").red()).as_str();
                }
            }
            DiffDetails::RetireUser => {
                text += format!(
                    "{}",
                    format!(
                        "- user: {}/{} (retire: withdraw role and memberships)\n",
                        self.namespace, self.username
                    )
                    .red()
                )
                .as_str();
            }
            DiffDetails::RemoveUser => {
                text += format!(
                    "{}",
                    format!("- user: {}/{}\n", self.namespace, self.username).red()
                )
                .as_str();
            }
        }
        write!(f, "{text}")
    }
}

/// Generate the list of user diffs between desired and actual state.
///
/// Users present in the target but absent from the identity source get a
/// retire or remove diff per the configured policy; an account is never
/// deleted unless the operator opted in.
pub(crate) fn generate_diffs(
    desired: &DesiredState,
    actual: &ActualState,
    excluded: &BTreeSet<Namespace>,
    removal: UserRemovalPolicy,
) -> Vec<Diff> {
    let mut res = Vec::new();

    for (namespace, desired_ns) in &desired.namespaces {
        if excluded.contains(namespace) {
            continue;
        }
        let mut env_state = actual
            .namespaces
            .get(namespace)
            .map(|ns| ns.users.clone())
            .unwrap_or_default();

        for (username, wanted) in &desired_ns.users {
            let details = match env_state.remove(username) {
                Some(current) => {
                    let role = (current.role != wanted.role)
                        .then_some((current.role, wanted.role));
                    let add_member_of: BTreeSet<String> = wanted
                        .member_of
                        .difference(&current.member_of)
                        .cloned()
                        .collect();
                    let remove_member_of: BTreeSet<String> = current
                        .member_of
                        .difference(&wanted.member_of)
                        .cloned()
                        .collect();
                    if role.is_none() && add_member_of.is_empty() && remove_member_of.is_empty() {
                        // No change
                        continue;
                    }
                    DiffDetails::ModifyUser {
                        role,
                        add_member_of,
                        remove_member_of,
                    }
                }
                None => DiffDetails::AddUser {
                    email: wanted.email.to_owned(),
                    role: wanted.role,
                    member_of: wanted.member_of.clone(),
                },
            };
            res.push(Diff {
                namespace: namespace.to_owned(),
                username: username.to_owned(),
                details,
            });
        }

        // handle users in the env, but not in the config
        for (username, _) in env_state {
            res.push(Diff {
                namespace: namespace.to_owned(),
                username,
                details: match removal {
                    UserRemovalPolicy::Retire => DiffDetails::RetireUser,
                    UserRemovalPolicy::Delete => DiffDetails::RemoveUser,
                },
            });
        }
    }

    res.sort_by(|a, b| (&a.namespace, &a.username).cmp(&(&b.namespace, &b.username)));
    res
}
