//! Diffing of desired vs actual groups

use std::collections::BTreeSet;
use std::fmt::Display;

use colored::Colorize;

use crate::state::{ActualState, DesiredState, Namespace};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A diff for groups
pub struct Diff {
    /// The namespace the group lives in
    pub namespace: Namespace,
    /// The group being diffed
    pub group_name: String,
    /// The specifics of the diff
    pub details: DiffDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outlines the diff type needed
pub enum DiffDetails {
    /// Add a group
    AddGroup,
    /// Remove a group
    RemoveGroup,
}

impl Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match &self.details {
            DiffDetails::AddGroup => {
                format!("{}", format!("+ group: {}/{}\n", self.namespace, self.group_name).green())
            }
            DiffDetails::RemoveGroup => {
                format!("{}", format!("- group: {}/{}\n", self.namespace, self.group_name).red())
            }
        };
        write!(f, "{text}")
    }
}

/// Generate the list of group diffs between desired and actual state.
/// Deletes only ever target namespaces present in desired state, and
/// excluded namespaces are not touched at all.
pub(crate) fn generate_diffs(
    desired: &DesiredState,
    actual: &ActualState,
    excluded: &BTreeSet<Namespace>,
) -> Vec<Diff> {
    let mut res = Vec::new();

    for (namespace, desired_ns) in &desired.namespaces {
        if excluded.contains(namespace) {
            continue;
        }
        let mut env_state: BTreeSet<String> = actual
            .namespaces
            .get(namespace)
            .map(|ns| ns.groups.clone())
            .unwrap_or_default();

        // handle groups in the config, but not in the env
        for group in &desired_ns.groups {
            // does this group exist in env? If so remove it. We'll deal
            // with the leftovers later!
            if !env_state.remove(group) {
                res.push(Diff {
                    namespace: namespace.to_owned(),
                    group_name: group.to_owned(),
                    details: DiffDetails::AddGroup,
                });
            }
        }

        // handle groups in the env, but not in the config
        for group in env_state {
            res.push(Diff {
                namespace: namespace.to_owned(),
                group_name: group,
                details: DiffDetails::RemoveGroup,
            });
        }
    }

    res.sort_by(|a, b| {
        (&a.namespace, &a.group_name).cmp(&(&b.namespace, &b.group_name))
    });
    res
}
