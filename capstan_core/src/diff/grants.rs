//! Diffing of desired vs actual asset grants

use std::collections::BTreeSet;
use std::fmt::Display;

use colored::Colorize;

use crate::errors::Skip;
use crate::state::{ActualState, AssetKey, DesiredState, Namespace, PermissionLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A diff for one group's grant on one asset
pub struct Diff {
    /// The asset whose grant is changing
    pub asset: AssetKey,
    /// The grantee group
    pub group_name: String,
    /// The specifics of the diff
    pub details: DiffDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outlines the diff type needed
pub enum DiffDetails {
    /// Set the group's level on the asset
    SetGrant {
        /// The level to grant
        level: PermissionLevel,
        /// The level currently granted, if any
        prior: Option<PermissionLevel>,
    },
    /// Revoke the group's grant on the asset
    RevokeGrant,
}

impl Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match &self.details {
            DiffDetails::SetGrant { level, prior: None } => format!(
                "{}",
                format!("+ grant: {} -> {} ({level})\n", self.asset, self.group_name).green()
            ),
            DiffDetails::SetGrant {
                level,
                prior: Some(prior),
            } => format!(
                "{}",
                format!(
                    "~ grant: {} -> {} ({prior} -> {level})\n",
                    self.asset, self.group_name
                )
                .yellow()
            ),
            DiffDetails::RevokeGrant => format!(
                "{}",
                format!("- grant: {} -> {}\n", self.asset, self.group_name).red()
            ),
        };
        write!(f, "{text}")
    }
}

/// Generate the list of grant diffs between desired and actual state.
///
/// Grants are only reconciled on governed assets (those the manifest
/// names); a governed asset missing from the target fails as a skip for
/// that asset alone. Ungoverned assets are never touched.
pub(crate) fn generate_diffs(
    desired: &DesiredState,
    actual: &ActualState,
    excluded: &BTreeSet<Namespace>,
) -> (Vec<Diff>, Vec<Skip>) {
    let mut res = Vec::new();
    let mut skips = Vec::new();

    for (asset, wanted) in &desired.grants {
        if excluded.contains(&asset.namespace) {
            continue;
        }
        let mut env_state = match actual.assets.get(asset) {
            Some(grants) => grants.clone(),
            None => {
                // The asset does not exist in the target (or its
                // namespace doesn't); this asset fails, the cycle
                // proceeds.
                skips.push(Skip::AssetNotFound {
                    asset: asset.to_owned(),
                });
                continue;
            }
        };

        for (group, level) in wanted {
            let details = match env_state.remove(group) {
                Some(current) if &current == level => continue,
                current => DiffDetails::SetGrant {
                    level: *level,
                    prior: current,
                },
            };
            res.push(Diff {
                asset: asset.to_owned(),
                group_name: group.to_owned(),
                details,
            });
        }

        // grants in the env, but not in the config
        for (group, _) in env_state {
            res.push(Diff {
                asset: asset.to_owned(),
                group_name: group,
                details: DiffDetails::RevokeGrant,
            });
        }
    }

    res.sort_by(|a, b| (&a.asset, &a.group_name).cmp(&(&b.asset, &b.group_name)));
    (res, skips)
}
