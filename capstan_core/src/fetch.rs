//! Identity fetching and normalization.
//!
//! Drives the identity-source connector, keeps only governed groups, and
//! folds memberships into the internal user model. The fetch is
//! all-or-nothing for a cycle: a failure on any page discards everything
//! already fetched so stale and fresh pages are never mixed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::IdentityConfig;
use crate::connectors::IdentitySource;
use crate::errors::IdentitySourceError;
use crate::logging::debug;
use crate::state::{Group, GroupKind, User};

/// The persisted identity snapshot. The serialized shape
/// (`{"users": [...]}`) is the stable user-governance contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    /// Every user that belongs to at least one governed group.
    pub users: Vec<User>,
}

impl IdentitySnapshot {
    /// The governed groups represented in this snapshot, derived from user
    /// memberships. A governed group enters desired state only through a
    /// member (or through the materialization policy at build time).
    pub fn groups(&self, identity: &IdentityConfig) -> Vec<Group> {
        let mut names: BTreeSet<&str> = BTreeSet::new();
        for user in &self.users {
            for group in &user.groups {
                names.insert(group.as_str());
            }
        }
        names
            .into_iter()
            .filter_map(|name| {
                identity.classify(name).map(|kind| Group {
                    name: name.to_owned(),
                    kind,
                })
            })
            .collect()
    }
}

/// Fetch all governed groups and their members from the identity provider
/// and normalize them into the internal user model.
pub async fn fetch_identity(
    source: &dyn IdentitySource,
    identity: &IdentityConfig,
) -> Result<IdentitySnapshot, IdentitySourceError> {
    let provider_groups = source.groups().await?;

    let mut users: BTreeMap<String, User> = BTreeMap::new();
    let mut governed = 0usize;

    for provider_group in &provider_groups {
        if identity.classify(&provider_group.name).is_none() {
            continue;
        }
        governed += 1;

        let members = source.group_members(&provider_group.id).await?;
        for member in members {
            let user = users
                .entry(member.username.clone())
                .or_insert_with(|| User {
                    username: member.username.clone(),
                    email: member.email.clone(),
                    groups: BTreeSet::new(),
                });
            user.groups.insert(provider_group.name.clone());
        }
    }

    debug!(
        "fetched {} governed groups ({} provider groups total), {} users",
        governed,
        provider_groups.len(),
        users.len()
    );

    Ok(IdentitySnapshot {
        users: users.into_values().collect(),
    })
}
