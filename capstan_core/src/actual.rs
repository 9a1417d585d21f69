//! Reading actual state from the target system.
//!
//! Only namespaces present in desired state are ever queried; the
//! reconciler never looks at (and so never touches) anything else. Reads
//! fan out per namespace and fail per namespace.

use std::collections::BTreeMap;

use futures::future::join_all;

use crate::connectors::TargetAdmin;
use crate::errors::TargetReadError;
use crate::logging::warn;
use crate::state::{
    ActualState, AssetKey, DesiredState, Namespace, NamespaceState, PermissionLevel, UserSpec,
};

enum NamespaceRead {
    Missing,
    Present {
        state: NamespaceState,
        assets: BTreeMap<AssetKey, BTreeMap<String, PermissionLevel>>,
    },
}

/// Query the target system for the current state of every namespace in
/// desired state. A namespace whose read fails is recorded as unavailable
/// and excluded from this cycle's reconciliation.
pub async fn read(target: &dyn TargetAdmin, desired: &DesiredState) -> ActualState {
    let reads = desired.namespaces.keys().map(|ns| async move {
        let governed: Vec<&AssetKey> = desired
            .grants
            .keys()
            .filter(|key| &key.namespace == ns)
            .collect();
        (ns.clone(), read_namespace(target, ns, &governed).await)
    });

    let mut actual = ActualState::default();
    for (ns, result) in join_all(reads).await {
        match result {
            Ok(NamespaceRead::Missing) => {
                actual.missing.insert(ns);
            }
            Ok(NamespaceRead::Present { state, assets }) => {
                actual.namespaces.insert(ns, state);
                actual.assets.extend(assets);
            }
            Err(e) => {
                warn!("skipping namespace {ns} this cycle: {e}");
                actual.unavailable.push((ns, e.to_string()));
            }
        }
    }
    actual
}

async fn read_namespace(
    target: &dyn TargetAdmin,
    namespace: &Namespace,
    governed_assets: &[&AssetKey],
) -> Result<NamespaceRead, TargetReadError> {
    if !target.namespace_exists(namespace).await? {
        return Ok(NamespaceRead::Missing);
    }

    let mut state = NamespaceState::default();

    for user in target.list_users(namespace).await? {
        state.users.insert(
            user.username,
            UserSpec {
                email: user.email,
                role: user.role,
                member_of: Default::default(),
            },
        );
    }

    for group in target.list_groups(namespace).await? {
        for member in target.group_members(namespace, &group).await? {
            if let Some(user) = state.users.get_mut(&member) {
                user.member_of.insert(group.clone());
            }
        }
        state.groups.insert(group);
    }

    let inventory = target.list_assets(namespace).await?;
    let mut assets = BTreeMap::new();
    for key in governed_assets {
        let key = *key;
        if !inventory.contains(key) {
            // Asset precondition failure is detected by the differ from
            // the key's absence here.
            continue;
        }
        let grants = target.asset_grants(key).await?.into_iter().collect();
        assets.insert(key.clone(), grants);
    }

    Ok(NamespaceRead::Present { state, assets })
}
