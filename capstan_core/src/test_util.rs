//! In-memory connector implementations for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::connectors::{
    IdentitySource, ProviderGroup, ProviderUser, TargetAdmin, TargetUser,
};
use crate::errors::{IdentitySourceError, TargetApplyError, TargetReadError};
use crate::state::{AssetKey, Namespace, PermissionLevel, Role};

/// Scripted identity provider.
pub(crate) struct MemoryIdentity {
    groups: Vec<ProviderGroup>,
    members: HashMap<String, Vec<ProviderUser>>,
    requested: Mutex<HashSet<String>>,
    fail_all: bool,
}

impl MemoryIdentity {
    pub(crate) fn new() -> Self {
        Self {
            groups: Vec::new(),
            members: HashMap::new(),
            requested: Mutex::new(HashSet::new()),
            fail_all: false,
        }
    }

    /// A provider whose every call fails at the transport layer.
    pub(crate) fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new()
        }
    }

    pub(crate) fn with_group(
        mut self,
        id: &str,
        name: &str,
        members: &[(&str, &str)],
    ) -> Self {
        self.groups.push(ProviderGroup {
            id: id.to_owned(),
            name: name.to_owned(),
        });
        self.members.insert(
            id.to_owned(),
            members
                .iter()
                .map(|(username, email)| ProviderUser {
                    username: username.to_string(),
                    email: email.to_string(),
                })
                .collect(),
        );
        self
    }

    /// Register a group whose member listing will fail.
    pub(crate) fn with_group_only(mut self, id: &str, name: &str) -> Self {
        self.groups.push(ProviderGroup {
            id: id.to_owned(),
            name: name.to_owned(),
        });
        self
    }

    /// Whether a member listing was ever requested for the group.
    pub(crate) fn members_requested(&self, id: &str) -> bool {
        self.requested.lock().expect("poisoned").contains(id)
    }
}

#[async_trait]
impl IdentitySource for MemoryIdentity {
    async fn groups(&self) -> Result<Vec<ProviderGroup>, IdentitySourceError> {
        if self.fail_all {
            return Err(IdentitySourceError::Transport(
                "injected provider outage".to_owned(),
            ));
        }
        Ok(self.groups.clone())
    }

    async fn group_members(
        &self,
        group_id: &str,
    ) -> Result<Vec<ProviderUser>, IdentitySourceError> {
        self.requested
            .lock()
            .expect("poisoned")
            .insert(group_id.to_owned());
        if self.fail_all {
            return Err(IdentitySourceError::Transport(
                "injected provider outage".to_owned(),
            ));
        }
        self.members
            .get(group_id)
            .cloned()
            .ok_or_else(|| IdentitySourceError::Transport(format!("no such group: {group_id}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NamespaceSeed {
    pub(crate) users: BTreeMap<String, (String, Role)>,
    pub(crate) groups: BTreeMap<String, BTreeSet<String>>,
    pub(crate) assets: BTreeSet<(String, String)>,
}

impl NamespaceSeed {
    pub(crate) fn add_user(&mut self, username: &str, email: &str, role: Role) {
        self.users
            .insert(username.to_owned(), (email.to_owned(), role));
    }

    pub(crate) fn add_group(&mut self, group: &str, members: &[&str]) {
        self.groups.insert(
            group.to_owned(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub(crate) fn add_dataset(&mut self, name: &str) {
        self.assets.insert(("dataset".to_owned(), name.to_owned()));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TargetState {
    pub(crate) namespaces: BTreeMap<Namespace, NamespaceSeed>,
    pub(crate) grants: BTreeMap<AssetKey, BTreeMap<String, PermissionLevel>>,
}

/// In-memory target system with scripted failures.
#[derive(Default)]
pub(crate) struct MemoryTarget {
    state: Mutex<TargetState>,
    failed_namespaces: Mutex<BTreeSet<Namespace>>,
    scripted: Mutex<HashMap<String, VecDeque<TargetApplyError>>>,
    retired: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_namespace(&self, name: &str, seed: impl FnOnce(&mut NamespaceSeed)) {
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .entry(Namespace::from(name))
            .or_default();
        seed(ns);
        let keys: Vec<AssetKey> = ns
            .assets
            .iter()
            .map(|(category, asset_name)| AssetKey {
                namespace: Namespace::from(name),
                category: category.clone().into(),
                name: asset_name.clone(),
            })
            .collect();
        for key in keys {
            state.grants.entry(key).or_default();
        }
    }

    /// Make every read of the namespace fail.
    pub(crate) fn fail_namespace_reads(&self, name: &str) {
        self.failed_namespaces
            .lock()
            .expect("poisoned")
            .insert(Namespace::from(name));
    }

    /// Queue errors returned (one per attempt) by the write op with the
    /// given key, e.g. `create_user:qs1@example.com`.
    pub(crate) fn script_errors(&self, key: &str, errors: Vec<TargetApplyError>) {
        self.scripted
            .lock()
            .expect("poisoned")
            .insert(key.to_owned(), errors.into());
    }

    pub(crate) fn snapshot(&self) -> TargetState {
        self.state.lock().expect("poisoned").clone()
    }

    pub(crate) fn has_namespace(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("poisoned")
            .namespaces
            .contains_key(&Namespace::from(name))
    }

    pub(crate) fn has_user(&self, namespace: &str, username: &str) -> bool {
        self.user_role(namespace, username).is_some()
    }

    pub(crate) fn user_role(&self, namespace: &str, username: &str) -> Option<Role> {
        self.state
            .lock()
            .expect("poisoned")
            .namespaces
            .get(&Namespace::from(namespace))?
            .users
            .get(username)
            .map(|(_, role)| *role)
    }

    pub(crate) fn grant_level(
        &self,
        asset: &AssetKey,
        group: &str,
    ) -> Option<PermissionLevel> {
        self.state
            .lock()
            .expect("poisoned")
            .grants
            .get(asset)?
            .get(group)
            .copied()
    }

    pub(crate) fn retired_users(&self) -> Vec<String> {
        self.retired.lock().expect("poisoned").clone()
    }

    pub(crate) fn deleted_users(&self) -> Vec<String> {
        self.deleted.lock().expect("poisoned").clone()
    }

    fn read_guard(&self, namespace: &Namespace) -> Result<(), TargetReadError> {
        if self
            .failed_namespaces
            .lock()
            .expect("poisoned")
            .contains(namespace)
        {
            return Err(TargetReadError::Unavailable(
                "injected namespace read failure".to_owned(),
            ));
        }
        Ok(())
    }

    fn scripted_failure(&self, key: &str) -> Result<(), TargetApplyError> {
        if let Some(queue) = self.scripted.lock().expect("poisoned").get_mut(key) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetAdmin for MemoryTarget {
    async fn namespace_exists(&self, namespace: &Namespace) -> Result<bool, TargetReadError> {
        self.read_guard(namespace)?;
        Ok(self
            .state
            .lock()
            .expect("poisoned")
            .namespaces
            .contains_key(namespace))
    }

    async fn list_users(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<TargetUser>, TargetReadError> {
        self.read_guard(namespace)?;
        let state = self.state.lock().expect("poisoned");
        let ns = state.namespaces.get(namespace).ok_or_else(|| {
            TargetReadError::Protocol(format!("namespace {namespace} does not exist"))
        })?;
        Ok(ns
            .users
            .iter()
            .map(|(username, (email, role))| TargetUser {
                username: username.clone(),
                email: email.clone(),
                role: *role,
            })
            .collect())
    }

    async fn list_groups(&self, namespace: &Namespace) -> Result<Vec<String>, TargetReadError> {
        self.read_guard(namespace)?;
        let state = self.state.lock().expect("poisoned");
        Ok(state
            .namespaces
            .get(namespace)
            .map(|ns| ns.groups.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn group_members(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<Vec<String>, TargetReadError> {
        self.read_guard(namespace)?;
        let state = self.state.lock().expect("poisoned");
        Ok(state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.groups.get(group))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_assets(&self, namespace: &Namespace) -> Result<Vec<AssetKey>, TargetReadError> {
        self.read_guard(namespace)?;
        let state = self.state.lock().expect("poisoned");
        Ok(state
            .grants
            .keys()
            .filter(|key| &key.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn asset_grants(
        &self,
        asset: &AssetKey,
    ) -> Result<Vec<(String, PermissionLevel)>, TargetReadError> {
        self.read_guard(&asset.namespace)?;
        let state = self.state.lock().expect("poisoned");
        Ok(state
            .grants
            .get(asset)
            .map(|grants| grants.iter().map(|(g, l)| (g.clone(), *l)).collect())
            .unwrap_or_default())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("create_namespace:{namespace}"))?;
        let mut state = self.state.lock().expect("poisoned");
        if state.namespaces.contains_key(namespace) {
            return Err(TargetApplyError::AlreadyExists(namespace.to_string()));
        }
        state.namespaces.insert(namespace.clone(), Default::default());
        Ok(())
    }

    async fn create_user(
        &self,
        namespace: &Namespace,
        username: &str,
        email: &str,
        role: Role,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("create_user:{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| TargetApplyError::NotFound(format!("namespace {namespace}")))?;
        if ns.users.contains_key(username) {
            return Err(TargetApplyError::AlreadyExists(username.to_owned()));
        }
        ns.users
            .insert(username.to_owned(), (email.to_owned(), role));
        Ok(())
    }

    async fn set_user_role(
        &self,
        namespace: &Namespace,
        username: &str,
        role: Role,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("set_user_role:{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let user = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.users.get_mut(username))
            .ok_or_else(|| TargetApplyError::NotFound(username.to_owned()))?;
        user.1 = role;
        Ok(())
    }

    async fn retire_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("retire_user:{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| TargetApplyError::NotFound(format!("namespace {namespace}")))?;
        if ns.users.remove(username).is_none() {
            return Err(TargetApplyError::NotFound(username.to_owned()));
        }
        for members in ns.groups.values_mut() {
            members.remove(username);
        }
        self.retired.lock().expect("poisoned").push(username.to_owned());
        Ok(())
    }

    async fn delete_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("delete_user:{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| TargetApplyError::NotFound(format!("namespace {namespace}")))?;
        if ns.users.remove(username).is_none() {
            return Err(TargetApplyError::NotFound(username.to_owned()));
        }
        for members in ns.groups.values_mut() {
            members.remove(username);
        }
        self.deleted.lock().expect("poisoned").push(username.to_owned());
        Ok(())
    }

    async fn create_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("create_group:{group}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| TargetApplyError::NotFound(format!("namespace {namespace}")))?;
        if ns.groups.contains_key(group) {
            return Err(TargetApplyError::AlreadyExists(group.to_owned()));
        }
        ns.groups.insert(group.to_owned(), Default::default());
        Ok(())
    }

    async fn delete_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("delete_group:{group}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| TargetApplyError::NotFound(format!("namespace {namespace}")))?;
        if ns.groups.remove(group).is_none() {
            return Err(TargetApplyError::NotFound(group.to_owned()));
        }
        Ok(())
    }

    async fn add_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("add_member:{group}/{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let members = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.groups.get_mut(group))
            .ok_or_else(|| TargetApplyError::NotFound(format!("group {group}")))?;
        if !members.insert(username.to_owned()) {
            return Err(TargetApplyError::AlreadyExists(format!(
                "{username} in {group}"
            )));
        }
        Ok(())
    }

    async fn remove_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("remove_member:{group}/{username}"))?;
        let mut state = self.state.lock().expect("poisoned");
        let members = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.groups.get_mut(group))
            .ok_or_else(|| TargetApplyError::NotFound(format!("group {group}")))?;
        if !members.remove(username) {
            return Err(TargetApplyError::NotFound(format!(
                "{username} in {group}"
            )));
        }
        Ok(())
    }

    async fn set_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
        level: PermissionLevel,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("set_asset_grant:{}/{group}", asset.name))?;
        let mut state = self.state.lock().expect("poisoned");
        let grants = state
            .grants
            .get_mut(asset)
            .ok_or_else(|| TargetApplyError::NotFound(format!("asset {asset}")))?;
        grants.insert(group.to_owned(), level);
        Ok(())
    }

    async fn revoke_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        self.scripted_failure(&format!("revoke_asset_grant:{}/{group}", asset.name))?;
        let mut state = self.state.lock().expect("poisoned");
        let grants = state
            .grants
            .get_mut(asset)
            .ok_or_else(|| TargetApplyError::NotFound(format!("asset {asset}")))?;
        if grants.remove(group).is_none() {
            return Err(TargetApplyError::NotFound(format!(
                "grant for {group} on {asset}"
            )));
        }
        Ok(())
    }
}
