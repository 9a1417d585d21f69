//! The traits all connectors are expected to implement.
//!
//! The reconciler consumes its external collaborators (identity provider,
//! target-system admin API, object storage) only through these narrow
//! interfaces; the platform-specific crates provide the implementations.

use async_trait::async_trait;

use crate::errors::{IdentitySourceError, StoreError, TargetApplyError, TargetReadError};
use crate::state::{AssetKey, Namespace, PermissionLevel, Role};

/// A group record as the identity provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderGroup {
    /// The provider's opaque id for the group, used for member listing.
    pub id: String,
    /// The group's display name, the key the governance config matches on.
    pub name: String,
}

/// A user record as the identity provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUser {
    /// The provider-side login.
    pub username: String,
    /// The user's email address.
    pub email: String,
}

/// Read-only access to the identity provider's groups and memberships.
///
/// Implementations own pagination and auth; both listings must be complete
/// when they return.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// List every group visible to the reconciler's credentials.
    async fn groups(&self) -> Result<Vec<ProviderGroup>, IdentitySourceError>;

    /// List the members of one group.
    async fn group_members(
        &self,
        group_id: &str,
    ) -> Result<Vec<ProviderUser>, IdentitySourceError>;
}

/// A target-system user as the admin API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    /// The target-side username.
    pub username: String,
    /// The user's email address.
    pub email: String,
    /// The user's current role.
    pub role: Role,
}

/// Administrative access to the target system.
///
/// Write operations are assumed idempotent or are made idempotent by the
/// apply engine's handling of `AlreadyExists`/`NotFound`.
#[async_trait]
pub trait TargetAdmin: Send + Sync {
    /// Whether the namespace exists in the target.
    async fn namespace_exists(&self, namespace: &Namespace) -> Result<bool, TargetReadError>;

    /// List the users registered in a namespace.
    async fn list_users(&self, namespace: &Namespace) -> Result<Vec<TargetUser>, TargetReadError>;

    /// List the group names present in a namespace.
    async fn list_groups(&self, namespace: &Namespace) -> Result<Vec<String>, TargetReadError>;

    /// List the usernames belonging to a group.
    async fn group_members(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<Vec<String>, TargetReadError>;

    /// List the assets that exist in a namespace.
    async fn list_assets(&self, namespace: &Namespace) -> Result<Vec<AssetKey>, TargetReadError>;

    /// The group-level grants currently applied to an asset.
    async fn asset_grants(
        &self,
        asset: &AssetKey,
    ) -> Result<Vec<(String, PermissionLevel)>, TargetReadError>;

    /// Create a namespace.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), TargetApplyError>;

    /// Register a user in a namespace with an initial role.
    async fn create_user(
        &self,
        namespace: &Namespace,
        username: &str,
        email: &str,
        role: Role,
    ) -> Result<(), TargetApplyError>;

    /// Change a registered user's role.
    async fn set_user_role(
        &self,
        namespace: &Namespace,
        username: &str,
        role: Role,
    ) -> Result<(), TargetApplyError>;

    /// Withdraw a user's role assignment and group memberships while
    /// keeping the account.
    async fn retire_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError>;

    /// Remove a user's account from a namespace.
    async fn delete_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError>;

    /// Create a group in a namespace.
    async fn create_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError>;

    /// Remove a group from a namespace.
    async fn delete_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError>;

    /// Add a user to a group.
    async fn add_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError>;

    /// Remove a user from a group.
    async fn remove_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError>;

    /// Grant a group a permission level on an asset, replacing any prior
    /// level the group held.
    async fn set_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
        level: PermissionLevel,
    ) -> Result<(), TargetApplyError>;

    /// Revoke a group's grant on an asset.
    async fn revoke_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
    ) -> Result<(), TargetApplyError>;
}

/// Bucket-shaped storage used for snapshots, manifests, reports, and the
/// cycle lease.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read an object, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// List keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
