//! QuickSight target-system connector for Capstan.
//!
//! Speaks the QuickSight admin REST surface: namespaces, user
//! registrations, groups, group memberships, and per-asset permission
//! grants. Requests authenticate with a session token; credential vending
//! and request signing are owned by the deployment's gateway, not this
//! crate.
//!
//! QuickSight expresses a grant as a per-principal action list; the
//! `permissions` module translates between those lists and Capstan's
//! permission levels, and foreign action lists (grants this reconciler
//! never wrote) are left untouched.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;

use capstan_core::config::CredentialsMap;
use capstan_core::connectors::{TargetAdmin, TargetUser};
use capstan_core::errors::{TargetApplyError, TargetReadError};
use capstan_core::logging::debug;
use capstan_core::state::{AssetCategory, AssetKey, Namespace, PermissionLevel, Role};

mod consts;
mod creds;
mod permissions;
mod rest;

use creds::QuickSightCredentials;
use rest::{QsRestClient, QsRestConfig};

/// The QuickSight connector.
pub struct QuickSightConnector {
    client: QsRestClient,
    /// Name-to-id cache per (category, name); QuickSight addresses assets
    /// by id while the manifest addresses them by name.
    asset_ids: Mutex<HashMap<(String, String), String>>,
}

impl QuickSightConnector {
    /// Instantiate the connector from a connector credentials entry.
    pub fn new(credentials: &CredentialsMap) -> Result<Self> {
        let client = QsRestClient::new(
            QuickSightCredentials::from_map(credentials),
            QsRestConfig { retry: true },
        )?;
        Ok(Self {
            client,
            asset_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Check if the connector is properly set up and return the
    /// connection status (true for connected, false for not).
    pub async fn check(&self) -> bool {
        match self.client.get_optional("/namespaces/default").await {
            Ok(_) => true,
            Err(e) => {
                debug!("quicksight connection check failed: {e}");
                false
            }
        }
    }

    fn cached_id(&self, asset: &AssetKey) -> Option<String> {
        self.asset_ids
            .lock()
            .expect("cache poisoned")
            .get(&(asset.category.to_string(), asset.name.clone()))
            .cloned()
    }

    async fn refresh_category(&self, category: &AssetCategory) -> Result<(), TargetReadError> {
        let Some(endpoints) = consts::endpoints(category) else {
            return Ok(());
        };
        let entries = self
            .client
            .get_paginated(&format!("/{}", endpoints.path), endpoints.list_key)
            .await?;
        let mut cache = self.asset_ids.lock().expect("cache poisoned");
        for entry in entries {
            if let (Some(name), Some(id)) =
                (entry["Name"].as_str(), entry[endpoints.id_key].as_str())
            {
                cache.insert((category.to_string(), name.to_owned()), id.to_owned());
            }
        }
        Ok(())
    }

    async fn lookup_id(&self, asset: &AssetKey) -> Result<Option<String>, TargetReadError> {
        if let Some(id) = self.cached_id(asset) {
            return Ok(Some(id));
        }
        self.refresh_category(&asset.category).await?;
        Ok(self.cached_id(asset))
    }

    async fn lookup_id_for_apply(&self, asset: &AssetKey) -> Result<String, TargetApplyError> {
        match self.lookup_id(asset).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(TargetApplyError::NotFound(format!("asset {asset}"))),
            Err(e) => Err(TargetApplyError::Unavailable(e.to_string())),
        }
    }
}

/// Split `arn:aws:quicksight:…:group/{namespace}/{group}` into its
/// namespace and group name.
fn parse_group_principal(principal: &str) -> Option<(&str, &str)> {
    let suffix = principal.split(":group/").nth(1)?;
    suffix.split_once('/')
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[async_trait]
impl TargetAdmin for QuickSightConnector {
    async fn namespace_exists(&self, namespace: &Namespace) -> Result<bool, TargetReadError> {
        Ok(self
            .client
            .get_optional(&format!("/namespaces/{}", encode(&namespace.0)))
            .await?
            .is_some())
    }

    async fn list_users(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<TargetUser>, TargetReadError> {
        let records = self
            .client
            .get_paginated(
                &format!("/namespaces/{}/users", encode(&namespace.0)),
                "UserList",
            )
            .await?;
        let mut users = Vec::new();
        for record in records {
            let username = record["UserName"]
                .as_str()
                .ok_or_else(|| {
                    TargetReadError::Protocol("user record is missing UserName".to_owned())
                })?
                .to_owned();
            let email = record["Email"].as_str().unwrap_or(&username).to_owned();
            match record["Role"].as_str().map(str::parse::<Role>) {
                Some(Ok(role)) => users.push(TargetUser {
                    username,
                    email,
                    role,
                }),
                // Roles outside the governed tiers (e.g. restricted
                // readers) are not reconciled.
                _ => debug!("ignoring user {username} with ungoverned role"),
            }
        }
        Ok(users)
    }

    async fn list_groups(&self, namespace: &Namespace) -> Result<Vec<String>, TargetReadError> {
        let records = self
            .client
            .get_paginated(
                &format!("/namespaces/{}/groups", encode(&namespace.0)),
                "GroupList",
            )
            .await?;
        Ok(records
            .iter()
            .filter_map(|record| record["GroupName"].as_str().map(str::to_owned))
            .collect())
    }

    async fn group_members(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<Vec<String>, TargetReadError> {
        let records = self
            .client
            .get_paginated(
                &format!(
                    "/namespaces/{}/groups/{}/members",
                    encode(&namespace.0),
                    encode(group)
                ),
                "GroupMemberList",
            )
            .await?;
        Ok(records
            .iter()
            .filter_map(|record| record["MemberName"].as_str().map(str::to_owned))
            .collect())
    }

    async fn list_assets(&self, namespace: &Namespace) -> Result<Vec<AssetKey>, TargetReadError> {
        let mut keys = Vec::new();
        for category in &consts::RECOGNIZED {
            let Some(endpoints) = consts::endpoints(category) else {
                continue;
            };
            let entries = self
                .client
                .get_paginated(&format!("/{}", endpoints.path), endpoints.list_key)
                .await?;
            let mut cache = self.asset_ids.lock().expect("cache poisoned");
            for entry in entries {
                if let (Some(name), Some(id)) =
                    (entry["Name"].as_str(), entry[endpoints.id_key].as_str())
                {
                    cache.insert((category.to_string(), name.to_owned()), id.to_owned());
                    keys.push(AssetKey {
                        namespace: namespace.clone(),
                        category: category.clone(),
                        name: name.to_owned(),
                    });
                }
            }
        }
        Ok(keys)
    }

    async fn asset_grants(
        &self,
        asset: &AssetKey,
    ) -> Result<Vec<(String, PermissionLevel)>, TargetReadError> {
        let Some(id) = self.lookup_id(asset).await? else {
            return Ok(Vec::new());
        };
        let endpoints = consts::endpoints(&asset.category).ok_or_else(|| {
            TargetReadError::Protocol(format!(
                "category {} has no permissions endpoint",
                asset.category
            ))
        })?;
        let Some(body) = self
            .client
            .get_optional(&format!("/{}/{id}/permissions", endpoints.path))
            .await?
        else {
            return Ok(Vec::new());
        };

        let empty = Vec::new();
        let mut grants = Vec::new();
        for permission in body["Permissions"].as_array().unwrap_or(&empty) {
            let Some(principal) = permission["Principal"].as_str() else {
                continue;
            };
            let Some((namespace, group)) = parse_group_principal(principal) else {
                // user-principal and foreign grants are not reconciled
                continue;
            };
            if namespace != asset.namespace.0 {
                continue;
            }
            let actions: Vec<String> = permission["Actions"]
                .as_array()
                .unwrap_or(&empty)
                .iter()
                .filter_map(|a| a.as_str().map(str::to_owned))
                .collect();
            if let Some(level) = permissions::level_for_actions(&asset.category, &actions) {
                grants.push((group.to_owned(), level));
            }
        }
        Ok(grants)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::POST,
                "",
                Some(json!({
                    "Namespace": namespace.0,
                    "IdentityStore": "QUICKSIGHT",
                })),
            )
            .await
    }

    async fn create_user(
        &self,
        namespace: &Namespace,
        username: &str,
        email: &str,
        role: Role,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::POST,
                &format!("/namespaces/{}/users", encode(&namespace.0)),
                Some(json!({
                    "IdentityType": "IAM",
                    "UserName": username,
                    "Email": email,
                    "UserRole": role.to_string(),
                })),
            )
            .await
    }

    async fn set_user_role(
        &self,
        namespace: &Namespace,
        username: &str,
        role: Role,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::PUT,
                &format!(
                    "/namespaces/{}/users/{}",
                    encode(&namespace.0),
                    encode(username)
                ),
                Some(json!({ "Role": role.to_string() })),
            )
            .await
    }

    async fn retire_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        // Deleting the registration withdraws role and memberships; the
        // underlying identity is owned by the identity provider and is
        // not touched.
        self.client
            .write(
                Method::DELETE,
                &format!(
                    "/namespaces/{}/users/{}",
                    encode(&namespace.0),
                    encode(username)
                ),
                None,
            )
            .await
    }

    async fn delete_user(
        &self,
        namespace: &Namespace,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::DELETE,
                &format!(
                    "/namespaces/{}/users/{}?purge=true",
                    encode(&namespace.0),
                    encode(username)
                ),
                None,
            )
            .await
    }

    async fn create_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::POST,
                &format!("/namespaces/{}/groups", encode(&namespace.0)),
                Some(json!({ "GroupName": group })),
            )
            .await
    }

    async fn delete_group(
        &self,
        namespace: &Namespace,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::DELETE,
                &format!(
                    "/namespaces/{}/groups/{}",
                    encode(&namespace.0),
                    encode(group)
                ),
                None,
            )
            .await
    }

    async fn add_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::PUT,
                &format!(
                    "/namespaces/{}/groups/{}/members/{}",
                    encode(&namespace.0),
                    encode(group),
                    encode(username)
                ),
                None,
            )
            .await
    }

    async fn remove_member(
        &self,
        namespace: &Namespace,
        group: &str,
        username: &str,
    ) -> Result<(), TargetApplyError> {
        self.client
            .write(
                Method::DELETE,
                &format!(
                    "/namespaces/{}/groups/{}/members/{}",
                    encode(&namespace.0),
                    encode(group),
                    encode(username)
                ),
                None,
            )
            .await
    }

    async fn set_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
        level: PermissionLevel,
    ) -> Result<(), TargetApplyError> {
        let id = self.lookup_id_for_apply(asset).await?;
        let endpoints = consts::endpoints(&asset.category)
            .ok_or_else(|| TargetApplyError::NotFound(format!("asset {asset}")))?;
        let principal = self.client.group_principal(&asset.namespace.0, group);

        let grant_actions = permissions::actions_for(&asset.category, level).ok_or_else(|| {
            TargetApplyError::Malformed(format!(
                "level {level} is not supported for category {}",
                asset.category
            ))
        })?;
        // Setting a level replaces whatever level the group held, so the
        // other tiers' actions are revoked in the same request.
        let revoke_actions: Vec<String> = permissions::all_actions(&asset.category)
            .into_iter()
            .filter(|action| !grant_actions.contains(action))
            .collect();

        let mut body = json!({
            "GrantPermissions": [{ "Principal": principal, "Actions": grant_actions }],
        });
        if !revoke_actions.is_empty() {
            body["RevokePermissions"] =
                json!([{ "Principal": principal, "Actions": revoke_actions }]);
        }

        self.client
            .write(
                Method::POST,
                &format!("/{}/{id}/permissions", endpoints.path),
                Some(body),
            )
            .await
    }

    async fn revoke_asset_grant(
        &self,
        asset: &AssetKey,
        group: &str,
    ) -> Result<(), TargetApplyError> {
        let id = self.lookup_id_for_apply(asset).await?;
        let endpoints = consts::endpoints(&asset.category)
            .ok_or_else(|| TargetApplyError::NotFound(format!("asset {asset}")))?;
        let principal = self.client.group_principal(&asset.namespace.0, group);

        self.client
            .write(
                Method::POST,
                &format!("/{}/{id}/permissions", endpoints.path),
                Some(json!({
                    "RevokePermissions": [{
                        "Principal": principal,
                        "Actions": permissions::all_actions(&asset.category),
                    }],
                })),
            )
            .await
    }
}
