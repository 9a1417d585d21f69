//! Okta identity-source connector for Capstan.
//!
//! Read-only: lists the Okta org's groups and their members through the
//! paginated `/api/v1/groups` endpoints. Authenticates with an SSWS API
//! token. Transport-level transient failures retry inside the client;
//! anything that survives the retries fails the whole fetch, which is
//! what the reconciler wants (all-or-nothing per cycle).

use anyhow::Result;
use async_trait::async_trait;

use capstan_core::config::CredentialsMap;
use capstan_core::connectors::{IdentitySource, ProviderGroup, ProviderUser};
use capstan_core::errors::IdentitySourceError;
use capstan_core::logging::debug;

mod creds;
mod rest;

use creds::OktaCredentials;
use rest::{OktaRestClient, OktaRestConfig};

/// The Okta connector.
pub struct OktaConnector {
    client: OktaRestClient,
}

impl OktaConnector {
    /// Instantiate the connector from a connector credentials entry.
    pub fn new(credentials: &CredentialsMap) -> Result<Self> {
        let client = OktaRestClient::new(
            OktaCredentials::from_map(credentials),
            OktaRestConfig { retry: true },
        )?;
        Ok(Self { client })
    }

    /// Check if the connector is properly set up and return the
    /// connection status (true for connected, false for not).
    pub async fn check(&self) -> bool {
        match self.client.get_paginated("/api/v1/groups").await {
            Ok(_) => true,
            Err(e) => {
                debug!("okta connection check failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl IdentitySource for OktaConnector {
    async fn groups(&self) -> Result<Vec<ProviderGroup>, IdentitySourceError> {
        let records = self.client.get_paginated("/api/v1/groups").await?;
        records
            .into_iter()
            .map(|record| {
                let id = string_field(&record, &["id"])?;
                let name = string_field(&record, &["profile", "name"])?;
                Ok(ProviderGroup { id, name })
            })
            .collect()
    }

    async fn group_members(
        &self,
        group_id: &str,
    ) -> Result<Vec<ProviderUser>, IdentitySourceError> {
        let records = self
            .client
            .get_paginated(&format!("/api/v1/groups/{group_id}/users"))
            .await?;
        records
            .into_iter()
            .map(|record| {
                let username = string_field(&record, &["profile", "login"])?;
                let email = string_field(&record, &["profile", "email"])
                    .unwrap_or_else(|_| username.clone());
                Ok(ProviderUser { username, email })
            })
            .collect()
    }
}

fn string_field(
    record: &serde_json::Value,
    path: &[&str],
) -> Result<String, IdentitySourceError> {
    let mut value = record;
    for key in path {
        value = &value[*key];
    }
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            IdentitySourceError::Protocol(format!(
                "okta record is missing {}",
                path.join(".")
            ))
        })
}
