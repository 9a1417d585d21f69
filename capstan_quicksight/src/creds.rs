use anyhow::{anyhow, Result};
use capstan_core::config::CredentialsMap;
use serde::Deserialize;

/// Credentials for authenticating to the QuickSight admin API.
///
/// The user sets these up by pasting their account id, region, and a
/// session token into their connector config.
#[derive(Deserialize, Debug, Default)]
pub(crate) struct QuickSightCredentials {
    pub(crate) account_id: String,
    pub(crate) region: String,
    pub(crate) session_token: String,
    pub(crate) url: Option<String>,
}

impl QuickSightCredentials {
    pub(crate) fn from_map(map: &CredentialsMap) -> Self {
        Self {
            account_id: map.get("account_id").cloned().unwrap_or_default(),
            region: map.get("region").cloned().unwrap_or_default(),
            session_token: map.get("session_token").cloned().unwrap_or_default(),
            url: map.get("url").cloned(),
        }
    }

    /// Perform simple field validation to catch bad input.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.account_id.is_empty() || self.region.is_empty() || self.session_token.is_empty()
        {
            return Err(anyhow!(
                "Credentials are missing. Please make sure your connectors.yaml file is correct. Credentials received: {:#?}", self
            ));
        }
        Ok(())
    }
}
