use anyhow::{anyhow, Result};
use capstan_core::config::CredentialsMap;
use serde::Deserialize;

/// Credentials for authenticating to Okta.
///
/// The user sets these up by pasting their Okta org account and an API
/// token into their connector config.
#[derive(Deserialize, Debug, Default)]
pub(crate) struct OktaCredentials {
    pub(crate) account: String,
    pub(crate) api_token: String,
    pub(crate) url: Option<String>,
}

impl OktaCredentials {
    pub(crate) fn from_map(map: &CredentialsMap) -> Self {
        Self {
            account: map.get("account").cloned().unwrap_or_default(),
            api_token: map.get("api_token").cloned().unwrap_or_default(),
            url: map.get("url").cloned(),
        }
    }

    /// Perform simple field validation to catch bad input.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.account.is_empty() || self.api_token.is_empty() {
            return Err(anyhow!(
                "Credentials are missing. Please make sure your connectors.yaml file is correct. Credentials received: {:#?}", self
            ));
        }
        Ok(())
    }
}
