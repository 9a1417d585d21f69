//! Rest API interface for Okta
//!

use capstan_core::errors::IdentitySourceError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::creds::OktaCredentials;

const AUTH_HEADER: &str = "Authorization";
const PAGE_LIMIT: &str = "200";

#[derive(Default)]
pub(crate) struct OktaRestConfig {
    /// Enable/disable retry logic.
    pub(crate) retry: bool,
}

/// Wrapper struct for http functionality
pub(crate) struct OktaRestClient {
    /// The credentials used to authenticate into Okta.
    credentials: OktaCredentials,
    http_client: ClientWithMiddleware,
}

impl OktaRestClient {
    pub(crate) fn new(
        credentials: OktaCredentials,
        config: OktaRestConfig,
    ) -> anyhow::Result<Self> {
        credentials.validate()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let mut client_builder = ClientBuilder::new(reqwest::Client::new());
        if config.retry {
            client_builder =
                client_builder.with(RetryTransientMiddleware::new_with_policy(retry_policy))
        }
        let client = client_builder.build();
        Ok(Self {
            credentials,
            http_client: client,
        })
    }

    /// If the URL is explicitly defined, that's used first. Otherwise the
    /// standard Okta org URL is derived from the account.
    fn get_url(&self, path: &str) -> String {
        let base = self.credentials.url.to_owned().unwrap_or_else(|| {
            format!["https://{}.okta.com", self.credentials.account]
        });
        format!["{base}{path}"]
    }

    /// GET a collection endpoint, following cursor pagination until the
    /// provider signals end-of-list.
    pub(crate) async fn get_paginated(
        &self,
        path: &str,
    ) -> Result<Vec<serde_json::Value>, IdentitySourceError> {
        let mut results = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut request = self
                .http_client
                .get(self.get_url(path))
                .query(&[("limit", PAGE_LIMIT)])
                .header(AUTH_HEADER, format!["SSWS {}", self.credentials.api_token])
                .header("Accept", "application/json");
            if let Some(cursor) = &after {
                request = request.query(&[("after", cursor.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| IdentitySourceError::Transport(e.to_string()))?;

            match response.status() {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(IdentitySourceError::Auth(format!(
                        "okta rejected the api token ({})",
                        response.status()
                    )))
                }
                status if !status.is_success() => {
                    return Err(IdentitySourceError::Transport(format!(
                        "okta answered {status} for {path}"
                    )))
                }
                _ => {}
            }

            after = next_cursor(response.headers());

            let page: Vec<serde_json::Value> = response
                .json()
                .await
                .map_err(|e| IdentitySourceError::Protocol(e.to_string()))?;
            results.extend(page);

            if after.is_none() {
                break;
            }
        }

        Ok(results)
    }
}

/// Extract the `after` cursor from the `Link: <...>; rel="next"` header,
/// if the provider reported another page.
fn next_cursor(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(reqwest::header::LINK) {
        let raw = value.to_str().ok()?;
        for link in raw.split(',') {
            if !link.contains(r#"rel="next""#) {
                continue;
            }
            let url = link.split('<').nth(1)?.split('>').next()?;
            for param in url.split('?').nth(1)?.split('&') {
                if let Some(cursor) = param.strip_prefix("after=") {
                    return Some(cursor.to_owned());
                }
            }
        }
    }
    None
}
