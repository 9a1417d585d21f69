//! Rest API interface for the QuickSight admin API
//!

use capstan_core::errors::{TargetApplyError, TargetReadError};
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::creds::QuickSightCredentials;

const AUTH_HEADER: &str = "Authorization";

#[derive(Default)]
pub(crate) struct QsRestConfig {
    /// Enable/disable retry logic.
    pub(crate) retry: bool,
}

/// Wrapper struct for http functionality
pub(crate) struct QsRestClient {
    /// The credentials used to authenticate into QuickSight.
    credentials: QuickSightCredentials,
    http_client: ClientWithMiddleware,
}

impl QsRestClient {
    pub(crate) fn new(
        credentials: QuickSightCredentials,
        config: QsRestConfig,
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

    /// The grantee principal ARN for a group in a namespace.
    pub(crate) fn group_principal(&self, namespace: &str, group: &str) -> String {
        format!(
            "arn:aws:quicksight:{}:{}:group/{namespace}/{group}",
            self.credentials.region, self.credentials.account_id
        )
    }

    /// If the URL is explicitly defined, that's used first. Otherwise the
    /// standard regional endpoint is used.
    fn account_url(&self, path: &str) -> String {
        let base = self.credentials.url.to_owned().unwrap_or_else(|| {
            format![
                "https://quicksight.{}.amazonaws.com",
                self.credentials.region
            ]
        });
        format!["{base}/accounts/{}{path}", self.credentials.account_id]
    }

    fn request(&self, method: Method, path: &str) -> reqwest_middleware::RequestBuilder {
        self.http_client
            .request(method, self.account_url(path))
            .header(
                AUTH_HEADER,
                format!["Bearer {}", self.credentials.session_token],
            )
            .header("Accept", "application/json")
    }

    /// GET a single resource; `None` when the target answers 404.
    pub(crate) async fn get_optional(
        &self,
        path: &str,
    ) -> Result<Option<serde_json::Value>, TargetReadError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(|e| TargetReadError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                TargetReadError::PermissionDenied(read_message(response).await),
            ),
            status if !status.is_success() => Err(TargetReadError::Unavailable(format!(
                "{status}: {}",
                read_message(response).await
            ))),
            _ => response
                .json()
                .await
                .map(Some)
                .map_err(|e| TargetReadError::Protocol(e.to_string())),
        }
    }

    /// GET a listing, following `NextToken` pagination and concatenating
    /// the arrays found under `list_key`.
    pub(crate) async fn get_paginated(
        &self,
        path: &str,
        list_key: &str,
    ) -> Result<Vec<serde_json::Value>, TargetReadError> {
        let mut results = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, path);
            if let Some(token) = &next_token {
                request = request.query(&[("next-token", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| TargetReadError::Unavailable(e.to_string()))?;

            match response.status() {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(TargetReadError::PermissionDenied(
                        read_message(response).await,
                    ))
                }
                status if !status.is_success() => {
                    return Err(TargetReadError::Unavailable(format!(
                        "{status}: {}",
                        read_message(response).await
                    )))
                }
                _ => {}
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TargetReadError::Protocol(e.to_string()))?;

            match body[list_key].as_array() {
                Some(page) => results.extend(page.iter().cloned()),
                None => {
                    return Err(TargetReadError::Protocol(format!(
                        "listing response is missing {list_key}"
                    )))
                }
            }

            next_token = body["NextToken"].as_str().map(str::to_owned);
            if next_token.is_none() {
                break;
            }
        }

        Ok(results)
    }

    /// Issue a mutating request and map the response status onto the
    /// apply-error taxonomy.
    pub(crate) async fn write(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), TargetApplyError> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| match &e {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => {
                TargetApplyError::Timeout(e.to_string())
            }
            _ => TargetApplyError::Unavailable(e.to_string()),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = read_message(response).await;
        Err(match status {
            StatusCode::CONFLICT => TargetApplyError::AlreadyExists(message),
            StatusCode::NOT_FOUND => TargetApplyError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => TargetApplyError::RateLimited(message),
            StatusCode::REQUEST_TIMEOUT => TargetApplyError::Timeout(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TargetApplyError::PermissionDenied(message)
            }
            StatusCode::BAD_REQUEST => TargetApplyError::Malformed(message),
            status if status.is_server_error() => {
                TargetApplyError::Unavailable(format!("{status}: {message}"))
            }
            status => TargetApplyError::Other(format!("{status}: {message}")),
        })
    }
}

async fn read_message(response: reqwest::Response) -> String {
    match response.json::<serde_json::Value>().await {
        Ok(body) => body["Message"]
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => "<no response body>".to_owned(),
    }
}
