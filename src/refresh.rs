use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::RefreshError;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Exchanges a refresh token for a new access/refresh pair.
///
/// One attempt per call. Retrying, or giving up on the session, is the
/// caller's decision.
pub trait TokenRefresher: Send + Sync {
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenPair, RefreshError>> + Send;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Body of `/auth/refresh`. The backend has shipped both camelCase and
/// snake_case names.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken", alias = "access_token", default)]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", alias = "refresh_token", default)]
    refresh_token: Option<String>,
}

/// Talks to the backend's `/auth/refresh` endpoint.
pub struct RefreshCoordinator {
    http_client: reqwest::Client,
    refresh_url: String,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(http_client: reqwest::Client, backend_url: &str, timeout: Duration) -> Self {
        Self {
            http_client,
            refresh_url: format!("{}/auth/refresh", backend_url.trim_end_matches('/')),
            timeout,
        }
    }
}

impl TokenRefresher for RefreshCoordinator {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        tracing::debug!("Refreshing access token via {}", self.refresh_url);

        let resp = self
            .http_client
            .post(&self.refresh_url)
            .timeout(self.timeout)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RefreshError::Timeout
                } else {
                    RefreshError::Request(e)
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected { status, body });
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| RefreshError::Malformed(e.to_string()))?;

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::Malformed("response has no access token".to_string()))?;

        // Rotation is optional on the backend side: keep the old refresh
        // token when no new one comes back.
        let refresh_token = body
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}
