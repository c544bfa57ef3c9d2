use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ApiError;
use crate::refresh::TokenRefresher;
use crate::session::SessionManager;
use crate::store::UserSummary;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest<'a> {
    new_password: &'a str,
    confirm_new_password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: String,
    #[serde(rename = "refreshToken", alias = "refresh_token")]
    refresh_token: String,
    #[serde(default)]
    user: Option<Value>,
}

/// Client for the Envoice REST API.
///
/// Every authenticated call goes through [`send_authorized`](Self::send_authorized),
/// which refreshes an expired access token first and clears the session
/// when the backend answers `401`.
pub struct ApiClient<R> {
    http_client: reqwest::Client,
    base_url: String,
    session: Arc<SessionManager<R>>,
}

impl<R: TokenRefresher> ApiClient<R> {
    pub fn new(http_client: reqwest::Client, base_url: &str, session: Arc<SessionManager<R>>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn session(&self) -> &SessionManager<R> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `POST /auth/login`; on success the returned credentials become the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserSummary>, ApiError> {
        let resp = self
            .http_client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        if !resp.status().is_success() {
            return Err(status_error("Login failed", resp).await);
        }

        let body: LoginResponse = resp.json().await?;
        let user = body.user.and_then(|raw| match serde_json::from_value::<UserSummary>(raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("Login response user is not usable, ignoring it: {}", e);
                None
            }
        });

        self.session
            .set_session(body.access_token, body.refresh_token, user.clone());
        Ok(user)
    }

    /// `POST /auth/register`. The backend then sends a confirmation email.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<(), ApiError> {
        let resp = self
            .http_client
            .post(self.url("/auth/register"))
            .json(&RegisterRequest {
                username,
                email,
                password,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error("Registration failed", resp).await);
        }
        tracing::info!("Registered {}, confirmation email pending", email);
        Ok(())
    }

    pub async fn resend_confirmation(&self, email: &str) -> Result<(), ApiError> {
        let resp = self
            .http_client
            .post(self.url("/auth/resend-confirmation"))
            .json(&EmailRequest { email })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error("Resending confirmation failed", resp).await);
        }
        Ok(())
    }

    /// `POST /auth/reset-password/{token}` with the new password typed twice.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        confirm_new_password: &str,
    ) -> Result<(), ApiError> {
        if token.is_empty() {
            return Err(ApiError::Validation("Token is missing.".to_string()));
        }
        if new_password != confirm_new_password {
            return Err(ApiError::Validation("Passwords do not match.".to_string()));
        }

        let resp = self
            .http_client
            .post(self.url(&format!("/auth/reset-password/{}", urlencoding::encode(token))))
            .json(&ResetPasswordRequest {
                new_password,
                confirm_new_password,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(status_error("Password reset failed", resp).await);
        }
        Ok(())
    }

    /// Local logout; the backend keeps no session to tear down.
    pub fn logout(&self) {
        self.session.clear_session();
    }

    /// Send a request with the session's bearer token attached.
    pub async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let access_token = self
            .session
            .fresh_access_token()
            .await
            .ok_or(ApiError::NotAuthenticated)?;

        let mut request = self
            .http_client
            .request(method.clone(), self.url(path))
            .bearer_auth(&access_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await?;
        tracing::debug!("{} {} -> {}", method, path, resp.status());

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.session.handle_unauthorized(&access_token);
            return Err(ApiError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(status_error("Request failed", resp).await);
        }
        Ok(resp)
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let resp = self.send_authorized(Method::GET, path, None).await?;
        Ok(resp.json().await?)
    }

    /// Raw body of an authenticated GET, e.g. an invoice PDF.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self.send_authorized(Method::GET, path, None).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

async fn status_error(context: &'static str, resp: reqwest::Response) -> ApiError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    ApiError::Status {
        context,
        status,
        body,
    }
}
