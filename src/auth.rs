use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

use crate::middleware::{json_error, json_response, redirect_response};
use crate::GatewayState;

/// Where the app lands after a successful login.
const HOME_PATH: &str = "/dashboard/home";

/// Largest login/register body accepted.
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Body of POST /auth/login
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    /// Page to return to, as carried by the login redirect.
    #[serde(default)]
    pub redirect: Option<String>,
}

/// Body of POST /auth/register
#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Query params for /auth/logout
#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    pub redirect: Option<String>,
}

// ============================================================================
// LOGIN
// ============================================================================

/// Handle POST /auth/login
///
/// Exchanges email and password for a token pair. The pair stays in the
/// gateway; the browser only gets the user and where to go next.
pub async fn handle_login(state: Arc<GatewayState>, form: LoginForm) -> Response<Body> {
    match state.api.login(&form.email, &form.password).await {
        Ok(user) => {
            let redirect = form
                .redirect
                .filter(|r| is_local_path(r))
                .unwrap_or_else(|| HOME_PATH.to_string());
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "authenticated": true,
                    "user": user,
                    "redirect": redirect,
                }),
            )
        }
        Err(e) => {
            tracing::info!("Login for {} failed: {}", form.email, e);
            json_error(status_of(e.status_code()), &e.to_string())
        }
    }
}

// ============================================================================
// REGISTER
// ============================================================================

/// Handle POST /auth/register. No session is created; the account needs
/// email confirmation first.
pub async fn handle_register(state: Arc<GatewayState>, form: RegisterForm) -> Response<Body> {
    match state
        .api
        .register(&form.username, &form.email, &form.password)
        .await
    {
        Ok(()) => json_response(
            StatusCode::CREATED,
            serde_json::json!({
                "status": "confirmation_sent",
                "email": form.email,
                "redirect": format!("/email-confirmation?email={}", urlencoding::encode(&form.email)),
            }),
        ),
        Err(e) => {
            tracing::info!("Registration for {} failed: {}", form.email, e);
            json_error(status_of(e.status_code()), &e.to_string())
        }
    }
}

// ============================================================================
// LOGOUT
// ============================================================================

/// Handle GET /auth/logout. Local only: the backend has no logout call.
pub async fn handle_logout(state: Arc<GatewayState>, query: LogoutQuery) -> Response<Body> {
    state.api.logout();

    let target = query
        .redirect
        .filter(|r| is_local_path(r))
        .unwrap_or_else(|| state.guard.login_path().to_string());
    redirect_response(&target)
}

// ============================================================================
// SESSION
// ============================================================================

/// Handle GET /auth/session: the session as the browser may see it.
/// Tokens are never included.
pub async fn handle_session(state: Arc<GatewayState>) -> Response<Body> {
    let session = state.session.snapshot();
    let phase = session.phase();
    let body = serde_json::json!({
        "phase": phase.to_string(),
        "loading": session.is_loading,
        "authenticated": session.access_token.is_some(),
        "user": session.user,
    });
    json_response(StatusCode::OK, body)
}

// ============================================================================
// HELPERS
// ============================================================================

/// Parse a JSON or form-encoded request body.
pub async fn read_form<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let bytes = axum::body::to_bytes(req.into_body(), MAX_FORM_BYTES)
        .await
        .map_err(|_| json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"))?;

    let parsed = if is_form {
        serde_urlencoded::from_bytes(&bytes).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    };

    parsed.map_err(|e| {
        tracing::debug!("Rejected auth form: {}", e);
        json_error(StatusCode::BAD_REQUEST, "Malformed request body")
    })
}

/// Only same-origin paths are accepted as post-login/logout targets.
fn is_local_path(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//")
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_local_path() {
        assert!(is_local_path("/dashboard/invoices"));
        assert!(!is_local_path("//evil.example/x"));
        assert!(!is_local_path("https://evil.example"));
        assert!(!is_local_path(""));
    }

    #[tokio::test]
    async fn test_read_form_json_and_urlencoded() {
        let req = Request::builder()
            .header("content-type", "application/json")
            .body(Body::from(r#"{"email":"a@b.com","password":"pw","redirect":"/dashboard/clients"}"#))
            .unwrap();
        let form: LoginForm = read_form(req).await.unwrap();
        assert_eq!(form.email, "a@b.com");
        assert_eq!(form.redirect.as_deref(), Some("/dashboard/clients"));

        let req = Request::builder()
            .header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
            .body(Body::from("username=acme&email=a%40b.com&password=pw"))
            .unwrap();
        let form: RegisterForm = read_form(req).await.unwrap();
        assert_eq!(form.username, "acme");
        assert_eq!(form.email, "a@b.com");
    }

    #[tokio::test]
    async fn test_read_form_rejects_malformed_body() {
        let req = Request::builder()
            .header("content-type", "application/json")
            .body(Body::from("{\"email\":"))
            .unwrap();
        let resp = read_form::<LoginForm>(req).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
