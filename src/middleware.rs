use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode};
use std::sync::Arc;

use crate::auth;
use crate::config::{AuthMode, RouteTarget, UnauthAction};
use crate::guard::GuardDecision;
use crate::route_matcher::{match_route, strip_path_prefix};
use crate::GatewayState;

/// Shown on guarded pages until the startup restore settles.
const LOADING_PAGE: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\">\
<meta http-equiv=\"refresh\" content=\"1\"><title>Envoice</title></head>\
<body><p role=\"status\">Loading...</p></body></html>\n";

/// Main request handler: auth routes, route guard, then forwarding.
pub async fn handle_request(state: Arc<GatewayState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());

    // ── Auth routes (handled here, not forwarded) ────────────────────
    if path.starts_with("/auth/") {
        return handle_auth_route(state, req, &path, &path_and_query).await;
    }

    // ── Match route against config rules ─────────────────────────────
    let rule = match_route(&state.config.routes, &path, &method);

    let auth_mode = rule.map(|r| r.auth.clone()).unwrap_or(AuthMode::Optional);
    let unauth_action = rule
        .map(|r| r.on_unauthenticated.clone())
        .unwrap_or_default();
    let target = rule.map(|r| r.target.clone()).unwrap_or_default();
    let forward_path = match rule.and_then(|r| r.strip_prefix.as_deref()) {
        Some(prefix) => strip_path_prefix(&path_and_query, prefix),
        None => path_and_query.clone(),
    };

    match target {
        // ── Pages: the route guard decides, freshness is not re-checked ──
        RouteTarget::Upstream => {
            if auth_mode == AuthMode::Required {
                if let Some(resp) = guard_page(&state, &path_and_query, &unauth_action).await {
                    return resp;
                }
            }
            forward(&state, &target, req, &forward_path, None).await
        }

        // ── API: attach a fresh bearer token, watch for 401 ─────────────
        RouteTarget::Backend => {
            let access_token = match auth_mode {
                AuthMode::None => None,
                AuthMode::Optional | AuthMode::Required => {
                    state.session.settled().await;
                    state.session.fresh_access_token().await
                }
            };

            if access_token.is_none() && auth_mode == AuthMode::Required {
                return unauthenticated(&state, &path_and_query, &unauth_action);
            }

            let resp = forward(&state, &target, req, &forward_path, access_token.as_deref()).await;
            if let Some(sent) = access_token.as_deref() {
                if resp.status() == StatusCode::UNAUTHORIZED {
                    state.session.handle_unauthorized(sent);
                }
            }
            resp
        }
    }
}

/// Route /auth/* requests to the appropriate auth handler. Anything the
/// gateway does not own goes to the backend without a bearer token.
async fn handle_auth_route(
    state: Arc<GatewayState>,
    req: Request<Body>,
    path: &str,
    path_and_query: &str,
) -> Response<Body> {
    match (req.method().clone(), path) {
        (Method::POST, "/auth/login") => match auth::read_form(req).await {
            Ok(form) => auth::handle_login(state, form).await,
            Err(resp) => resp,
        },
        (Method::POST, "/auth/register") => match auth::read_form(req).await {
            Ok(form) => auth::handle_register(state, form).await,
            Err(resp) => resp,
        },
        (_, "/auth/login" | "/auth/register") => {
            json_error(StatusCode::METHOD_NOT_ALLOWED, "Use POST")
        }
        (_, "/auth/logout") => {
            let query: auth::LogoutQuery = req
                .uri()
                .query()
                .and_then(|q| serde_urlencoded::from_str(q).ok())
                .unwrap_or(auth::LogoutQuery { redirect: None });
            auth::handle_logout(state, query).await
        }
        (Method::GET, "/auth/session") => auth::handle_session(state).await,
        // Refresh stays internal; the refresh token never leaves the gateway
        (_, "/auth/refresh") => json_error(StatusCode::NOT_FOUND, "Unknown auth endpoint"),
        _ => forward(&state, &RouteTarget::Backend, req, path_and_query, None).await,
    }
}

async fn guard_page(
    state: &GatewayState,
    path_and_query: &str,
    unauth_action: &UnauthAction,
) -> Option<Response<Body>> {
    match unauth_action {
        UnauthAction::RedirectLogin => {
            match state.guard.decide(&state.session.snapshot(), path_and_query) {
                GuardDecision::Loading => Some(loading_response()),
                GuardDecision::Redirect(login_url) => {
                    tracing::debug!("No session for {}, redirecting to login", path_and_query);
                    Some(redirect_response(&login_url))
                }
                GuardDecision::Render => None,
            }
        }
        UnauthAction::Status401 => {
            let session = state.session.settled().await;
            if session.access_token.is_none() {
                Some(json_error(StatusCode::UNAUTHORIZED, "Authentication required"))
            } else {
                None
            }
        }
    }
}

fn unauthenticated(
    state: &GatewayState,
    path_and_query: &str,
    unauth_action: &UnauthAction,
) -> Response<Body> {
    match unauth_action {
        UnauthAction::Status401 => json_error(StatusCode::UNAUTHORIZED, "Authentication required"),
        UnauthAction::RedirectLogin => redirect_response(&state.guard.login_url(path_and_query)),
    }
}

async fn forward(
    state: &GatewayState,
    target: &RouteTarget,
    req: Request<Body>,
    path_and_query: &str,
    access_token: Option<&str>,
) -> Response<Body> {
    let proxy = match target {
        RouteTarget::Upstream => &state.upstream_proxy,
        RouteTarget::Backend => &state.backend_proxy,
    };

    match proxy.forward(req, path_and_query, access_token).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!("Forwarding {} failed: {}", path_and_query, e);
            json_error(StatusCode::BAD_GATEWAY, "Upstream service unavailable")
        }
    }
}

fn loading_response() -> Response<Body> {
    let mut resp = Response::new(Body::from(LOADING_PAGE));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

pub fn redirect_response(location: &str) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::FOUND;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            resp.headers_mut().insert(LOCATION, value);
            resp
        }
        Err(_) => json_error(StatusCode::BAD_REQUEST, "Invalid redirect target"),
    }
}

pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, serde_json::json!({ "error": message }))
}
