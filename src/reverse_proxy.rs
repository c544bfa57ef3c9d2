use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use axum::http::{Request, Response};

/// Headers that should NOT be forwarded between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body the gateway buffers before forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// HTTP(S) client for forwarding. Redirects are handed back to the browser,
/// never followed here.
pub fn forwarding_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

pub struct ReverseProxy {
    client: reqwest::Client,
    origin: String,
}

impl ReverseProxy {
    pub fn new(client: reqwest::Client, origin: &str) -> Self {
        Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
        }
    }

    /// Forward `req` to `path_and_query` on this proxy's origin.
    ///
    /// Any `Authorization` header from the browser is dropped; when an
    /// access token is given it becomes the only bearer credential sent.
    pub async fn forward(
        &self,
        req: Request<Body>,
        path_and_query: &str,
        access_token: Option<&str>,
    ) -> Result<Response<Body>, Box<dyn std::error::Error + Send + Sync>> {
        let target_url = format!("{}{}", self.origin, path_and_query);

        let (parts, body) = req.into_parts();
        let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;

        tracing::debug!(
            "Forwarding {} {} (body: {} bytes, bearer: {})",
            parts.method,
            target_url,
            body_bytes.len(),
            access_token.is_some()
        );

        let mut headers = parts.headers;
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
        // reqwest sets these itself
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(AUTHORIZATION);

        let mut request = self
            .client
            .request(parts.method, &target_url)
            .headers(headers)
            .body(body_bytes);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let upstream = request.send().await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if HOP_BY_HOP.contains(&name.as_str()) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }
        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_backend;
    use axum::http::header::LOCATION;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::any;
    use axum::{Json, Router};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};

    async fn echo_backend() -> String {
        let app = Router::new().route(
            "/*rest",
            any(|uri: Uri, headers: HeaderMap, body: String| async move {
                Json(json!({
                    "uri": uri.to_string(),
                    "auth": headers.get("authorization").and_then(|v| v.to_str().ok()),
                    "custom": headers.get("x-envoice-client").and_then(|v| v.to_str().ok()),
                    "body": body,
                }))
            }),
        );
        spawn_backend(app).await
    }

    async fn json_body(resp: Response<Body>) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_forward_replaces_browser_authorization() {
        let proxy = ReverseProxy::new(forwarding_client().unwrap(), &echo_backend().await);
        let req = Request::builder()
            .method("POST")
            .uri("/api/clients/create")
            .header("authorization", "Bearer forged")
            .header("x-envoice-client", "web")
            .body(Body::from("{\"name\":\"Acme\"}"))
            .unwrap();

        let resp = proxy.forward(req, "/clients/create", Some("T1")).await.unwrap();
        let body = json_body(resp).await;

        assert_eq!(body["uri"], "/clients/create");
        assert_eq!(body["auth"], "Bearer T1");
        assert_eq!(body["custom"], "web");
        assert_eq!(body["body"], "{\"name\":\"Acme\"}");
    }

    #[tokio::test]
    async fn test_forward_without_token_sends_no_authorization() {
        let proxy = ReverseProxy::new(forwarding_client().unwrap(), &echo_backend().await);
        let req = Request::builder()
            .uri("/about?lang=en")
            .header("authorization", "Bearer forged")
            .body(Body::empty())
            .unwrap();

        let body = json_body(proxy.forward(req, "/about?lang=en", None).await.unwrap()).await;
        assert_eq!(body["uri"], "/about?lang=en");
        assert_eq!(body["auth"], Value::Null);
    }

    #[tokio::test]
    async fn test_forward_returns_redirects_unfollowed() {
        let app = Router::new().route(
            "/old",
            any(|| async { (StatusCode::FOUND, [(LOCATION, "/new")]) }),
        );
        let proxy = ReverseProxy::new(forwarding_client().unwrap(), &spawn_backend(app).await);
        let req = Request::builder().uri("/old").body(Body::empty()).unwrap();

        let resp = proxy.forward(req, "/old", None).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "/new");
    }

    #[tokio::test]
    async fn test_forward_accepts_https_origin() {
        // Nothing listens on port 9; the call must get as far as connecting
        let proxy = ReverseProxy::new(forwarding_client().unwrap(), "https://127.0.0.1:9");
        let req = Request::builder().uri("/invoices").body(Body::empty()).unwrap();

        let err = proxy.forward(req, "/invoices", Some("T1")).await.unwrap_err();
        let err = err.downcast_ref::<reqwest::Error>().unwrap();
        assert!(err.is_connect(), "unexpected error: {err:?}");
    }
}
