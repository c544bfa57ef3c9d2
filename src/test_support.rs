//! Shared fixtures for the unit tests.

use axum::Router;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RefreshError;
use crate::refresh::{TokenPair, TokenRefresher};
use crate::session::SessionManager;
use crate::store::CredentialStore;
use crate::token::TokenCodec;

/// Unsigned three-segment token carrying `payload` as its claims.
pub fn token_with_payload(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.signature", header, claims)
}

pub fn token_expiring_in(secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    token_with_payload(&serde_json::json!({ "sub": "u1", "exp": exp }))
}

pub fn fresh_token() -> String {
    token_expiring_in(3600)
}

pub fn expired_token() -> String {
    token_expiring_in(-3600)
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_backend(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Scripted `TokenRefresher` that counts how often it is asked.
pub struct FakeRefresher {
    outcome: Mutex<Option<TokenPair>>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeRefresher {
    pub fn succeeding(access_token: &str, refresh_token: &str) -> Self {
        Self {
            outcome: Mutex::new(Some(TokenPair {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
            })),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            outcome: Mutex::new(None),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Handle on the call counter that outlives the refresher.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = self.outcome.lock().unwrap().clone();
        outcome.ok_or(RefreshError::Rejected {
            status: 401,
            body: "refresh token revoked".to_string(),
        })
    }
}

/// Session manager over a fresh in-memory store.
pub fn manager_with(refresher: FakeRefresher) -> Arc<SessionManager<FakeRefresher>> {
    Arc::new(SessionManager::new(
        CredentialStore::in_memory(7),
        refresher,
        TokenCodec::default(),
    ))
}
