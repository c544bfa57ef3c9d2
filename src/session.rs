use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{watch, Mutex};

use crate::error::RestoreError;
use crate::refresh::TokenRefresher;
use crate::store::{CredentialStore, UserSummary};
use crate::token::TokenCodec;

/// In-memory view of who is signed in.
///
/// Both tokens are present or both are absent. `is_loading` is only true
/// before the startup restore has settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserSummary>,
    pub is_loading: bool,
}

impl Session {
    fn restoring() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            user: None,
            is_loading: true,
        }
    }

    fn signed_out() -> Self {
        Self {
            is_loading: false,
            ..Self::restoring()
        }
    }

    fn signed_in(access_token: String, refresh_token: String, user: Option<UserSummary>) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            user,
            is_loading: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_loading {
            SessionPhase::Restoring
        } else if self.access_token.is_some() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Restoring,
    Authenticated,
    Unauthenticated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Restoring => "restoring",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Unauthenticated => "unauthenticated",
        };
        f.write_str(label)
    }
}

/// Single source of truth for the current session.
///
/// Construct one per process, call [`restore`](Self::restore) once, then
/// use `set_session` / `clear_session` for explicit login and logout. State
/// changes are published on a watch channel; route guards and API callers
/// observe it through [`subscribe`](Self::subscribe) or
/// [`settled`](Self::settled).
///
/// Every error in here is absorbed and resolved to either the authenticated
/// or unauthenticated state.
pub struct SessionManager<R> {
    state: watch::Sender<Session>,
    store: CredentialStore,
    refresher: R,
    codec: TokenCodec,
    restore_started: AtomicBool,
    /// Bumped on every applied change, only while the watch value is
    /// write-locked. A refresh result is applied only if it is unchanged.
    generation: AtomicU64,
    /// Held for the duration of any refresh so only one is in flight.
    refresh_lock: Mutex<()>,
}

/// How the startup restore ended.
enum Restored {
    /// Stored credentials were still valid; nothing to persist.
    Stored(Session),
    /// The access token had expired and was refreshed.
    Refreshed(Session),
    Nothing,
}

impl<R: TokenRefresher> SessionManager<R> {
    pub fn new(store: CredentialStore, refresher: R, codec: TokenCodec) -> Self {
        let (state, _) = watch::channel(Session::restoring());
        Self {
            state,
            store,
            refresher,
            codec,
            restore_started: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    /// What the credential store currently holds, read failures as empty.
    #[cfg(test)]
    pub fn store_snapshot(&self) -> Option<crate::store::StoredCredential> {
        self.store.read().unwrap_or_else(|e| {
            tracing::warn!("Failed to read credential store: {}", e);
            None
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Wait until the startup restore has settled and return that state.
    pub async fn settled(&self) -> Session {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|s| !s.is_loading).await {
            Ok(session) => session.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    /// Rebuild the session from the credential store. Runs at most once per
    /// manager; later calls just report the current phase.
    pub async fn restore(&self) -> SessionPhase {
        if self.restore_started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Session restore already ran, ignoring");
            return self.snapshot().phase();
        }

        let (restored, persist) = match self.try_restore().await {
            Ok(Restored::Stored(session)) => (session, false),
            Ok(Restored::Refreshed(session)) => (session, true),
            // Signed out: clear whatever half-usable state is on disk
            Ok(Restored::Nothing) => (Session::signed_out(), true),
            Err(e) => {
                tracing::error!("Session restore failed, starting signed out: {}", e);
                (Session::signed_out(), true)
            }
        };

        let phase = restored.phase();
        // An explicit login or logout flips `is_loading` first and wins
        if self.apply_if(|current, _| current.is_loading, restored, persist) {
            tracing::info!("Session restored: {}", phase);
            phase
        } else {
            tracing::debug!("Session changed during restore, keeping explicit state");
            self.snapshot().phase()
        }
    }

    async fn try_restore(&self) -> Result<Restored, RestoreError> {
        let Some(stored) = self.store.read()? else {
            tracing::info!("No stored credentials found");
            return Ok(Restored::Nothing);
        };

        if !self.codec.is_expired(&stored.access_token) {
            tracing::debug!("Stored access token is still valid");
            return Ok(Restored::Stored(Session::signed_in(
                stored.access_token,
                stored.refresh_token,
                stored.user,
            )));
        }

        tracing::info!("Stored access token is expired, attempting refresh");
        let _guard = self.refresh_lock.lock().await;
        match self.refresher.refresh(&stored.refresh_token).await {
            Ok(pair) => Ok(Restored::Refreshed(Session::signed_in(
                pair.access_token,
                pair.refresh_token,
                stored.user,
            ))),
            Err(e) => {
                tracing::warn!("Token refresh failed during restore: {}", e);
                Ok(Restored::Nothing)
            }
        }
    }

    /// Replace the whole session, e.g. after login, and persist it.
    pub fn set_session(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        user: Option<UserSummary>,
    ) {
        match &user {
            Some(user) => tracing::info!("Session set for {}", user.display_name()),
            None => tracing::info!("Session set"),
        }
        let next = Session::signed_in(access_token.into(), refresh_token.into(), user);
        self.apply_if(|_, _| true, next, true);
    }

    /// Forget the session locally. The backend is not told.
    pub fn clear_session(&self) {
        self.apply_if(|_, _| true, Session::signed_out(), true);
        tracing::info!("Session cleared");
    }

    /// The backend answered `401` to a call made with `rejected_token`.
    /// The session is cleared unless that token has already been replaced.
    pub fn handle_unauthorized(&self, rejected_token: &str) {
        let cleared = self.apply_if(
            |current, _| current.access_token.as_deref() == Some(rejected_token),
            Session::signed_out(),
            true,
        );
        if cleared {
            tracing::warn!("Backend rejected the access token, session cleared");
        } else {
            tracing::debug!("Backend rejected a superseded access token, keeping session");
        }
    }

    /// Access token for an outgoing API call, refreshed first if it has
    /// expired. Concurrent callers share a single refresh. `None` means there
    /// is no usable session any more.
    pub async fn fresh_access_token(&self) -> Option<String> {
        let current = self.snapshot();
        let access_token = current.access_token?;
        if !self.codec.is_expired(&access_token) {
            return Some(access_token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Someone else may have refreshed (or logged out) while we waited
        let (generation, current) = self.observe();
        let (access_token, refresh_token) = (current.access_token?, current.refresh_token?);
        if !self.codec.is_expired(&access_token) {
            return Some(access_token);
        }

        tracing::info!("Access token expired mid-session, refreshing");
        let unchanged = |_: &Session, now: u64| now == generation;
        match self.refresher.refresh(&refresh_token).await {
            Ok(pair) => {
                let next = Session::signed_in(pair.access_token, pair.refresh_token, current.user);
                if !self.apply_if(unchanged, next, true) {
                    tracing::info!("Session changed during refresh, discarding refreshed tokens");
                }
                self.snapshot().access_token
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                if self.apply_if(unchanged, Session::signed_out(), true) {
                    tracing::info!("Session cleared");
                }
                self.snapshot().access_token
            }
        }
    }

    /// Generation and state, read together.
    fn observe(&self) -> (u64, Session) {
        let current = self.state.borrow();
        (self.generation.load(Ordering::SeqCst), current.clone())
    }

    /// Replace the state with `next` if `allow` accepts the current state and
    /// generation. The check, the store update and the publish all happen
    /// under the watch write lock, so they cannot interleave with another
    /// change.
    fn apply_if(
        &self,
        allow: impl FnOnce(&Session, u64) -> bool,
        next: Session,
        persist: bool,
    ) -> bool {
        self.state.send_if_modified(|current| {
            if !allow(current, self.generation.load(Ordering::SeqCst)) {
                return false;
            }
            if persist {
                self.persist(&next);
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *current = next;
            true
        })
    }

    fn persist(&self, session: &Session) {
        let result = match (&session.access_token, &session.refresh_token) {
            (Some(access), Some(refresh)) => {
                self.store.write(access, refresh, session.user.as_ref())
            }
            _ => self.store.clear(),
        };
        if let Err(e) = result {
            tracing::error!("Failed to persist session: {}", e);
        }
    }
}
