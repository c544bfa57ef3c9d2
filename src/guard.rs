use crate::session::Session;

/// What a protected route should do with the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Restore has not settled yet: show a neutral loading state, do not redirect.
    Loading,
    /// Signed out: send the user to this login URL and render nothing else.
    Redirect(String),
    /// Signed in: render the protected content.
    Render,
}

/// Gate in front of protected pages.
///
/// Only presence of an access token is checked. Freshness is the session
/// manager's concern, not the guard's.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    login_path: String,
}

impl RouteGuard {
    pub fn new(login_path: &str) -> Self {
        Self {
            login_path: login_path.to_string(),
        }
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn decide(&self, session: &Session, requested_path: &str) -> GuardDecision {
        if session.is_loading {
            return GuardDecision::Loading;
        }
        if session.access_token.is_none() {
            return GuardDecision::Redirect(self.login_url(requested_path));
        }
        GuardDecision::Render
    }

    /// Login entry point, remembering where the user was headed.
    pub fn login_url(&self, requested_path: &str) -> String {
        if requested_path.is_empty() || requested_path == self.login_path {
            return self.login_path.clone();
        }
        format!(
            "{}?redirect={}",
            self.login_path,
            urlencoding::encode(requested_path)
        )
    }
}
