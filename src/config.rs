use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Origin serving the web app's pages.
    #[serde(default = "default_upstream")]
    pub upstream: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: default_upstream(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the Envoice REST API.
    pub url: String,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Keep credentials on disk across restarts. Off means memory only.
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub expiry_leeway_secs: u64,
    #[serde(default = "default_login_path")]
    pub login_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            persist: true,
            retention_days: default_retention_days(),
            expiry_leeway_secs: 0,
            login_path: default_login_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    #[serde(rename = "match")]
    pub match_rule: MatchRule,
    #[serde(default = "default_auth_mode")]
    pub auth: AuthMode,
    #[serde(default)]
    pub on_unauthenticated: UnauthAction,
    #[serde(default)]
    pub target: RouteTarget,
    /// Removed from the request path before forwarding, e.g. `/api`.
    #[serde(default)]
    pub strip_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    #[default]
    Upstream,
    Backend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchRule {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnauthAction {
    #[default]
    RedirectLogin,
    Status401,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_upstream() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".envoice/credentials.json")
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    7
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Required
}

/// Dashboard pages need a session, API calls need one and get the bearer
/// token attached, everything else is public.
fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule {
            match_rule: MatchRule {
                path: "/dashboard/**".to_string(),
                methods: Vec::new(),
            },
            auth: AuthMode::Required,
            on_unauthenticated: UnauthAction::RedirectLogin,
            target: RouteTarget::Upstream,
            strip_prefix: None,
        },
        RouteRule {
            match_rule: MatchRule {
                path: "/api/**".to_string(),
                methods: Vec::new(),
            },
            auth: AuthMode::Required,
            on_unauthenticated: UnauthAction::Status401,
            target: RouteTarget::Backend,
            strip_prefix: Some("/api".to_string()),
        },
        RouteRule {
            match_rule: MatchRule {
                path: "/**".to_string(),
                methods: Vec::new(),
            },
            auth: AuthMode::None,
            on_unauthenticated: UnauthAction::RedirectLogin,
            target: RouteTarget::Upstream,
            strip_prefix: None,
        },
    ]
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        if config.backend.url.trim().is_empty() {
            return Err("backend.url must not be empty".into());
        }
        Ok(config)
    }

    /// Config for commands run without a config file, pointed at `backend_url`.
    pub fn with_backend(backend_url: &str) -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig {
                url: backend_url.to_string(),
                refresh_timeout_secs: default_refresh_timeout(),
            },
            session: SessionConfig::default(),
            routes: default_routes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = GatewayConfig::parse("backend:\n  url: http://localhost:4567\n").unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:3000");
        assert_eq!(config.backend.refresh_timeout_secs, 10);
        assert_eq!(config.session.retention_days, 7);
        assert_eq!(config.session.expiry_leeway_secs, 0);
        assert_eq!(config.session.login_path, "/login");
        assert!(config.session.persist);
        assert_eq!(config.routes.len(), 3);
        assert_eq!(config.routes[1].target, RouteTarget::Backend);
        assert_eq!(config.routes[1].on_unauthenticated, UnauthAction::Status401);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  listen: 0.0.0.0:8080
  upstream: http://frontend:3000
backend:
  url: https://api.envoice.test
  refresh_timeout_secs: 3
session:
  store_path: /var/lib/envoice/creds.json
  persist: false
  retention_days: 1
  expiry_leeway_secs: 30
  login_path: /signin
routes:
  - match:
      path: /dashboard/**
      methods: [GET]
  - match:
      path: /api/**
    on_unauthenticated: status401
    target: backend
    strip_prefix: /api
  - match:
      path: /**
    auth: none
"#;
        let config = GatewayConfig::parse(yaml).unwrap();

        assert_eq!(config.server.upstream, "http://frontend:3000");
        assert_eq!(config.backend.refresh_timeout_secs, 3);
        assert!(!config.session.persist);
        assert_eq!(config.session.login_path, "/signin");
        assert_eq!(config.routes[0].auth, AuthMode::Required);
        assert_eq!(config.routes[0].match_rule.methods, vec!["GET".to_string()]);
        assert_eq!(config.routes[1].strip_prefix.as_deref(), Some("/api"));
        assert_eq!(config.routes[2].auth, AuthMode::None);
    }

    #[test]
    fn test_empty_backend_url_rejected() {
        assert!(GatewayConfig::parse("backend:\n  url: \"\"\n").is_err());
        assert!(GatewayConfig::parse("server:\n  listen: 127.0.0.1:1\n").is_err());
    }
}
