mod api;
mod auth;
mod commands;
mod config;
mod error;
mod guard;
mod middleware;
mod refresh;
mod reverse_proxy;
mod route_matcher;
mod session;
mod store;
mod token;

#[cfg(test)]
mod test_support;

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use api::ApiClient;
use commands::Command;
use config::GatewayConfig;
use guard::RouteGuard;
use refresh::RefreshCoordinator;
use reverse_proxy::ReverseProxy;
use session::SessionManager;
use store::CredentialStore;
use token::TokenCodec;

/// Envoice session gateway and command-line client
#[derive(Parser)]
#[command(name = "envoice-gateway", about = "Session gateway for the Envoice invoicing app")]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "gateway.yaml")]
    config: PathBuf,

    /// Base URL of the Envoice REST API (overrides backend.url)
    #[arg(long, env = "ENVOICE_API_BASE_URL")]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Shared application state available to all request handlers.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub session: Arc<SessionManager<RefreshCoordinator>>,
    pub api: ApiClient<RefreshCoordinator>,
    pub guard: RouteGuard,
    pub upstream_proxy: ReverseProxy,
    pub backend_proxy: ReverseProxy,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::new();
        let session = build_session(&config, &http_client);
        let api = ApiClient::new(http_client, &config.backend.url, Arc::clone(&session));
        let forwarding = reverse_proxy::forwarding_client()?;

        Ok(Self {
            guard: RouteGuard::new(&config.session.login_path),
            upstream_proxy: ReverseProxy::new(forwarding.clone(), &config.server.upstream),
            backend_proxy: ReverseProxy::new(forwarding, &config.backend.url),
            session,
            api,
            config,
        })
    }
}

/// Session manager wired to the configured store and backend. Not yet restored.
pub fn build_session(
    config: &GatewayConfig,
    http_client: &reqwest::Client,
) -> Arc<SessionManager<RefreshCoordinator>> {
    let store = if config.session.persist {
        CredentialStore::file(&config.session.store_path, config.session.retention_days)
    } else {
        CredentialStore::in_memory(config.session.retention_days)
    };
    let refresher = RefreshCoordinator::new(
        http_client.clone(),
        &config.backend.url,
        Duration::from_secs(config.backend.refresh_timeout_secs),
    );
    let codec = TokenCodec::new(config.session.expiry_leeway_secs);

    Arc::new(SessionManager::new(store, refresher, codec))
}

/// All requests go through the gateway pipeline in `middleware`.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .fallback(move |req: Request<Body>| {
            let state = Arc::clone(&state);
            async move { middleware::handle_request(state, req).await }
        })
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "envoice_gateway=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match (GatewayConfig::load(&cli.config), &cli.backend_url) {
        (Ok(config), _) => config,
        // No config file is fine as long as we know where the backend is
        (Err(_), Some(url)) if !cli.config.exists() => GatewayConfig::with_backend(url),
        (Err(e), _) => {
            eprintln!("Failed to load config from {:?}: {}", cli.config, e);
            std::process::exit(1);
        }
    };
    if let Some(url) = cli.backend_url {
        config.backend.url = url;
    }

    if let Err(e) = commands::run(cli.command.unwrap_or(Command::Serve), config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

pub async fn serve(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Envoice gateway starting");
    tracing::info!("  Upstream: {}", config.server.upstream);
    tracing::info!("  Backend:  {}", config.backend.url);
    tracing::info!("  Listen:   {}", config.server.listen);
    tracing::info!("  Routes:   {} rules", config.routes.len());

    let listen_addr = config.server.listen.clone();
    let state = Arc::new(GatewayState::new(config)?);

    // Restore in the background; guarded pages show a loading state until it settles
    let session = Arc::clone(&state.session);
    tokio::spawn(async move {
        session.restore().await;
    });

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("Envoice gateway listening on {}", listen_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
