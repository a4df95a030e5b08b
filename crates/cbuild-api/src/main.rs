//! cbuild API server

use anyhow::Context;
use cbuild_api::services::github::GitHubClient;
use cbuild_api::services::token_cache::{InstallationTokenIssuer, TokenCache, TokenIssuer};
use cbuild_api::state::Services;
use cbuild_api::{AppState, routes};
use cbuild_config::SystemConfig;
use cbuild_config::system::load_system_config;
use cbuild_core::clock::{Clock, SystemClock};
use cbuild_core::store::{ExecutionStore, LockStore};
use cbuild_db::{
    DEFAULT_MAX_CONNECTIONS, MemoryExecutionStore, MemoryLockStore, PgExecutionStore, PgLockStore,
    create_pool, run_migrations,
};
use cbuild_executor::{DockerJobDriver, LocalSourceStager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOKEN_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("CBUILD_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading system config");
            load_system_config(Path::new(&path))
                .with_context(|| format!("failed to load {}", path))?
        }
        Err(_) => {
            warn!("CBUILD_CONFIG not set, no repositories are configured");
            SystemConfig::default()
        }
    };
    let config = Arc::new(config);
    info!(repos = config.repos.len(), base_url = %config.base_url, "Config loaded");

    let (lock_store, executions): (Arc<dyn LockStore>, Arc<dyn ExecutionStore>) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) => {
                info!("Connecting to database...");
                let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS);
                let pool = create_pool(&database_url, max_connections).await?;
                run_migrations(&pool).await?;
                info!("Database connected");
                (
                    Arc::new(PgLockStore::new(pool.clone())),
                    Arc::new(PgExecutionStore::new(pool)),
                )
            }
            Err(_) => {
                warn!("DATABASE_URL not set, executions are kept in memory only");
                (
                    Arc::new(MemoryLockStore::new()),
                    Arc::new(MemoryExecutionStore::new()),
                )
            }
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let issuer = std::env::var("GITHUB_APP_TOKEN").ok().map(|app_token| {
        Arc::new(InstallationTokenIssuer::new(
            config.github_api_url.clone(),
            app_token,
        )) as Arc<dyn TokenIssuer>
    });
    let fallback = std::env::var("GITHUB_TOKEN").ok();
    if issuer.is_none() && fallback.is_none() {
        warn!("Neither GITHUB_APP_TOKEN nor GITHUB_TOKEN is set, API calls are unauthenticated");
    }
    let tokens = Arc::new(TokenCache::new(issuer, fallback, clock.clone()));
    tokens.clone().spawn_pruner(TOKEN_PRUNE_INTERVAL);

    let github = Arc::new(GitHubClient::new(
        config.github_api_url.clone(),
        tokens.clone(),
    ));
    let driver = DockerJobDriver::new(config.staging_dir.clone())?;
    let stager = LocalSourceStager::new(
        config.github_api_url.clone(),
        config.staging_dir.clone(),
        tokens.clone(),
    );

    let state = AppState::new(
        config.clone(),
        Services {
            lock_store,
            executions,
            driver: Arc::new(driver),
            stager: Arc::new(stager),
            reporter: github.clone(),
            manifests: github,
            tokens,
            clock,
        },
    );

    let resumed = state.runner.resume_all().await?;
    if resumed > 0 {
        info!(resumed, "Resumed unfinished executions");
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = std::env::var("CBUILD_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()
        .context("invalid CBUILD_LISTEN address")?;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
