//! Binary entrypoint for the bundle server.
use anyhow::Context;
use bundle_server::{AppState, build_router, db, logging};
use bundle_server::auth::TokenAuth;
use bundle_server::config::ServerConfig;
use bundle_server::repo::{MemoryReleaseRepository, PgReleaseRepository, ReleaseRepository};
use bundle_server::services::diff::{DiffGenerator, DiffWorkerPool};
use bundle_server::storage::StorageManager;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bundle-server", version, about = "Bundle release, promotion and update-check server")]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(long, env = "BUNDLE_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config.log_level, config.log_format)?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => migrate(&config).await,
        Command::Serve => serve(config).await,
    }
}

async fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    let url = config.database_url.as_deref().context("DATABASE_URL is required for migrate")?;
    let pool = db::connect(url, config.db_max_connections).await?;
    db::migrate(&pool).await?;
    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let repo: Arc<dyn ReleaseRepository> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_db(url, config.db_max_connections).await.context("database must be available")?;
            Arc::new(PgReleaseRepository::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory repository, state is lost on exit");
            Arc::new(MemoryReleaseRepository::new())
        }
    };
    let storage = StorageManager::from_config(&config.storage).await?;
    let auth = TokenAuth::from_entries(&config.api_tokens)?;
    if !auth.enabled() { warn!("no BUNDLE_API_TOKENS configured; publisher API is unauthenticated"); }
    let generator = DiffGenerator::new(repo.clone(), storage.clone(), config.temp_dir.clone(), config.diff.window);
    let pool = DiffWorkerPool::start(generator, config.diff.workers, config.diff.queue_capacity);
    let addr = config.listen_addr();
    let max_body = config.max_bundle_bytes;
    let state = AppState::new(repo, storage, pool.scheduler(), auth, config);
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_body));
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
    info!(%addr, "bundle-server listening");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { warn!(error=%e, "ctrl_c handler failed"); }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("draining diff queue");
    pool.shutdown().await;
    Ok(())
}
