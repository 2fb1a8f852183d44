//! reefd server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use reef_core::AppConfig;
use reef_metadata::SqliteStore;
use reef_repo::RepoManager;
use reef_server::{AppState, create_router};
use reef_storage::FilesystemBackend;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// reef - a content-addressed file-sync server
#[derive(Parser, Debug)]
#[command(name = "reefd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "REEF_CONFIG", default_value = "config/reefd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("reefd v{}", env!("CARGO_PKG_VERSION"));

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("REEF_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let metadata = Arc::new(
        SqliteStore::new(&config.db_path)
            .await
            .context("failed to open metadata database")?,
    );
    let objects = Arc::new(
        FilesystemBackend::new(config.data_dir.join("storage"))
            .await
            .context("failed to initialize object storage")?,
    );
    let mgr = Arc::new(RepoManager::new(metadata, objects));

    let oracle = Arc::new(reef_server::oracle::HttpRpcOracle::new(&config.rpc_url));

    let bind = config.bind.clone();
    let state = AppState::new(config, mgr, oracle);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, router).await.context("server error")?;

    Ok(())
}
