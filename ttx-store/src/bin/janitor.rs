//! Token lock janitor
//!
//! Opens the configured store and evicts stale token locks on a fixed period
//! until interrupted. Configuration comes from `TTX_CONFIG` (a TOML file) or
//! from `TTX_*` environment variables.

use ttx_store::{Config, Persistence};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("TTX_LOG_JSON").is_ok() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match std::env::var("TTX_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::from_env()?,
    };
    tracing::info!(
        driver = ?config.driver,
        lease_secs = config.locks.lease_expiry_secs,
        every_secs = config.locks.cleanup_interval_secs,
        "starting token lock janitor"
    );

    let persistence = Persistence::open(&config).await?;
    let janitor = persistence.spawn_lock_janitor();

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down token lock janitor");
    janitor.shutdown().await;
    persistence.close().await?;
    Ok(())
}
