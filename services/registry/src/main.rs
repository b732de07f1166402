//! Registry server: serves every configured repository on its own port.

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use registry::{RegistryBuilder, RegistryConfig, RegistryManager};
use tracing_subscriber::EnvFilter;
use upstream::Secret;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = match &args.config {
        Some(path) => RegistryConfig::load(path)
            .await
            .wrap_err_with(|| format!("loading {path}"))?,
        None => RegistryConfig::default(),
    };

    let sweep_interval = config.staging.sweep_interval;
    let mut builder = RegistryBuilder::new();
    match Secret::from_env(&config.auth.secret_env) {
        Ok(secret) if !secret.is_empty() => builder = builder.secret(secret),
        _ => tracing::warn!(
            var = %config.auth.secret_env,
            "token secret not set, bearer tokens will be rejected"
        ),
    }
    let registry = builder
        .config(config)
        .build()
        .wrap_err("building registry")?;

    let manager = RegistryManager::new(registry.clone());
    manager.spawn_sweeper(sweep_interval).await;

    for repo in registry.catalog().list() {
        match manager.start(&repo.id).await {
            Ok(handle) => tracing::info!(
                repo = %handle.repo_id,
                name = %repo.name,
                kind = ?repo.kind,
                addr = %handle.addr,
                "serving repository"
            ),
            Err(error) => tracing::error!(repo = %repo.id, %error, "could not serve repository"),
        }
    }

    if manager.handles().await.is_empty() {
        tracing::warn!("no repositories are being served");
    }

    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    manager.stop_all().await;
    Ok(())
}
