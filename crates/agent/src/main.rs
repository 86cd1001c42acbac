//! drift-agent - per-container image version drift exporter
//!
//! Watches a container fleet (Kubernetes or the local Docker engine),
//! queries each image's registry for available tags, and exposes how far
//! behind each running image is as Prometheus gauges.

use std::sync::Arc;

use agent_lib::source::{DockerSource, KubernetesConfig, KubernetesSource};
use agent_lib::{
    ContainerSource, DriftCollector, Evaluator, Keychain, MetricsCache, RegistryClient,
    SourceKind,
};
use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::AgentConfig::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(fmt::layer().json())
        .init();

    info!("starting drift-agent");

    let source_kind: SourceKind = config.source.parse()?;
    let source: Arc<dyn ContainerSource> = match source_kind {
        SourceKind::Kubernetes => Arc::new(
            KubernetesSource::connect(KubernetesConfig {
                in_cluster: config.in_cluster,
                resync_interval: config.resync_interval(),
                check_interval: config.check_interval(),
            })
            .await?,
        ),
        SourceKind::Docker => Arc::new(DockerSource::connect()?),
    };
    info!(source = %source_kind, "container source ready");

    let base_keychain = match config.credentials_path() {
        Some(path) => match Keychain::from_file(&path) {
            Ok(keychain) => {
                info!(path = %path.display(), entries = keychain.len(), "loaded registry credentials");
                keychain
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "no registry auth provided, continuing without registry auth");
                Keychain::default()
            }
        },
        None => Keychain::default(),
    };

    let tag_lister = Arc::new(RegistryClient::new(base_keychain)?);

    let cache = MetricsCache::new();
    let registry = Registry::new();
    registry.register(Box::new(DriftCollector::new(cache.clone())))?;

    let evaluator = Evaluator::new(tag_lister, source, cache);

    let (shutdown_tx, _) = broadcast::channel(1);

    let evaluation = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = evaluator.run(shutdown).await {
                error!(error = %err, "evaluation pipeline failed");
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = Arc::new(api::AppState::new(registry));
    let server = tokio::spawn(api::serve(listener, state, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    server.await??;
    evaluation.await?;

    info!("drift-agent stopped");
    Ok(())
}
