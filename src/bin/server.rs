use anyhow::{Context, Result};
use collector::auth::{JwksPrincipalVerifier, PrincipalVerifier, SharedSecretVerifier};
use collector::config::{AppConfig, AuthConfig, StorageConfig};
use collector::handlers::Context as HandlerContext;
use collector::logging::{setup_logging, LoggingConfiguration};
use collector::metrics::{start_metrics_scrape_endpoint, CollectorMetrics};
use collector::reaper;
use collector::router;
use collector::session::SessionStore;
use collector::storage::{BlobStore, LocalBlobStore, S3BlobStore, StorageService};
use slog::{info, Logger};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_args(env::args_os()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error:?}");
            std::process::exit(1);
        }
    };

    let (logger, _guard) = match setup_logging(&LoggingConfiguration {
        force_json_output: config.force_json_logging,
        version_string: option_env!("BUILD_INFO").unwrap_or("(BUILD_INFO unavailable)"),
        log_level: &config.log_level,
    }) {
        Ok(pair) => pair,
        Err(error) => {
            eprintln!("failed to set up logging: {error:?}");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(config, logger.clone()).await {
        slog::error!(logger, "fatal error"; "error" => format!("{error:#}"));
        std::process::exit(2);
    }
}

async fn run(config: AppConfig, logger: Logger) -> Result<()> {
    let blob_store: Arc<dyn BlobStore> = match &config.storage {
        StorageConfig::Local { directory } => {
            info!(logger, "using filesystem storage"; "directory" => directory.display().to_string());
            Arc::new(
                LocalBlobStore::new(directory.clone())
                    .await
                    .context("failed to initialize filesystem blob store")?,
            )
        }
        StorageConfig::S3 { bucket, region } => {
            info!(logger, "using S3 storage"; "bucket" => bucket, "region" => region.name());
            Arc::new(S3BlobStore::new(bucket.clone(), region.clone()).context("failed to initialize S3 blob store")?)
        }
    };

    let chunk_directory: PathBuf = env::temp_dir().join("collector-chunks");
    let storage = StorageService::new(chunk_directory, blob_store, logger.new(slog::o!()));

    let metrics = CollectorMetrics::new().context("failed to register Prometheus collectors")?;

    let verifier: Arc<dyn PrincipalVerifier> = match &config.auth {
        AuthConfig::Jwks { url } => Arc::new(
            JwksPrincipalVerifier::new(url.clone(), Duration::from_secs(300), logger.new(slog::o!()))
                .await
                .context("failed to fetch initial JWKS")?,
        ),
        AuthConfig::SharedSecret { secret } => Arc::new(SharedSecretVerifier::new(secret.clone())),
    };

    let sessions = SessionStore::new();
    let config = Arc::new(config);

    let _reaper = reaper::spawn(storage.clone(), config.upload_expiration, metrics.clone(), logger.new(slog::o!()));

    let _metrics_runtime = if config.metrics_enabled {
        Some(start_metrics_scrape_endpoint(config.metrics_port, logger.new(slog::o!()))?)
    } else {
        None
    };

    let handler_context = HandlerContext {
        sessions,
        storage,
        config: config.clone(),
        metrics,
    };

    let routes = router::routes(handler_context, verifier, logger.clone());

    let addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port)
        .parse()
        .context("failed to parse http-host/http-port as a socket address")?;

    info!(logger, "listening"; "address" => addr.to_string());

    let shutdown_logger = logger.clone();
    let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
        wait_for_shutdown_signal().await;
        info!(shutdown_logger, "received shutdown signal, draining connections");
    });

    server.await;
    info!(logger, "shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
}
