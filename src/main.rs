use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, StorageBackend, StorageConfig, TollgateConfig};
use tollgate::http::{service_router, HttpServer};
use tollgate::ratelimit::{
    CleanupJob, ConfigRegistry, InMemoryLimiterStore, LimiterStore, RateLimitEvaluator,
    SqliteLimiterStore,
};

/// Rate limiting and abuse prevention service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(ConfigRegistry::from_rules(&config.policies)?);
    let store = open_store(&config.storage).await?;
    let evaluator = Arc::new(RateLimitEvaluator::new(
        Arc::clone(&registry),
        Arc::clone(&store),
    ));
    info!("Rate limit evaluator initialized");

    let cleanup = CleanupJob::new(
        store,
        registry,
        Duration::from_secs(config.cleanup.interval_secs),
    );
    let router = service_router(evaluator, cleanup.clone(), config.guards.clone());

    let shutdown = CancellationToken::new();
    let cleanup = cleanup.spawn(shutdown.clone());

    let server = HttpServer::new(config.server.http_addr, router);

    // Run the server with graceful shutdown on Ctrl+C
    let server_shutdown = shutdown.clone();
    server
        .serve_with_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    cleanup.await?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn open_store(storage: &StorageConfig) -> anyhow::Result<Arc<dyn LimiterStore>> {
    let store: Arc<dyn LimiterStore> = match storage.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteLimiterStore::connect(&storage.database_url, storage.max_connections).await?,
        ),
        StorageBackend::Memory => {
            info!("Using in-memory limiter store; state is lost on restart");
            Arc::new(InMemoryLimiterStore::new())
        }
    };
    Ok(store)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
