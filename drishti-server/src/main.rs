// Drishti detection service
// HTTP API plus a background queue consumer sharing one service context.

use anyhow::Context;
use clap::Parser;
use drishti_core::AppConfig;
use drishti_pipeline::{
    ConsumerSettings, ConsumerStats, InMemoryQueue, JobPipeline, JobQueue, QueueConsumer,
    ServiceContext,
};
use drishti_server::{create_router, ApiState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drishti-server", version, about = "Object detection job service")]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP port, overrides the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level or filter directive, e.g. `debug` or `drishti_pipeline=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Serve HTTP only, without the queue consumer
    #[arg(long)]
    no_consumer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("🚀 Starting Drishti {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Storage backend: {}, bucket: {}",
        config.storage.backend.as_str(),
        config.object_storage.bucket
    );

    let ctx = ServiceContext::from_config(&config).context("failed to build service context")?;

    let queue: Option<Arc<dyn JobQueue>> = if config.queue.enabled {
        Some(Arc::new(InMemoryQueue::new(
            config.queue.name.clone(),
            Duration::from_secs(config.queue.visibility_timeout_secs),
        )))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = match (&queue, args.no_consumer) {
        (Some(queue), false) => {
            let consumer = QueueConsumer::new(
                queue.clone(),
                JobPipeline::new(ctx.clone()),
                ConsumerSettings::from(&config.queue),
            );
            Some(tokio::spawn(async move { consumer.run(shutdown_rx).await }))
        }
        _ => {
            info!("Queue consumer disabled");
            None
        }
    };

    let app = create_router(ApiState::new(ctx, queue));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("✅ HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server failed")?;

    shutdown_gracefully(shutdown_tx, consumer).await;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => AppConfig::default(),
    };
    config.apply_env()?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown signal received");
}

/// Stop the consumer after its current job and report what it did
async fn shutdown_gracefully(
    shutdown_tx: watch::Sender<bool>,
    consumer: Option<tokio::task::JoinHandle<ConsumerStats>>,
) {
    info!("🔄 Stopping services...");
    let _ = shutdown_tx.send(true);

    if let Some(handle) = consumer {
        match handle.await {
            Ok(stats) => info!(
                "Consumer processed {} messages ({} completed, {} failed)",
                stats.received, stats.completed, stats.failed
            ),
            Err(e) => warn!("Consumer task ended abnormally: {}", e),
        }
    }

    info!("👋 Drishti stopped");
}
