//! s3ep proxy - S3-compatible encrypting proxy

use clap::Parser;
use s3ep_gateway::{run_server_with_shutdown, GatewayConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "s3ep-proxy")]
#[command(about = "S3-compatible proxy that envelope-encrypts objects before storing them")]
#[command(version)]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "S3EP_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'H', long, env = "S3EP_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "S3EP_PORT")]
    port: Option<u16>,

    /// Backend S3 endpoint
    #[arg(long, env = "S3EP_BACKEND_ENDPOINT")]
    backend_endpoint: Option<String>,

    /// Use in-memory storage (for testing, data will not persist)
    #[arg(long, env = "S3EP_MEMORY_STORE")]
    memory_store: bool,

    /// Enable debug logging
    #[arg(short, long, env = "S3EP_DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "S3EP_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(debug: bool, json: bool) {
    let log_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("s3ep_gateway={0},s3ep_core={0},s3ep_backend={0},tower_http=debug", log_level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.debug, args.log_json);

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(endpoint) = args.backend_endpoint {
        config.backend.endpoint = endpoint;
    }
    if args.memory_store {
        config.use_memory_store = true;
    }

    tracing::info!("Starting s3ep proxy on {}", config.bind_addr());
    if config.use_memory_store {
        tracing::warn!("Using in-memory storage - data will NOT persist!");
    } else {
        tracing::info!("Backend: {}", config.backend.endpoint);
    }

    run_server_with_shutdown(config, shutdown_signal()).await
}
