//! Server startup and lifecycle

use crate::{routes, AppState, GatewayConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Run the gateway server
pub async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    run_server_with_shutdown(config, std::future::pending::<()>()).await
}

/// Run server with graceful shutdown
pub async fn run_server_with_shutdown(
    config: GatewayConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(config.clone()).await?);
    let listener = TcpListener::bind(config.bind_addr()).await?;
    serve(listener, state, shutdown_signal).await
}

/// Serve on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let sweeper = spawn_expiry_sweeper(Arc::clone(&state));
    let app = routes::create_router(state);

    info!("s3ep proxy listening on http://{}", listener.local_addr()?);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await;
    sweeper.abort();
    result?;

    info!("Proxy shutdown complete");
    Ok(())
}

/// Periodically abort multipart uploads older than the configured expiry
pub fn spawn_expiry_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let max_age = Duration::from_secs(state.config.multipart_expiry_secs);
    let period = Duration::from_secs(state.config.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.engine.cleanup_expired(max_age).await;
            if removed > 0 {
                info!(removed, "Expired multipart uploads aborted");
            } else {
                debug!("No expired multipart uploads");
            }
        }
    })
}
