//! HTTP daemon for the tether coordinator.
//!
//! Exposes the legacy query and the coordinate endpoints. Coordinate
//! endpoints upgrade the connection to a duplex byte stream and hand it
//! to the coordinator; authentication happens in front of this daemon.
pub mod error;

mod api;

use std::net::SocketAddr;

use anyhow::Context as _;
use axum::Router;
use tower_http::trace::TraceLayer;

use tether_coord::Coordinator;

pub const NAME: &str = "tether-httpd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
}

/// Run the daemon with a fresh coordinator until interrupted, then drain.
pub async fn run(options: Options) -> anyhow::Result<()> {
    run_with(options, Coordinator::new()).await
}

/// Run the daemon against the given coordinator.
pub async fn run_with(options: Options, coordinator: Coordinator) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(options.listen)
        .await
        .with_context(|| format!("failed to bind {}", options.listen))?;

    tracing::info!("listening on http://{}", options.listen);

    let app = router(coordinator.clone()).layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("interrupt received, shutting down..");
        })
        .await?;

    // Flush every peer before reporting a clean exit.
    coordinator.shutdown().await;

    Ok(())
}

/// The daemon's routes, for serving and for tests.
pub fn router(coordinator: Coordinator) -> Router {
    api::router(coordinator)
}

pub mod logger {
    use tracing::dispatcher::Dispatch;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber()))
    }

    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}
