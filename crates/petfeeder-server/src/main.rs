//! # petfeeder-server
//!
//! Orchestration server for a camera-equipped pet feeder.
//!
//! This binary provides:
//! - **RPC dispatch** from every connected client to the feeder, the camera
//!   and the event database, with single-user control over the schedule
//! - **Feeding recordings**: scheduled feedings are filmed, muxed to MP4 and
//!   thumbnailed in the background
//! - **Live video and stills** shared between clients from one camera
//! - **WebSocket transport** (axum) with a health check and an optional
//!   static web UI

mod camera_session;
mod config;
mod connections;
mod error;
mod feeding;
mod notify;
mod persistence;
mod rpc;
mod server;
mod state;
mod transport;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use petfeeder_device::MockDevice;
use petfeeder_media::{FfmpegConverter, ProcessCameraFactory};
use petfeeder_store::Store;

use crate::config::ServerConfig;
use crate::server::{PetfeederServer, ServerParts, ServerSettings};
use crate::transport::websocket::WebSocketTransport;
use crate::transport::Transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,petfeeder_server=debug")),
        )
        .init();

    info!("Starting petfeeder server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Build collaborators
    // -----------------------------------------------------------------------
    let store = Arc::new(
        Store::open(&config.data_dir)
            .with_context(|| format!("could not open store in {}", config.data_dir.display()))?,
    );

    // No hardware driver ships with this build; the emulated feeder stands in.
    let device = Arc::new(MockDevice::new());
    info!("Using the emulated feeder");

    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(
        config.http_addr,
        config.web_root.clone(),
    ));

    let server = Arc::new(PetfeederServer::new(
        ServerParts {
            device,
            transports: vec![transport],
            persistence: store,
            camera_factory: Arc::new(ProcessCameraFactory::new(config.camera.clone())),
            converter: Arc::new(FfmpegConverter::new(config.convert_config())),
        },
        ServerSettings::from(&config),
    ));

    // -----------------------------------------------------------------------
    // 4. Run until Ctrl+C
    // -----------------------------------------------------------------------
    if let Err(e) = server.run().await {
        error!(error = %e, "Startup failed");
        server.shutdown().await;
        return Err(e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down");

    server.shutdown().await;
    Ok(())
}
