//! WebSocket room relay: rooms, file announcements and signal forwarding.

pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod sweep;

pub use handlers::RelayState;
pub use protocol::{ClientMessage, ServerMessage, SharedFile};
pub use registry::{RoomRegistry, RoomSummary};

use crate::common::Config;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running relay
pub struct RelayHandle {
    pub local_addr: SocketAddr,
    pub registry: RoomRegistry,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl RelayHandle {
    /// `ws://` url of the relay socket
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, let open sockets drain, wait for the server task
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.context("relay task panicked")?
    }

    /// Wait until the server exits on its own or via the shutdown token
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("relay task panicked")?
    }
}

/// Bind and start serving in the background. Port 0 picks a free port.
pub async fn spawn(config: Config) -> Result<RelayHandle> {
    let listener = TcpListener::bind(config.relay.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.relay.bind_addr()))?;
    let local_addr = listener.local_addr()?;

    let registry = RoomRegistry::new();
    let shutdown = CancellationToken::new();

    let sweeper = sweep::spawn_sweeper(
        registry.clone(),
        config.relay.sweep_interval(),
        config.relay.max_room_age(),
        shutdown.child_token(),
    );

    let state = RelayState::new(registry.clone(), config);
    let app = routes::create_relay_router(&state);

    info!(addr = %local_addr, "relay listening");

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("relay server error");

        sweeper.abort();
        info!("relay stopped");
        served
    });

    Ok(RelayHandle {
        local_addr,
        registry,
        shutdown,
        task,
    })
}

/// Serve until ctrl-c
pub async fn start_relay_server(config: Config) -> Result<()> {
    let handle = spawn(config).await?;
    let token = handle.shutdown_token();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });

    handle.wait().await
}
