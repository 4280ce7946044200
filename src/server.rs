// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP surface: the single `/ws` route, the shared application state, and
//! the serve loop with graceful shutdown.

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::connection;
use crate::registry::Registry;
use crate::types::ClientId;
use anyhow::Result;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<Config>,
    /// Incremented to obtain process-wide unique client ids.
    next_client_id: AtomicU64,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        verifier: Arc<dyn TokenVerifier>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            verifier,
            config,
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn next_client_id(&self) -> ClientId {
        ClientId::from(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(connection::ws_handler))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then stops accepting connections and
/// waits for every session to persist and wind down.
pub async fn run(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let registry = Arc::clone(&state.registry);
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    info!("Shutting down, persisting all open documents");
    registry.shutdown().await;
    Ok(())
}
