// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;
use cotype::auth::JwtVerifier;
use cotype::config::Config;
use cotype::logging;
use cotype::registry::Registry;
use cotype::server::{self, AppState};
use cotype::store::{DocumentStore, FileStore, MemoryStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "COTYPE_LISTEN", default_value = "127.0.0.1:4250")]
    listen: SocketAddr,
    /// Directory for persisted documents. Without one, documents live in
    /// memory only and disappear on restart.
    #[arg(long, env = "COTYPE_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Shared secret for verifying connection tokens (HS256).
    #[arg(long, env = "COTYPE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::initialize().context("Failed to initialize logging")?;

    let store: Arc<dyn DocumentStore> = match &cli.data_dir {
        Some(directory) => Arc::new(
            FileStore::new(directory.clone())
                .await
                .context("Failed to open the data directory")?,
        ),
        None => {
            warn!("No data directory configured; documents only live in memory");
            Arc::new(MemoryStore::default())
        }
    };

    let config = Arc::new(Config::default());
    let registry = Registry::new(store, Arc::clone(&config));
    let verifier = Arc::new(JwtVerifier::new(&cli.jwt_secret));
    let state = AppState::new(registry, verifier, config);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Listening on {}", cli.listen);

    server::run(state, listener, wait_for_shutdown()).await
}

async fn wait_for_shutdown() {
    let mut signal_terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Should have been able to create terminate signal stream");
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Got SIGINT (Ctrl+C), shutting down");
        }
        _ = signal_terminate.recv() => {
            debug!("Got SIGTERM, shutting down");
        }
    }
}
