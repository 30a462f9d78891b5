//! Nexus Binary
//!
//! This is the main entry point for the Nexus service.
//! It initializes tracing, metrics, and starts the service with
//! configuration from command-line arguments or environment variables.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser as _;
use eyre::Context as _;
use spike_nexus::config::{BackendStore, NexusConfig};
use spike_nexus::services::store::memory::MemoryStore;
use spike_nexus::services::store::sqlite::SqliteStore;
use spike_nexus::services::store::SecretStoreService;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    spike_nexus::metrics::describe_metrics();

    let config = NexusConfig::parse();
    tracing::info!("starting spike-nexus with config: {config:#?}");

    let store: SecretStoreService = match config.backend_store {
        BackendStore::Memory => Arc::new(MemoryStore::new()),
        BackendStore::Sqlite | BackendStore::Lite => Arc::new(
            SqliteStore::open(
                &config.database_path(),
                &config.journal_mode,
                config.busy_timeout_ms,
            )
            .context("while opening the sqlite store")?,
        ),
    };

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("received shutdown signal");
            cancellation_token.cancel();
        }
    });

    // Clone the values we need afterwards as well
    let bind_addr = config.bind_addr();
    let max_wait_time_shutdown = config.max_wait_time_shutdown;

    let service = spike_nexus::init(config, store.clone(), cancellation_token.clone())
        .await
        .context("while initiating nexus")?;
    let (router, sweeper) = service.into_parts();

    tracing::info!("binding to {bind_addr}");
    let tcp_listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("while binding tcp-listener")?;

    let axum_cancel_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        tracing::info!(
            "starting axum server on {}",
            tcp_listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(String::from("invalid addr"))
        );
        let axum_shutdown_signal = axum_cancel_token.clone();
        let axum_result = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move { axum_shutdown_signal.cancelled().await })
            .await;
        tracing::info!("axum server shutdown");
        if let Err(err) = axum_result {
            tracing::error!("got error from axum: {err:?}");
        }
        // we cancel the token in case axum encountered an error to shutdown the service
        axum_cancel_token.cancel();
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!("waiting for shutdown of services (max wait time {max_wait_time_shutdown:?})..");
    let mut graceful = true;
    match tokio::time::timeout(max_wait_time_shutdown, async move {
        tokio::join!(server, sweeper)
    })
    .await
    {
        Ok(_) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => {
            graceful = false;
            tracing::warn!("could not finish shutdown in time")
        }
    }

    if let Err(err) = store.close().await {
        graceful = false;
        tracing::error!("could not close the store: {err}");
    }

    tracing::info!("good night!");
    if graceful {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("can install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("can install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
