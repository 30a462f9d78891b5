#![deny(missing_docs)]
//! This crate provides Nexus, the storage engine of SPIKE.
//!
//! Nexus keeps an encrypted, versioned key–value store using envelope
//! encryption: each secret version is sealed with a per-version Data
//! Encryption Key, DEKs are wrapped by versioned Key Encryption Keys, and
//! KEKs are deterministically derived from the Root Master Key via HKDF.
//!
//! The main entry point is [`init`]. It performs the necessary
//! initialization of the Nexus instance:
//!
//! 1. Collects threshold + 1 shards from the configured Keepers and
//!    reconstructs the RMK (Nexus is the trusted recovery peer).
//! 2. Loads the KEK metadata set from the store and ensures an active KEK.
//! 3. Spawns the background sweeper that rewraps secrets off grace-period
//!    KEKs, drains the lazy-rewrap queue, and retires unreferenced KEKs.
//! 4. Builds the Axum-based REST API routes.
//!
//! If internal services encounter an error, the provided
//! `CancellationToken` will be cancelled, allowing the hosting application
//! to handle the shutdown process gracefully. Additionally, the token can
//! be cancelled externally to signal Nexus to stop its operations.
//!
//! To ensure a graceful shutdown, the hosting application should await the
//! `JoinHandle` returned by [`NexusService::into_parts`] after cancelling
//! the token.

use std::sync::Arc;

use eyre::Context as _;
use spike_types::RmkVersion;
use spike_types::auth::PeerGate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::NexusState;
use crate::config::NexusConfig;
use crate::services::engine::SecretEngine;
use crate::services::kek_manager::{KekManager, KekPolicy};
use crate::services::recovery::RecoveryPeers;
use crate::services::store::SecretStoreService;
use crate::services::sweeper::{SweeperTaskArgs, sweeper_task};

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub mod services;

/// A running Nexus service: the router plus its background task.
pub struct NexusService {
    router: axum::Router,
    sweeper: tokio::task::JoinHandle<eyre::Result<()>>,
}

impl NexusService {
    /// Splits the service into the router to serve and the sweeper handle
    /// to join on shutdown.
    pub fn into_parts(self) -> (axum::Router, tokio::task::JoinHandle<eyre::Result<()>>) {
        (self.router, self.sweeper)
    }
}

/// Initializes the Nexus service. See the crate docs for the startup steps.
pub async fn init(
    config: NexusConfig,
    store: SecretStoreService,
    cancellation_token: CancellationToken,
) -> eyre::Result<NexusService> {
    let gate = Arc::new(PeerGate::new(
        config.trust_root.clone(),
        config.trust_root_nexus.clone(),
    ));
    let recovery = Arc::new(RecoveryPeers {
        client: reqwest::Client::new(),
        peers: config.keeper_peers.clone(),
        threshold: config.shamir_threshold,
        identity: gate.nexus_spiffe_id(),
    });

    tracing::info!(
        "recovering the RMK from {} keepers..",
        config.keeper_peers.len()
    );
    let rmk = recovery
        .recover(&cancellation_token)
        .await
        .context("while recovering the RMK")?;

    tracing::info!("init KEK manager..");
    let policy = KekPolicy {
        rotation_enabled: config.kek_rotation_enabled,
        rotation_days: config.kek_rotation_days,
        max_wraps: config.kek_max_wraps,
        grace_days: config.kek_grace_days,
        lazy_rewrap_enabled: config.kek_lazy_rewrap_enabled,
        max_rewrap_qps: config.kek_max_rewrap_qps,
    };
    let kek_manager = KekManager::init(store.clone(), rmk, RmkVersion::INITIAL, policy)
        .await
        .context("while initializing the KEK manager")?;

    let (rewrap_tx, rewrap_rx) = mpsc::unbounded_channel();
    let engine = SecretEngine::new(
        store.clone(),
        kek_manager,
        rewrap_tx,
        config.secret_max_versions,
    );

    // surface storage damage early; unreadable rows are logged and skipped
    match engine.load_all_secrets().await {
        Ok(secrets) => tracing::info!("verified {} secrets readable", secrets.len()),
        Err(err) => tracing::warn!("could not enumerate secrets: {err}"),
    }

    tracing::info!("spawning sweeper..");
    let sweeper = tokio::spawn(sweeper_task(SweeperTaskArgs {
        engine: engine.clone(),
        store,
        sweep_interval: config.sweep_interval,
        rewrap_rx,
        cancellation_token: cancellation_token.clone(),
    }));

    tracing::info!("init nexus routes..");
    let router = api::routes(NexusState {
        engine,
        gate,
        recovery,
        cancellation_token,
    });
    Ok(NexusService { router, sweeper })
}
