#![deny(missing_docs)]
//! This crate provides the Keeper, the shard-custody service of SPIKE.
//!
//! A Keeper holds one share of the Root Master Key produced by Shamir's
//! Secret Sharing. During bootstrap the Keepers coordinate: each one
//! contributes 32 bytes of entropy and pushes it to every peer; once a
//! Keeper received contributions from all N peers (its own included) it
//! XOR-folds them into the RMK, splits the RMK deterministically so every
//! Keeper computes the identical share tuple, keeps only the share at its
//! position in the sorted peer-id list, and erases the intermediates. The
//! trusted recovery peer (Nexus) later collects threshold + 1 shards to
//! reconstruct the RMK.
//!
//! The main entry point is [`init`]. It restores or creates the persisted
//! Keeper state, spawns the broadcaster and collector tasks when bootstrap
//! is still pending, and builds the Axum-based REST API routes.
//!
//! If internal services encounter an error, the provided
//! `CancellationToken` will be cancelled, allowing the hosting application
//! to handle the shutdown process gracefully. To ensure a graceful
//! shutdown, the hosting application should await the handles returned by
//! [`KeeperTasks::join`] after cancelling the token.

use std::sync::Arc;

use eyre::Context as _;
use spike_types::auth::PeerGate;
use tokio_util::sync::CancellationToken;

use crate::api::KeeperAppState;
use crate::config::KeeperConfig;
use crate::services::broadcaster::{BroadcasterTaskArgs, broadcaster_task};
use crate::services::collector::{CollectorTaskArgs, collector_task};
use crate::services::keeper_state::{KeeperState, KeeperStatus};

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub mod services;

/// The tasks spawned by the Keeper. Call [`KeeperTasks::join`] when
/// shutting down for a graceful exit.
pub struct KeeperTasks {
    broadcaster: Option<tokio::task::JoinHandle<eyre::Result<()>>>,
    collector: Option<tokio::task::JoinHandle<eyre::Result<()>>>,
}

impl KeeperTasks {
    /// Consumes the tasks by joining every spawned `JoinHandle`.
    pub async fn join(self) -> eyre::Result<()> {
        if let Some(broadcaster) = self.broadcaster {
            broadcaster.await??;
        }
        if let Some(collector) = self.collector {
            collector.await??;
        }
        Ok(())
    }
}

/// A running Keeper service: the router plus its background tasks.
pub struct KeeperService {
    router: axum::Router,
    tasks: KeeperTasks,
}

impl KeeperService {
    /// Splits the service into the router to serve and the task handles to
    /// join on shutdown.
    pub fn into_parts(self) -> (axum::Router, KeeperTasks) {
        (self.router, self.tasks)
    }
}

/// Initializes the Keeper service. See the crate docs for the lifecycle.
pub async fn init(
    config: KeeperConfig,
    cancellation_token: CancellationToken,
) -> eyre::Result<KeeperService> {
    if !config.keeper_peers.contains_key(&config.keeper_id) {
        eyre::bail!("keeper id {} is not in the peer map", config.keeper_id);
    }

    let state = KeeperState::init(
        config.keeper_id.clone(),
        config.keeper_peers.clone(),
        config.shamir_threshold,
        &config.data_dir,
    )
    .context("while restoring keeper state")?;

    let gate = Arc::new(PeerGate::new(
        config.trust_root.clone(),
        config.trust_root_nexus.clone(),
    ));

    let (broadcaster, collector) = match state.status() {
        KeeperStatus::Ready => {
            tracing::info!("keeper {} already READY, serving its shard", config.keeper_id);
            (None, None)
        }
        KeeperStatus::Error => {
            eyre::bail!(
                "keeper {} state file is corrupt (bootstrap crashed mid-derivation)",
                config.keeper_id
            );
        }
        KeeperStatus::NotReady | KeeperStatus::Contributing => {
            tracing::info!("keeper {} entering bootstrap", config.keeper_id);
            let broadcaster = tokio::spawn(broadcaster_task(BroadcasterTaskArgs {
                state: state.clone(),
                client: reqwest::Client::new(),
                identity: gate.keeper_spiffe_id(&config.keeper_id),
                cancellation_token: cancellation_token.clone(),
            }));
            let collector = tokio::spawn(collector_task(CollectorTaskArgs {
                state: state.clone(),
                cancellation_token,
            }));
            (Some(broadcaster), Some(collector))
        }
    };

    let router = api::routes(KeeperAppState { state, gate });
    Ok(KeeperService {
        router,
        tasks: KeeperTasks {
            broadcaster,
            collector,
        },
    })
}
