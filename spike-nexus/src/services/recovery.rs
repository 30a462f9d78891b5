//! RMK reconstruction from Keeper shards.
//!
//! Nexus is the trusted recovery peer: it polls every Keeper's shard
//! endpoint until threshold + 1 shards are collected, reassembles the
//! shares using each Keeper's position in the sorted peer-id list as the
//! share id, and reconstructs the RMK. Shard buffers are wiped as they
//! drop out of scope.

use std::collections::BTreeMap;
use std::time::Duration;

use eyre::Context as _;
use spike_core::shamir::{self, ShamirShare};
use spike_types::KeeperId;
use spike_types::api::PEER_IDENTITY_HEADER;
use spike_types::api::v1::ShardResponse;
use spike_types::auth::PeerIdentity;
use spike_types::crypto::{RootKey, Shard};
use tokio_util::sync::CancellationToken;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Everything needed to run (or re-run) shard collection.
///
/// RMK rotation re-collects from the Keepers after the bootstrap tooling
/// re-sharded them, so the peer set stays around beyond startup.
pub struct RecoveryPeers {
    /// HTTP client for the Keeper endpoints.
    pub client: reqwest::Client,
    /// The Keeper peer map, id → base url.
    pub peers: BTreeMap<KeeperId, String>,
    /// Shamir threshold T; recovery needs T + 1 shards.
    pub threshold: usize,
    /// The identity Nexus presents to the Keepers.
    pub identity: PeerIdentity,
}

impl RecoveryPeers {
    /// Collects shards and reconstructs the RMK. See [`recover_root_key`].
    pub async fn recover(&self, cancellation_token: &CancellationToken) -> eyre::Result<RootKey> {
        recover_root_key(
            &self.client,
            &self.peers,
            self.threshold,
            &self.identity,
            cancellation_token,
        )
        .await
    }
}

/// Collects shards from the Keepers and reconstructs the RMK.
///
/// Retries every 5 seconds until threshold + 1 Keepers answered or the
/// token is cancelled. Keepers that are not `READY` yet answer 404 and are
/// retried on the next round.
pub async fn recover_root_key(
    client: &reqwest::Client,
    peers: &BTreeMap<KeeperId, String>,
    threshold: usize,
    identity: &PeerIdentity,
    cancellation_token: &CancellationToken,
) -> eyre::Result<RootKey> {
    let needed = threshold + 1;
    if peers.len() < needed {
        eyre::bail!(
            "peer map holds {} keepers but recovery needs {needed} shards",
            peers.len()
        );
    }

    let mut shards: BTreeMap<usize, Shard> = BTreeMap::new();
    loop {
        // the BTreeMap iterates in sorted peer-id order, so enumerate()
        // yields each Keeper's share index
        for (index, (keeper_id, base_url)) in peers.iter().enumerate() {
            if shards.contains_key(&index) {
                continue;
            }
            match fetch_shard(client, base_url, identity).await {
                Ok(shard) if shard.is_all_zero() => {
                    tracing::warn!("keeper {keeper_id} served an all-zero shard, ignoring");
                }
                Ok(shard) => {
                    tracing::info!("collected shard from keeper {keeper_id}");
                    shards.insert(index, shard);
                }
                Err(err) => {
                    tracing::debug!("keeper {keeper_id} has no shard yet: {err}");
                }
            }
            if shards.len() >= needed {
                break;
            }
        }
        if shards.len() >= needed {
            break;
        }
        tracing::info!(
            "collected {}/{needed} shards, retrying in {RETRY_INTERVAL:?}",
            shards.len()
        );
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            _ = cancellation_token.cancelled() => {
                eyre::bail!("recovery cancelled before collecting {needed} shards");
            }
        }
    }

    let shares = shards
        .iter()
        .map(|(index, shard)| ShamirShare::from_indexed_shard(*index, shard))
        .collect::<Result<Vec<_>, _>>()
        .context("while reassembling shares")?;
    let rmk = shamir::recover(&shares, threshold).context("while reconstructing the RMK")?;
    tracing::info!("reconstructed the RMK from {} shards", shares.len());
    Ok(rmk)
}

async fn fetch_shard(
    client: &reqwest::Client,
    base_url: &str,
    identity: &PeerIdentity,
) -> eyre::Result<Shard> {
    let response = client
        .post(format!("{}/v1/store/shard", base_url.trim_end_matches('/')))
        .header(&PEER_IDENTITY_HEADER, identity.as_str())
        .send()
        .await
        .context("while requesting shard")?;
    if !response.status().is_success() {
        eyre::bail!("shard request answered {}", response.status());
    }
    let body: ShardResponse = response.json().await.context("while decoding shard")?;
    Ok(body.shard)
}
