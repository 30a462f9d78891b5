//! Delivers this Keeper's contribution to every peer.
//!
//! Peers that are still starting answer with transport errors; the
//! broadcaster retries them on a fixed 5-second cadence until every peer
//! accepted the contribution. Availability wins over freshness here: the
//! retry loop is unbounded and ends only on success or cancellation.

use std::collections::BTreeSet;
use std::time::Duration;

use spike_types::KeeperId;
use spike_types::api::PEER_IDENTITY_HEADER;
use spike_types::api::v1::ContributeShardRequest;
use spike_types::auth::PeerIdentity;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_KEEPER_BROADCAST_RETRIES;
use crate::services::keeper_state::KeeperState;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// The arguments to start the broadcaster.
pub struct BroadcasterTaskArgs {
    /// The shared Keeper state.
    pub state: KeeperState,
    /// HTTP client for the peer endpoints.
    pub client: reqwest::Client,
    /// The identity this Keeper presents to its peers.
    pub identity: PeerIdentity,
    /// Cooperative shutdown.
    pub cancellation_token: CancellationToken,
}

/// Background task pushing the cached contribution to every peer ≠ self.
pub async fn broadcaster_task(args: BroadcasterTaskArgs) -> eyre::Result<()> {
    let BroadcasterTaskArgs {
        state,
        client,
        identity,
        cancellation_token,
    } = args;

    let mut pending: BTreeSet<KeeperId> = state
        .peers()
        .keys()
        .filter(|id| *id != state.keeper_id())
        .cloned()
        .collect();
    let request = ContributeShardRequest {
        keeper_id: state.keeper_id().clone(),
        shard: state.contribution(),
    };

    tracing::info!("broadcasting contribution to {} peers", pending.len());
    loop {
        for keeper_id in pending.clone() {
            let url = state
                .peers()
                .get(&keeper_id)
                .expect("pending ids come from the peer map");
            match deliver(&client, url, &identity, &request).await {
                Ok(()) => {
                    tracing::info!("peer {keeper_id} accepted our contribution");
                    pending.remove(&keeper_id);
                }
                Err(err) => {
                    tracing::debug!("peer {keeper_id} not reachable yet: {err}");
                    ::metrics::counter!(METRICS_ID_KEEPER_BROADCAST_RETRIES).increment(1);
                }
            }
        }
        if pending.is_empty() {
            tracing::info!("all peers accepted our contribution");
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            _ = cancellation_token.cancelled() => {
                tracing::info!("broadcaster cancelled with {} peers pending", pending.len());
                return Ok(());
            }
        }
    }
}

async fn deliver(
    client: &reqwest::Client,
    base_url: &str,
    identity: &PeerIdentity,
    request: &ContributeShardRequest,
) -> eyre::Result<()> {
    let response = client
        .post(format!(
            "{}/v1/store/contribute",
            base_url.trim_end_matches('/')
        ))
        .header(&PEER_IDENTITY_HEADER, identity.as_str())
        .json(request)
        .send()
        .await?;
    if !response.status().is_success() {
        eyre::bail!("contribute answered {}", response.status());
    }
    Ok(())
}
