//! Polls the contribution count and finalizes this Keeper's shard.
//!
//! Every 2 seconds the collector compares the number of received
//! contributions with the peer count N. At exactly N it folds the RMK,
//! derives the indexed share and transitions the Keeper to `READY`; more
//! than N contributions can only mean a misconfigured peer map and is
//! unrecoverable.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::keeper_state::{KeeperState, KeeperStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The arguments to start the collector.
pub struct CollectorTaskArgs {
    /// The shared Keeper state.
    pub state: KeeperState,
    /// Cooperative shutdown.
    pub cancellation_token: CancellationToken,
}

/// Background task waiting for all contributions and deriving the shard.
pub async fn collector_task(args: CollectorTaskArgs) -> eyre::Result<()> {
    let CollectorTaskArgs {
        state,
        cancellation_token,
    } = args;

    let expected = state.peers().len();
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = cancellation_token.cancelled() => {
                tracing::info!("collector cancelled");
                return Ok(());
            }
        }
        if state.status() == KeeperStatus::Ready {
            return Ok(());
        }
        let count = state.contribution_count();
        tracing::debug!("collected {count}/{expected} contributions");
        if count == expected {
            if let Err(err) = state.finalize() {
                state.fail();
                eyre::bail!("could not finalize the shard: {err}");
            }
            return Ok(());
        }
        if count > expected {
            state.fail();
            eyre::bail!("received {count} contributions but only {expected} peers exist");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spike_types::KeeperId;
    use spike_types::crypto::Contribution;

    fn peers() -> std::collections::BTreeMap<KeeperId, String> {
        [
            (KeeperId::new("a"), String::new()),
            (KeeperId::new("b"), String::new()),
            (KeeperId::new("c"), String::new()),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn collector_finalizes_once_all_contributions_arrived() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = KeeperState::init(KeeperId::new("a"), peers(), 1, &dir.path().to_path_buf())
            .expect("init");
        let token = CancellationToken::new();
        let handle = tokio::spawn(collector_task(CollectorTaskArgs {
            state: state.clone(),
            cancellation_token: token.clone(),
        }));

        state
            .receive_contribution(KeeperId::new("b"), Contribution::from_bytes([2; 32]))
            .expect("b accepted");
        state
            .receive_contribution(KeeperId::new("c"), Contribution::from_bytes([4; 32]))
            .expect("c accepted");

        handle
            .await
            .expect("task joins")
            .expect("collector succeeds");
        assert_eq!(state.status(), KeeperStatus::Ready);
        assert!(state.shard().is_some());
    }
}
