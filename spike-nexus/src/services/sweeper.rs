//! The rate-limited background sweeper.
//!
//! One task owns both rewrap sources: the hourly full sweep over secrets
//! still wrapped by grace-period KEKs, and the lazy queue fed by reads.
//! Every rewrap waits for a token from an interval of `1/MaxRewrapQPS`;
//! the task yields to cancellation at each token boundary and at each
//! per-secret step. Per-row failures are logged and never abort a sweep.
//!
//! After each full sweep the retirement pass runs, so KEKs only retire
//! once the sweeper had a chance to move secrets off them.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::{METRICS_ID_NEXUS_REWRAP_ERRORS, METRICS_ID_NEXUS_SWEEP_CYCLES};
use crate::services::engine::{RewrapRequest, SecretEngine};
use crate::services::store::SecretStoreService;

/// The arguments to start the sweeper.
pub struct SweeperTaskArgs {
    /// The engine performing the rewraps.
    pub engine: SecretEngine,
    /// The store used to enumerate secrets referencing a KEK.
    pub store: SecretStoreService,
    /// Cadence of the full sweep.
    pub sweep_interval: Duration,
    /// The lazy-rewrap queue fed by reads.
    pub rewrap_rx: mpsc::UnboundedReceiver<RewrapRequest>,
    /// Cooperative shutdown.
    pub cancellation_token: CancellationToken,
}

/// Background task performing lazy and sweep rewraps plus KEK retirement.
pub async fn sweeper_task(args: SweeperTaskArgs) -> eyre::Result<()> {
    // shutdown service if the sweeper dies and drops this guard
    let _drop_guard = args.cancellation_token.clone().drop_guard();

    tracing::info!("sweeper started");
    let result = run(args).await;
    match result.as_ref() {
        Ok(_) => tracing::info!("stopped sweeper without error"),
        Err(err) => tracing::warn!("sweeper encountered an error: {err:?}"),
    };
    result
}

async fn run(args: SweeperTaskArgs) -> eyre::Result<()> {
    let SweeperTaskArgs {
        engine,
        store,
        sweep_interval,
        mut rewrap_rx,
        cancellation_token,
    } = args;

    let qps = engine.kek_manager().policy().max_rewrap_qps.max(1);
    let mut tokens = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(qps)));
    tokens.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                full_sweep(&engine, &store, &mut tokens, &cancellation_token).await;
            }
            Some(request) = rewrap_rx.recv() => {
                if !wait_token(&mut tokens, &cancellation_token).await {
                    break;
                }
                rewrap_one(&engine, &request.path, request.version).await;
            }
            _ = cancellation_token.cancelled() => {
                break;
            }
        }
    }
    Ok(())
}

/// Waits for the next rate-limit token; returns `false` on cancellation.
async fn wait_token(tokens: &mut Interval, cancellation_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokens.tick() => true,
        _ = cancellation_token.cancelled() => false,
    }
}

async fn rewrap_one(engine: &SecretEngine, path: &str, version: u32) {
    match engine.rewrap_version(path, version).await {
        Ok(true) => tracing::debug!("rewrapped {path}@{version}"),
        Ok(false) => tracing::debug!("nothing to rewrap at {path}@{version}"),
        Err(err) => {
            ::metrics::counter!(METRICS_ID_NEXUS_REWRAP_ERRORS).increment(1);
            tracing::warn!("could not rewrap {path}@{version}: {err}");
        }
    }
}

async fn full_sweep(
    engine: &SecretEngine,
    store: &SecretStoreService,
    tokens: &mut Interval,
    cancellation_token: &CancellationToken,
) {
    let kek_manager = engine.kek_manager();
    if kek_manager.policy().rotation_enabled && kek_manager.should_rotate().await {
        match kek_manager.rotate_kek().await {
            Ok((previous, current)) => {
                tracing::info!("policy rotation: {previous} -> {current}")
            }
            Err(err) => tracing::warn!("policy rotation failed: {err}"),
        }
    }

    for kek_id in kek_manager.grace_keks().await {
        let refs = match store.list_refs_by_kek(&kek_id).await {
            Ok(refs) => refs,
            Err(err) => {
                tracing::warn!("cannot list secrets wrapped by {kek_id}: {err}");
                continue;
            }
        };
        if refs.is_empty() {
            continue;
        }
        tracing::info!("sweeping {} secrets off grace KEK {kek_id}", refs.len());
        for (path, version) in refs {
            if !wait_token(tokens, cancellation_token).await {
                return;
            }
            rewrap_one(engine, &path, version).await;
        }
    }

    if let Err(err) = kek_manager.retirement_sweep().await {
        tracing::warn!("retirement sweep failed: {err}");
    }
    ::metrics::counter!(METRICS_ID_NEXUS_SWEEP_CYCLES).increment(1);
}
