//! Metrics definitions for the Keeper service.
//!
//! This module defines all metrics keys used by the service and
//! provides a helper [`describe_metrics`] to set metadata for
//! each metric using the `metrics` crate.

/// Metrics key for the number of contributions currently held.
pub const METRICS_ID_KEEPER_CONTRIBUTIONS: &str = "spike.keeper.contributions";
/// Metrics key for broadcast deliveries that had to be retried.
pub const METRICS_ID_KEEPER_BROADCAST_RETRIES: &str = "spike.keeper.broadcast.retries";
/// Metrics key signalling whether the Keeper reached `READY`.
pub const METRICS_ID_KEEPER_READY: &str = "spike.keeper.ready";
/// Metrics key for served shard requests.
pub const METRICS_ID_KEEPER_SHARD_SERVED: &str = "spike.keeper.shard.served";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_KEEPER_CONTRIBUTIONS,
        metrics::Unit::Count,
        "Number of contributions currently held"
    );

    metrics::describe_counter!(
        METRICS_ID_KEEPER_BROADCAST_RETRIES,
        metrics::Unit::Count,
        "Number of contribution deliveries that had to be retried"
    );

    metrics::describe_gauge!(
        METRICS_ID_KEEPER_READY,
        metrics::Unit::Count,
        "1 once the keeper persisted its shard"
    );

    metrics::describe_counter!(
        METRICS_ID_KEEPER_SHARD_SERVED,
        metrics::Unit::Count,
        "Number of shard requests served to the recovery peer"
    );
}
