//! Metrics definitions for the Nexus service.
//!
//! This module defines all metrics keys used by the service and
//! provides a helper [`describe_metrics`] to set metadata for
//! each metric using the `metrics` crate.

/// Metrics key for counting committed secret writes.
pub const METRICS_ID_NEXUS_SECRET_WRITES: &str = "spike.nexus.secret.writes";
/// Metrics key for counting successful secret reads.
pub const METRICS_ID_NEXUS_SECRET_READS: &str = "spike.nexus.secret.reads";
/// Metrics key for counting DEK rewraps (lazy and sweeper).
pub const METRICS_ID_NEXUS_REWRAPS: &str = "spike.nexus.rewraps";
/// Metrics key for counting rewrap failures.
pub const METRICS_ID_NEXUS_REWRAP_ERRORS: &str = "spike.nexus.rewraps.errors";
/// Metrics key for completed sweeper cycles.
pub const METRICS_ID_NEXUS_SWEEP_CYCLES: &str = "spike.nexus.sweeper.cycles";
/// Metrics key for the number of KEKs in the metadata set.
pub const METRICS_ID_NEXUS_KEK_COUNT: &str = "spike.nexus.kek.count";
/// Metrics key for KEK rotations.
pub const METRICS_ID_NEXUS_KEK_ROTATIONS: &str = "spike.nexus.kek.rotations";
/// Metrics key for RMK rotations.
pub const METRICS_ID_NEXUS_RMK_ROTATIONS: &str = "spike.nexus.rmk.rotations";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_NEXUS_SECRET_WRITES,
        metrics::Unit::Count,
        "Number of committed secret writes"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_SECRET_READS,
        metrics::Unit::Count,
        "Number of successful secret reads"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_REWRAPS,
        metrics::Unit::Count,
        "Number of DEK rewraps performed"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_REWRAP_ERRORS,
        metrics::Unit::Count,
        "Number of rewraps that failed and were skipped"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_SWEEP_CYCLES,
        metrics::Unit::Count,
        "Number of completed sweeper cycles"
    );

    metrics::describe_gauge!(
        METRICS_ID_NEXUS_KEK_COUNT,
        metrics::Unit::Count,
        "Number of KEKs in the metadata set"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_KEK_ROTATIONS,
        metrics::Unit::Count,
        "Number of KEK rotations"
    );

    metrics::describe_counter!(
        METRICS_ID_NEXUS_RMK_ROTATIONS,
        metrics::Unit::Count,
        "Number of RMK rotations"
    );
}
