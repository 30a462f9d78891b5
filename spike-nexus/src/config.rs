//! Configuration types and CLI/environment parsing for the Nexus service.
//!
//! Every option can be set via environment variables or command line
//! arguments using `clap`. The environment names match the deployment
//! manifests (`TLS_PORT`, `BACKEND_STORE`, `KEK_*`, ...).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use spike_types::KeeperId;

/// Which backing store Nexus persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendStore {
    /// SQLite database file under `DATA_DIR`.
    Sqlite,
    /// Volatile in-memory store, for tests and ephemeral deployments.
    Memory,
    /// Alias of [`BackendStore::Sqlite`] kept for older manifests.
    Lite,
}

impl BackendStore {
    /// Returns `true` iff this backend persists to SQLite.
    pub fn is_sqlite(&self) -> bool {
        matches!(self, BackendStore::Sqlite | BackendStore::Lite)
    }
}

/// Parses the `KEEPER_PEERS` JSON map (`{"a": "https://...", ...}`).
pub fn parse_peer_map(value: &str) -> Result<BTreeMap<KeeperId, String>, String> {
    serde_json::from_str::<BTreeMap<String, String>>(value)
        .map(|map| map.into_iter().map(|(k, v)| (KeeperId::new(k), v)).collect())
        .map_err(|err| format!("invalid peer map: {err}"))
}

/// The configuration for the Nexus service.
#[derive(Parser, Debug)]
pub struct NexusConfig {
    /// The address the mTLS listener binds to.
    #[clap(long, env = "TLS_PORT", default_value = ":8443")]
    pub tls_port: String,

    /// The SPIFFE trust root of the deployment.
    #[clap(long, env = "TRUST_ROOT", default_value = "spike.ist")]
    pub trust_root: String,

    /// The SPIFFE trust root Nexus itself lives in (may differ when federated).
    #[clap(long, env = "TRUST_ROOT_NEXUS", default_value = "spike.ist")]
    pub trust_root_nexus: String,

    /// The Keeper peer map (JSON id→url) used for RMK recovery.
    #[clap(long, env = "KEEPER_PEERS", value_parser = parse_peer_map)]
    pub keeper_peers: BTreeMap<KeeperId, String>,

    /// Which backing store to use.
    #[clap(long, env = "BACKEND_STORE", default_value = "sqlite")]
    pub backend_store: BackendStore,

    /// Directory holding the database and other runtime state.
    #[clap(long, env = "DATA_DIR", default_value = ".data")]
    pub data_dir: PathBuf,

    /// Database file name inside `DATA_DIR`.
    #[clap(long, env = "DATABASE_FILE", default_value = "spike.db")]
    pub database_file: String,

    /// SQLite journal mode.
    #[clap(long, env = "JOURNAL_MODE", default_value = "WAL")]
    pub journal_mode: String,

    /// SQLite busy timeout in milliseconds.
    #[clap(long, env = "BUSY_TIMEOUT_MS", default_value = "5000")]
    pub busy_timeout_ms: u32,

    /// Maximum open connections to the database.
    ///
    /// The SQLite backend keeps a single serialized connection; this option
    /// is accepted for manifest compatibility.
    #[clap(long, env = "MAX_OPEN_CONNS", default_value = "10")]
    pub max_open_conns: u32,

    /// Maximum idle connections to the database. See `MAX_OPEN_CONNS`.
    #[clap(long, env = "MAX_IDLE_CONNS", default_value = "5")]
    pub max_idle_conns: u32,

    /// Maximum lifetime of a database connection. See `MAX_OPEN_CONNS`.
    #[clap(long, env = "CONN_MAX_LIFETIME", default_value = "1h", value_parser = humantime::parse_duration)]
    pub conn_max_lifetime: Duration,

    /// Whether time/usage based KEK rotation is applied automatically.
    #[clap(long, env = "KEK_ROTATION_ENABLED", default_value = "false")]
    pub kek_rotation_enabled: bool,

    /// Age in days after which the active KEK should rotate.
    #[clap(long, env = "KEK_ROTATION_DAYS", default_value = "90")]
    pub kek_rotation_days: i64,

    /// Number of DEK wraps after which the active KEK should rotate.
    #[clap(long, env = "KEK_MAX_WRAPS", default_value = "20000000")]
    pub kek_max_wraps: i64,

    /// Days a rotated-out KEK stays in grace before it may retire.
    #[clap(long, env = "KEK_GRACE_DAYS", default_value = "180")]
    pub kek_grace_days: i64,

    /// Whether reads schedule background rewraps of outdated DEKs.
    #[clap(long, env = "KEK_LAZY_REWRAP_ENABLED", default_value = "true")]
    pub kek_lazy_rewrap_enabled: bool,

    /// Rate limit of background rewraps, in rewraps per second.
    #[clap(long, env = "KEK_MAX_REWRAP_QPS", default_value = "100")]
    pub kek_max_rewrap_qps: u32,

    /// Shamir threshold T; recovery needs T+1 shards.
    #[clap(long, env = "NEXUS_SHAMIR_THRESHOLD", default_value = "1")]
    pub shamir_threshold: usize,

    /// Total number of Shamir shares N.
    #[clap(long, env = "NEXUS_SHAMIR_SHARES", default_value = "3")]
    pub shamir_shares: usize,

    /// Cadence of the background sweeper.
    #[clap(long, env = "NEXUS_SWEEP_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    /// Default number of versions retained per secret path.
    #[clap(long, env = "NEXUS_SECRET_MAX_VERSIONS", default_value = "10")]
    pub secret_max_versions: u32,

    /// Max time to wait for background tasks when shutting down.
    #[clap(long, env = "NEXUS_MAX_WAIT_SHUTDOWN", default_value = "10s", value_parser = humantime::parse_duration)]
    pub max_wait_time_shutdown: Duration,
}

impl NexusConfig {
    /// The bind address derived from `TLS_PORT` (`":8443"` binds all interfaces).
    pub fn bind_addr(&self) -> String {
        if self.tls_port.starts_with(':') {
            format!("0.0.0.0{}", self.tls_port)
        } else {
            self.tls_port.clone()
        }
    }

    /// The full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_map_parses_sorted() {
        let peers = parse_peer_map(r#"{"b":"https://b:8443","a":"https://a:8443"}"#)
            .expect("valid json map");
        let ids: Vec<_> = peers.keys().map(|k| k.as_str().to_owned()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn peer_map_rejects_garbage() {
        assert!(parse_peer_map("not json").is_err());
    }

    #[test]
    fn bind_addr_expands_bare_port() {
        let config = NexusConfig::parse_from([
            "spike-nexus",
            "--keeper-peers",
            r#"{"a":"https://a:8443"}"#,
        ]);
        assert_eq!(config.bind_addr(), "0.0.0.0:8443");
    }
}
