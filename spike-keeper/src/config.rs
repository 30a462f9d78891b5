//! Configuration types and CLI/environment parsing for a Keeper instance.
//!
//! Every option can be set via environment variables or command line
//! arguments using `clap`. The environment names match the deployment
//! manifests (`KEEPER_ID`, `KEEPER_PEERS`, `TLS_PORT`, ...).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use spike_types::KeeperId;

/// Parses the `KEEPER_PEERS` JSON map (`{"a": "https://...", ...}`).
pub fn parse_peer_map(value: &str) -> Result<BTreeMap<KeeperId, String>, String> {
    serde_json::from_str::<BTreeMap<String, String>>(value)
        .map(|map| map.into_iter().map(|(k, v)| (KeeperId::new(k), v)).collect())
        .map_err(|err| format!("invalid peer map: {err}"))
}

/// The configuration for a Keeper instance.
#[derive(Parser, Debug)]
pub struct KeeperConfig {
    /// The id of this Keeper inside the peer map.
    #[clap(long, env = "KEEPER_ID")]
    pub keeper_id: KeeperId,

    /// The Keeper peer map (JSON id→url), including this Keeper.
    #[clap(long, env = "KEEPER_PEERS", value_parser = parse_peer_map)]
    pub keeper_peers: BTreeMap<KeeperId, String>,

    /// The SPIFFE trust root of the deployment.
    #[clap(long, env = "TRUST_ROOT", default_value = "spike.ist")]
    pub trust_root: String,

    /// The SPIFFE trust root Nexus lives in (may differ when federated).
    #[clap(long, env = "TRUST_ROOT_NEXUS", default_value = "spike.ist")]
    pub trust_root_nexus: String,

    /// The address the mTLS listener binds to.
    #[clap(long, env = "TLS_PORT", default_value = ":8443")]
    pub tls_port: String,

    /// Directory holding the state and shard files.
    #[clap(long, env = "DATA_DIR", default_value = ".data")]
    pub data_dir: PathBuf,

    /// Shamir threshold T; recovery needs T+1 shards.
    #[clap(long, env = "KEEPER_SHAMIR_THRESHOLD", default_value = "1")]
    pub shamir_threshold: usize,

    /// Max time to wait for background tasks when shutting down.
    #[clap(long, env = "KEEPER_MAX_WAIT_SHUTDOWN", default_value = "10s", value_parser = humantime::parse_duration)]
    pub max_wait_time_shutdown: Duration,
}

impl KeeperConfig {
    /// The bind address derived from `TLS_PORT` (`":8443"` binds all interfaces).
    pub fn bind_addr(&self) -> String {
        if self.tls_port.starts_with(':') {
            format!("0.0.0.0{}", self.tls_port)
        } else {
            self.tls_port.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_options() {
        let config = KeeperConfig::parse_from([
            "spike-keeper",
            "--keeper-id",
            "a",
            "--keeper-peers",
            r#"{"a":"https://a:8443","b":"https://b:8443","c":"https://c:8443"}"#,
        ]);
        assert_eq!(config.keeper_id.as_str(), "a");
        assert_eq!(config.keeper_peers.len(), 3);
        assert_eq!(config.shamir_threshold, 1);
    }
}
