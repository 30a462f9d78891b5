//! Endpoint tests of the Keeper shard API.
//!
//! These drive the full service (state machine, collector, routes) through
//! the HTTP surface the peers and the recovery peer actually use.

use axum_test::TestServer;
use spike_keeper::config::KeeperConfig;
use spike_types::KeeperId;
use spike_types::api::PEER_IDENTITY_HEADER;
use spike_types::api::v1::{ContributeShardRequest, ShardResponse};
use spike_types::auth::PeerGate;
use spike_types::crypto::Contribution;
use tokio_util::sync::CancellationToken;

// unreachable peer URLs keep the broadcaster retrying harmlessly in tests
const PEERS_JSON: &str = r#"{"a":"http://127.0.0.1:1","b":"http://127.0.0.1:1","c":"http://127.0.0.1:1"}"#;

fn config_for(id: &str, data_dir: &std::path::Path) -> KeeperConfig {
    use clap::Parser as _;
    KeeperConfig::parse_from([
        "spike-keeper",
        "--keeper-id",
        id,
        "--keeper-peers",
        PEERS_JSON,
        "--data-dir",
        data_dir.to_str().expect("utf-8 path"),
    ])
}

async fn test_server(id: &str, data_dir: &std::path::Path) -> TestServer {
    let service = spike_keeper::init(config_for(id, data_dir), CancellationToken::new())
        .await
        .expect("keeper init");
    let (router, _tasks) = service.into_parts();
    TestServer::new(router).expect("test server")
}

fn gate() -> PeerGate {
    PeerGate::new("spike.ist", "spike.ist")
}

fn contribute_body(id: &str, byte: u8) -> ContributeShardRequest {
    ContributeShardRequest {
        keeper_id: KeeperId::new(id),
        shard: Contribution::from_bytes([byte; 32]),
    }
}

#[tokio::test]
async fn contribute_requires_a_known_caller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = test_server("a", dir.path()).await;

    // no identity at all
    let response = server
        .post("/v1/store/contribute")
        .json(&contribute_body("b", 2))
        .await;
    response.assert_status_unauthorized();

    // an identity outside the trust domain
    let response = server
        .post("/v1/store/contribute")
        .add_header(PEER_IDENTITY_HEADER.clone(), "spiffe://evil.example/spike/nexus")
        .json(&contribute_body("b", 2))
        .await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn contribute_rejects_all_zero_shards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = test_server("a", dir.path()).await;
    let identity = gate().keeper_spiffe_id(&KeeperId::new("b"));

    let response = server
        .post("/v1/store/contribute")
        .add_header(PEER_IDENTITY_HEADER.clone(), identity.as_str())
        .json(&contribute_body("b", 0))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn shard_is_nexus_only_and_404_until_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = test_server("a", dir.path()).await;
    let gate = gate();

    // a keeper may not read the shard
    let keeper_identity = gate.keeper_spiffe_id(&KeeperId::new("b"));
    let response = server
        .post("/v1/store/shard")
        .add_header(PEER_IDENTITY_HEADER.clone(), keeper_identity.as_str())
        .await;
    response.assert_status_unauthorized();

    // nexus may, but the keeper has no shard yet
    let nexus_identity = gate.nexus_spiffe_id();
    let response = server
        .post("/v1/store/shard")
        .add_header(PEER_IDENTITY_HEADER.clone(), nexus_identity.as_str())
        .await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn full_bootstrap_over_the_wire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server = test_server("a", dir.path()).await;
    let gate = gate();

    // peers b and c push their contributions; a's own is self-received
    for (id, byte) in [("b", 2u8), ("c", 4u8)] {
        let identity = gate.keeper_spiffe_id(&KeeperId::new(id));
        let response = server
            .post("/v1/store/contribute")
            .add_header(PEER_IDENTITY_HEADER.clone(), identity.as_str())
            .json(&contribute_body(id, byte))
            .await;
        response.assert_status_ok();
    }

    // the collector polls every 2 seconds; wait for READY
    let nexus_identity = gate.nexus_spiffe_id();
    let mut shard: Option<ShardResponse> = None;
    for _ in 0..20 {
        let response = server
            .post("/v1/store/shard")
            .add_header(PEER_IDENTITY_HEADER.clone(), nexus_identity.as_str())
            .await;
        if response.status_code().is_success() {
            shard = Some(response.json());
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    let shard = shard.expect("keeper reached READY");
    assert!(!shard.shard.is_all_zero());

    // once READY, further contributions are refused
    let identity = gate.keeper_spiffe_id(&KeeperId::new("b"));
    let response = server
        .post("/v1/store/contribute")
        .add_header(PEER_IDENTITY_HEADER.clone(), identity.as_str())
        .json(&contribute_body("b", 2))
        .await;
    response.assert_status_bad_request();
}
