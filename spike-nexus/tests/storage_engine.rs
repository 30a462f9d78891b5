//! Integration tests of the storage engine: envelope round-trips, KEK
//! rotation with lazy rewrap, RMK rotation with rollback, and the
//! retirement rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use spike_nexus::services::engine::{RewrapRequest, SecretEngine};
use spike_nexus::services::kek_manager::{KekManager, KekPolicy};
use spike_nexus::services::store::memory::MemoryStore;
use spike_nexus::services::store::sqlite::SqliteStore;
use spike_nexus::services::store::{SecretStoreService, SecretVersionRecord};
use spike_nexus::services::sweeper::{SweeperTaskArgs, sweeper_task};
use spike_types::crypto::RootKey;
use spike_types::error::SpikeError;
use spike_types::{KekId, KekMetadata, KekStatus, RmkVersion};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn test_rmk() -> RootKey {
    RootKey::from_bytes([0xAA; 32])
}

async fn manager_for(store: &SecretStoreService) -> KekManager {
    KekManager::init(
        store.clone(),
        test_rmk(),
        RmkVersion::INITIAL,
        KekPolicy::default(),
    )
    .await
    .expect("kek manager init")
}

async fn engine_for(
    store: &SecretStoreService,
) -> (SecretEngine, mpsc::UnboundedReceiver<RewrapRequest>) {
    let manager = manager_for(store).await;
    let (tx, rx) = mpsc::unbounded_channel();
    (SecretEngine::new(store.clone(), manager, tx, 10), rx)
}

fn app_db_values() -> HashMap<String, String> {
    [
        ("user".to_owned(), "admin".to_owned()),
        ("pwd".to_owned(), "s3cret".to_owned()),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn store_load_roundtrip_memory() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, _rx) = engine_for(&store).await;

    let version = engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");
    assert_eq!(version, 1);

    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load succeeds");
    assert_eq!(secret.metadata.current_version, 1);
    assert_eq!(secret.metadata.oldest_version, 1);
    assert_eq!(secret.versions[&1].data, app_db_values());
}

#[tokio::test]
async fn store_load_roundtrip_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: SecretStoreService = Arc::new(
        SqliteStore::open(&dir.path().join("spike.db"), "WAL", 5000).expect("sqlite opens"),
    );
    let (engine, _rx) = engine_for(&store).await;

    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");
    engine
        .store_secret(
            "app/db",
            [("user".to_owned(), "root".to_owned())].into_iter().collect(),
        )
        .await
        .expect("second store succeeds");

    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load succeeds");
    assert_eq!(secret.metadata.current_version, 2);
    assert_eq!(secret.versions[&1].data, app_db_values());
    assert_eq!(secret.versions[&2].data["user"], "root");

    // a specific version must exist
    let err = engine
        .load_secret("app/db", Some(9))
        .await
        .expect_err("unknown version");
    assert!(matches!(err, SpikeError::EntityNotFound));
}

#[tokio::test]
async fn sqlite_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("spike.db");
    {
        let store: SecretStoreService =
            Arc::new(SqliteStore::open(&db, "WAL", 5000).expect("sqlite opens"));
        let (engine, _rx) = engine_for(&store).await;
        engine
            .store_secret("app/db", app_db_values())
            .await
            .expect("store succeeds");
        store.close().await.expect("close succeeds");
    }

    // a fresh process recovers the same RMK and rebuilds the same KEKs
    let store: SecretStoreService =
        Arc::new(SqliteStore::open(&db, "WAL", 5000).expect("sqlite reopens"));
    let (engine, _rx) = engine_for(&store).await;
    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load after restart");
    assert_eq!(secret.versions[&1].data, app_db_values());
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, _rx) = engine_for(&store).await;
    let err = engine
        .load_secret("no/such/path", None)
        .await
        .expect_err("unknown path");
    assert!(matches!(err, SpikeError::EntityNotFound));
}

#[tokio::test]
async fn missing_current_version_fails_integrity() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, _rx) = engine_for(&store).await;
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");

    // hard-delete the version row behind the engine's back
    store
        .delete_versions_below("app/db", u32::MAX)
        .await
        .expect("row dropped");

    let err = engine
        .load_secret("app/db", None)
        .await
        .expect_err("metadata points at a missing row");
    assert!(matches!(err, SpikeError::StateIntegrityCheck(_)));
}

#[tokio::test]
async fn delete_and_undelete_move_the_visible_window() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, _rx) = engine_for(&store).await;
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("v1");
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("v2");

    engine
        .delete_secret("app/db", &[])
        .await
        .expect("delete current");
    let secret = engine.load_secret("app/db", None).await.expect("load");
    assert_eq!(secret.metadata.current_version, 1);
    assert!(!secret.versions.contains_key(&2));

    // deleting the rest leaves a shell secret
    engine
        .delete_secret("app/db", &[1])
        .await
        .expect("delete v1");
    let secret = engine.load_secret("app/db", None).await.expect("load shell");
    assert_eq!(secret.metadata.current_version, 0);
    assert_eq!(secret.metadata.oldest_version, 0);
    assert!(secret.versions.is_empty());

    engine
        .undelete_secret("app/db", &[1, 2])
        .await
        .expect("undelete");
    let secret = engine.load_secret("app/db", None).await.expect("load again");
    assert_eq!(secret.metadata.current_version, 2);
    assert_eq!(secret.metadata.oldest_version, 1);
}

#[tokio::test]
async fn rotation_keeps_secrets_readable_and_lazy_rewrap_moves_the_kek() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, mut rx) = engine_for(&store).await;
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");
    let before = store
        .load_version("app/db", 1)
        .await
        .expect("query")
        .expect("row exists");

    let (previous, current) = engine
        .kek_manager()
        .rotate_kek()
        .await
        .expect("rotation succeeds");
    assert_ne!(previous, current);
    assert_eq!(engine.kek_manager().active_kek_id().await, current);

    // the read still succeeds and schedules a rewrap
    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load after rotation");
    assert_eq!(secret.versions[&1].data, app_db_values());
    let request = rx.recv().await.expect("lazy rewrap queued");
    assert_eq!(
        request,
        RewrapRequest {
            path: "app/db".to_owned(),
            version: 1
        }
    );

    let applied = engine
        .rewrap_version(&request.path, request.version)
        .await
        .expect("rewrap succeeds");
    assert!(applied);

    let after = store
        .load_version("app/db", 1)
        .await
        .expect("query")
        .expect("row exists");
    assert_eq!(after.kek_id.as_ref(), Some(&current));
    assert!(after.rewrapped_at.is_some());
    // only the wrapping moved; ciphertext and nonce are untouched
    assert_eq!(after.ciphertext, before.ciphertext);
    assert_eq!(after.nonce, before.nonce);
    assert_ne!(after.wrapped_dek, before.wrapped_dek);

    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load after rewrap");
    assert_eq!(secret.versions[&1].data, app_db_values());
}

#[tokio::test]
async fn sweeper_drains_the_lazy_queue() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, rx) = engine_for(&store).await;
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");
    let (_, current) = engine
        .kek_manager()
        .rotate_kek()
        .await
        .expect("rotation succeeds");
    engine
        .load_secret("app/db", None)
        .await
        .expect("load queues rewrap");

    let cancellation_token = CancellationToken::new();
    let sweeper = tokio::spawn(sweeper_task(SweeperTaskArgs {
        engine: engine.clone(),
        store: store.clone(),
        sweep_interval: Duration::from_secs(3600),
        rewrap_rx: rx,
        cancellation_token: cancellation_token.clone(),
    }));

    let mut rewrapped = false;
    for _ in 0..50 {
        let row = store
            .load_version("app/db", 1)
            .await
            .expect("query")
            .expect("row exists");
        if row.kek_id.as_ref() == Some(&current) {
            rewrapped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(rewrapped, "sweeper rewrapped the queued version");

    cancellation_token.cancel();
    sweeper
        .await
        .expect("task joins")
        .expect("sweeper exits cleanly");
}

#[tokio::test]
async fn rmk_rotation_self_check_and_rollback() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());
    let (engine, _rx) = engine_for(&store).await;
    engine
        .store_secret("app/db", app_db_values())
        .await
        .expect("store succeeds");
    let manager = engine.kek_manager();

    // re-sharding presents the same key bytes under a new version
    let _snapshot = manager.prepare_rmk_rotation().await;
    manager
        .rotate_rmk(&test_rmk(), &test_rmk(), RmkVersion::new(2))
        .await
        .expect("rotation succeeds");
    manager
        .validate_rmk_rotation()
        .await
        .expect("validation succeeds");
    assert_eq!(manager.rmk_version().await, RmkVersion::new(2));
    for meta in manager.list_metadata().await {
        assert_eq!(meta.rmk_version, RmkVersion::new(2));
    }
    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load after rmk rotation");
    assert_eq!(secret.versions[&1].data, app_db_values());

    // version must strictly grow
    let err = manager
        .rotate_rmk(&test_rmk(), &test_rmk(), RmkVersion::new(2))
        .await
        .expect_err("stale version");
    assert!(matches!(err, SpikeError::EntityInvalid(_)));

    // a genuinely different key fails the self-check; rollback restores
    // the snapshot byte-for-byte
    let snapshot2 = manager.prepare_rmk_rotation().await;
    let err = manager
        .rotate_rmk(&test_rmk(), &RootKey::from_bytes([0x11; 32]), RmkVersion::new(3))
        .await
        .expect_err("derivation diverges");
    assert!(matches!(err, SpikeError::StateIntegrityCheck(_)));
    manager
        .rollback_rmk_rotation(&snapshot2, &test_rmk())
        .await
        .expect("rollback succeeds");
    assert_eq!(manager.rmk_version().await, snapshot2.rmk_version);
    let mut restored = manager.list_metadata().await;
    restored.sort_by(|a, b| a.id.cmp(&b.id));
    let mut expected: Vec<KekMetadata> = snapshot2.metadata.values().cloned().collect();
    expected.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(restored, expected);

    let secret = engine
        .load_secret("app/db", None)
        .await
        .expect("load after rollback");
    assert_eq!(secret.versions[&1].data, app_db_values());
}

#[tokio::test]
async fn retirement_skips_referenced_keks() {
    let store: SecretStoreService = Arc::new(MemoryStore::new());

    // seed an aged grace KEK plus a version row still referencing it
    let grace_id = KekId::new("v1-2024-01");
    let aged = Utc::now() - ChronoDuration::days(400);
    store
        .upsert_kek_metadata(&KekMetadata {
            id: grace_id.clone(),
            version: 1,
            salt: vec![0xBB; 32],
            rmk_version: RmkVersion::INITIAL,
            created_at: aged,
            retired_at: None,
            wraps_count: 7,
            status: KekStatus::Grace,
        })
        .await
        .expect("seed grace kek");
    store
        .store_secret(
            spike_nexus::services::store::SecretMetadataRecord {
                path: "app/db".to_owned(),
                base_nonce: vec![0; 12],
                enc_current_version: vec![1],
                enc_oldest_version: vec![1],
                enc_created_time: vec![1],
                enc_updated_time: vec![1],
                enc_max_versions: vec![1],
            },
            vec![SecretVersionRecord {
                path: "app/db".to_owned(),
                version: 1,
                nonce: vec![0; 12],
                ciphertext: vec![1, 2, 3],
                created_time: aged,
                deleted_time: None,
                kek_id: Some(grace_id.clone()),
                wrapped_dek: Some(vec![4; 48]),
                dek_nonce: Some(vec![0; 12]),
                aead_alg: Some(spike_types::AeadAlg::Aes256Gcm),
                rewrapped_at: None,
            }],
        )
        .await
        .expect("seed referencing row");

    let manager = manager_for(&store).await;
    manager
        .retirement_sweep()
        .await
        .expect("sweep runs");
    let grace = manager
        .list_metadata()
        .await
        .into_iter()
        .find(|meta| meta.id == grace_id)
        .expect("grace kek present");
    assert_eq!(grace.status, KekStatus::Grace, "referenced KEKs stay in grace");

    // after the reference is gone the same sweep retires it
    store
        .delete_versions_below("app/db", u32::MAX)
        .await
        .expect("drop the reference");
    manager
        .retirement_sweep()
        .await
        .expect("sweep runs again");
    let retired = manager
        .list_metadata()
        .await
        .into_iter()
        .find(|meta| meta.id == grace_id)
        .expect("kek present");
    assert_eq!(retired.status, KekStatus::Retired);
    assert!(retired.retired_at.is_some());
}
