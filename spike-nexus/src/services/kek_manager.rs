//! The KEK manager: metadata set, derivation cache, rotation policy, and
//! the RMK rotation ceremony.
//!
//! KEKs are deterministic functions of `(rmk, salt, kek_id)`; the manager
//! keeps an in-memory cache of derived 32-byte keys purely as a performance
//! optimization. Cache entries are dropped (and thereby zeroized) on
//! retirement and on RMK rotation.
//!
//! One shared/exclusive lock guards metadata, cache, and the current-KEK
//! id. Persistence goes through the [`SecretStore`](super::store::SecretStore)
//! so Nexus restarts see the same KEK set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::RngCore as _;
use std::sync::Arc;
use tokio::sync::RwLock;

use spike_core::kdf;
use spike_types::crypto::{Kek, RootKey};
use spike_types::error::SpikeError;
use spike_types::{KekId, KekMetadata, KekStatus, RmkVersion};

use crate::metrics::{
    METRICS_ID_NEXUS_KEK_COUNT, METRICS_ID_NEXUS_KEK_ROTATIONS, METRICS_ID_NEXUS_RMK_ROTATIONS,
};
use crate::services::store::SecretStoreService;

/// The rotation policy applied by the manager and the sweeper.
#[derive(Clone, Debug)]
pub struct KekPolicy {
    /// Whether the sweeper rotates the active KEK automatically.
    pub rotation_enabled: bool,
    /// Age in days after which the active KEK should rotate.
    pub rotation_days: i64,
    /// Wrap count after which the active KEK should rotate.
    pub max_wraps: i64,
    /// Days a grace KEK waits before it may retire.
    pub grace_days: i64,
    /// Whether reads schedule background rewraps.
    pub lazy_rewrap_enabled: bool,
    /// Rate limit of background rewraps per second.
    pub max_rewrap_qps: u32,
}

impl Default for KekPolicy {
    fn default() -> Self {
        Self {
            rotation_enabled: false,
            rotation_days: 90,
            max_wraps: 20_000_000,
            grace_days: 180,
            lazy_rewrap_enabled: true,
            max_rewrap_qps: 100,
        }
    }
}

/// The deep-copy snapshot `PrepareRMKRotation` returns.
///
/// The sole input to rollback.
#[derive(Clone)]
pub struct RmkRotationSnapshot {
    /// The RMK version at snapshot time.
    pub rmk_version: RmkVersion,
    /// The full KEK metadata set at snapshot time.
    pub metadata: HashMap<KekId, KekMetadata>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

struct Inner {
    metadata: HashMap<KekId, KekMetadata>,
    active: KekId,
    cache: HashMap<KekId, Kek>,
    rmk: RootKey,
    rmk_version: RmkVersion,
    metadata_key: Kek,
}

/// Manager of the KEK metadata set and derived-key cache.
#[derive(Clone)]
pub struct KekManager {
    inner: Arc<RwLock<Inner>>,
    store: SecretStoreService,
    policy: Arc<KekPolicy>,
}

fn fresh_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn kek_id_for(version: u32, now: DateTime<Utc>) -> KekId {
    KekId::new(format!("v{}-{}", version, now.format("%Y-%m")))
}

impl KekManager {
    /// Loads the KEK metadata set from the store and ensures exactly one
    /// active KEK exists, creating the first one on a fresh deployment.
    pub async fn init(
        store: SecretStoreService,
        rmk: RootKey,
        rmk_version: RmkVersion,
        policy: KekPolicy,
    ) -> Result<Self, SpikeError> {
        let metadata_key = kdf::derive_metadata_key(&rmk)?;
        let rows = store.load_kek_metadata().await?;
        // restarts resume at the version the persisted set reached
        let rmk_version = rows
            .iter()
            .map(|row| row.rmk_version)
            .max()
            .unwrap_or(rmk_version)
            .max(rmk_version);
        let mut rows = rows;
        rows.sort_by_key(|row| row.version);
        let mut metadata = HashMap::new();
        let mut active: Option<KekMetadata> = None;
        for row in rows {
            if row.status == KekStatus::Active {
                // duplicate actives can only come from a crashed rotation;
                // the highest version wins, the rest demote to grace
                if let Some(mut demoted) = active.take() {
                    demoted.status = KekStatus::Grace;
                    tracing::warn!("demoting duplicate active KEK {}", demoted.id);
                    store.upsert_kek_metadata(&demoted).await?;
                    metadata.insert(demoted.id.clone(), demoted);
                }
                active = Some(row.clone());
            }
            metadata.insert(row.id.clone(), row);
        }

        let active = match active {
            Some(meta) => meta,
            None => {
                let version = metadata.len() as u32 + 1;
                let now = Utc::now();
                let meta = KekMetadata {
                    id: kek_id_for(version, now),
                    version,
                    salt: fresh_salt(),
                    rmk_version,
                    created_at: now,
                    retired_at: None,
                    wraps_count: 0,
                    status: KekStatus::Active,
                };
                tracing::info!("creating initial KEK {}", meta.id);
                store.upsert_kek_metadata(&meta).await?;
                metadata.insert(meta.id.clone(), meta.clone());
                meta
            }
        };

        ::metrics::gauge!(METRICS_ID_NEXUS_KEK_COUNT).set(metadata.len() as f64);
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner {
                active: active.id.clone(),
                metadata,
                cache: HashMap::new(),
                rmk,
                rmk_version,
                metadata_key,
            })),
            store,
            policy: Arc::new(policy),
        })
    }

    /// The policy this manager applies.
    pub fn policy(&self) -> &KekPolicy {
        &self.policy
    }

    /// The id of the currently active KEK.
    pub async fn active_kek_id(&self) -> KekId {
        self.inner.read().await.active.clone()
    }

    /// The current RMK version.
    pub async fn rmk_version(&self) -> RmkVersion {
        self.inner.read().await.rmk_version
    }

    /// The key the metadata columns (and legacy rows) are encrypted under.
    pub async fn metadata_key(&self) -> Kek {
        self.inner.read().await.metadata_key.clone()
    }

    /// The RMK reference the manager currently derives from.
    ///
    /// Only the rotation ceremony may take a copy; it wipes it when done.
    pub(crate) async fn current_rmk(&self) -> RootKey {
        self.inner.read().await.rmk.clone()
    }

    /// The currently active KEK id together with its derived key.
    pub async fn active_kek(&self) -> Result<(KekId, Kek), SpikeError> {
        let id = self.active_kek_id().await;
        let kek = self.derive(&id).await?;
        Ok((id, kek))
    }

    /// Derives (or serves from cache) the KEK with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`SpikeError::EntityNotFound`] for an unknown id.
    pub async fn derive(&self, kek_id: &KekId) -> Result<Kek, SpikeError> {
        {
            let inner = self.inner.read().await;
            if let Some(kek) = inner.cache.get(kek_id) {
                return Ok(kek.clone());
            }
        }
        let mut inner = self.inner.write().await;
        let (salt, status) = {
            let meta = inner
                .metadata
                .get(kek_id)
                .ok_or(SpikeError::EntityNotFound)?;
            (meta.salt.clone(), meta.status)
        };
        let kek = kdf::derive_kek(&inner.rmk, &salt, kek_id)?;
        if status != KekStatus::Retired {
            inner.cache.insert(kek_id.clone(), kek.clone());
        }
        Ok(kek)
    }

    /// Returns `true` iff the rotation policy calls for a new KEK.
    pub async fn should_rotate(&self) -> bool {
        let inner = self.inner.read().await;
        let Some(meta) = inner.metadata.get(&inner.active) else {
            return true;
        };
        if meta.status != KekStatus::Active {
            return true;
        }
        let age_days = (Utc::now() - meta.created_at).num_days();
        age_days >= self.policy.rotation_days || meta.wraps_count >= self.policy.max_wraps
    }

    /// Moves the active KEK to grace and creates a fresh active one.
    ///
    /// Atomic w.r.t. the KEK metadata set; does not touch secret rows.
    /// Linearizable w.r.t. writes: once this returns, new writes wrap under
    /// the new KEK.
    pub async fn rotate_kek(&self) -> Result<(KekId, KekId), SpikeError> {
        let mut inner = self.inner.write().await;
        let previous_id = inner.active.clone();
        let mut previous = inner
            .metadata
            .get(&previous_id)
            .cloned()
            .ok_or(SpikeError::EntityNotFound)?;
        previous.status = KekStatus::Grace;

        let version = inner.metadata.len() as u32 + 1;
        let now = Utc::now();
        let fresh = KekMetadata {
            id: kek_id_for(version, now),
            version,
            salt: fresh_salt(),
            rmk_version: inner.rmk_version,
            created_at: now,
            retired_at: None,
            wraps_count: 0,
            status: KekStatus::Active,
        };

        self.store.upsert_kek_metadata(&previous).await?;
        self.store.upsert_kek_metadata(&fresh).await?;

        inner.metadata.insert(previous_id.clone(), previous);
        inner.metadata.insert(fresh.id.clone(), fresh.clone());
        inner.active = fresh.id.clone();

        ::metrics::counter!(METRICS_ID_NEXUS_KEK_ROTATIONS).increment(1);
        ::metrics::gauge!(METRICS_ID_NEXUS_KEK_COUNT).set(inner.metadata.len() as f64);
        tracing::info!("rotated KEK {previous_id} -> {}", fresh.id);
        Ok((previous_id, fresh.id))
    }

    /// Bumps the active KEK's wrap counter by `count`.
    ///
    /// Persistence is best-effort: a failed write is logged, the in-memory
    /// counter stays bumped and is flushed on the next update.
    pub async fn record_wraps(&self, count: i64) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let active = inner.active.clone();
            inner.metadata.get_mut(&active).map(|meta| {
                meta.wraps_count += count;
                meta.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            if let Err(err) = self.store.upsert_kek_metadata(&snapshot).await {
                tracing::warn!("could not persist wraps_count for {}: {err}", snapshot.id);
            }
        }
    }

    /// The ids of all KEKs currently in grace.
    pub async fn grace_keks(&self) -> Vec<KekId> {
        self.inner
            .read()
            .await
            .metadata
            .values()
            .filter(|meta| meta.status == KekStatus::Grace)
            .map(|meta| meta.id.clone())
            .collect()
    }

    /// Retires grace KEKs older than the grace period.
    ///
    /// Must run after the sweeper rewrapped secrets off the grace KEKs: a
    /// KEK still referenced by a live secret version is skipped with a log
    /// entry. Retired cache entries are dropped (zeroized).
    pub async fn retirement_sweep(&self) -> Result<(), SpikeError> {
        let candidates: Vec<KekMetadata> = {
            let inner = self.inner.read().await;
            inner
                .metadata
                .values()
                .filter(|meta| {
                    meta.status == KekStatus::Grace
                        && (Utc::now() - meta.created_at).num_days() >= self.policy.grace_days
                })
                .cloned()
                .collect()
        };
        for mut meta in candidates {
            let refs = self.store.count_refs_by_kek(&meta.id).await?;
            if refs > 0 {
                tracing::info!(
                    "skipping retirement of {}: {refs} live secret versions still reference it",
                    meta.id
                );
                continue;
            }
            meta.status = KekStatus::Retired;
            meta.retired_at = Some(Utc::now());
            self.store.upsert_kek_metadata(&meta).await?;
            let mut inner = self.inner.write().await;
            inner.cache.remove(&meta.id);
            tracing::info!("retired KEK {}", meta.id);
            inner.metadata.insert(meta.id.clone(), meta);
        }
        Ok(())
    }

    /// The full KEK metadata set, newest first.
    pub async fn list_metadata(&self) -> Vec<KekMetadata> {
        let mut rows: Vec<KekMetadata> =
            self.inner.read().await.metadata.values().cloned().collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        rows
    }

    /// Per-KEK statistics: metadata plus live referencing version counts.
    pub async fn stats(&self) -> Result<Vec<(KekMetadata, u64)>, SpikeError> {
        let rows = self.list_metadata().await;
        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            let refs = self.store.count_refs_by_kek(&row.id).await?;
            stats.push((row, refs));
        }
        Ok(stats)
    }

    /// Takes the deep-copy snapshot RMK rotation rolls back to.
    pub async fn prepare_rmk_rotation(&self) -> RmkRotationSnapshot {
        let inner = self.inner.read().await;
        RmkRotationSnapshot {
            rmk_version: inner.rmk_version,
            metadata: inner.metadata.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Rewraps the KEK metadata set under a new RMK reference.
    ///
    /// Derivation depends only on `(rmk, salt, kek_id)`, so the key bytes
    /// presented as `new_rmk` must derive every KEK to the same value the
    /// old RMK did — RMK rotation re-shards the key, it never replaces it.
    /// A divergent derivation aborts before anything is persisted.
    ///
    /// # Errors
    ///
    /// [`SpikeError::EntityInvalid`] unless `new_version` is strictly
    /// greater than the current version; [`SpikeError::StateIntegrityCheck`]
    /// if any KEK derives differently under the new RMK.
    pub async fn rotate_rmk(
        &self,
        old_rmk: &RootKey,
        new_rmk: &RootKey,
        new_version: RmkVersion,
    ) -> Result<(), SpikeError> {
        let mut inner = self.inner.write().await;
        if new_version <= inner.rmk_version {
            return Err(SpikeError::EntityInvalid(format!(
                "rmk version must grow: {} -> {new_version}",
                inner.rmk_version
            )));
        }

        // self-check before touching anything
        for (kek_id, meta) in inner.metadata.iter() {
            let k_old = kdf::derive_kek(old_rmk, &meta.salt, kek_id)?;
            let k_new = kdf::derive_kek(new_rmk, &meta.salt, kek_id)?;
            if k_old != k_new {
                return Err(SpikeError::StateIntegrityCheck(format!(
                    "KEK {kek_id} derives differently under the new RMK"
                )));
            }
        }

        let mut updated = Vec::with_capacity(inner.metadata.len());
        for meta in inner.metadata.values_mut() {
            meta.rmk_version = new_version;
            updated.push(meta.clone());
        }
        for meta in &updated {
            self.store.upsert_kek_metadata(meta).await?;
        }

        inner.cache.clear();
        inner.rmk = new_rmk.clone();
        inner.rmk_version = new_version;
        inner.metadata_key = kdf::derive_metadata_key(new_rmk)?;
        ::metrics::counter!(METRICS_ID_NEXUS_RMK_ROTATIONS).increment(1);
        tracing::info!("rotated RMK to version {new_version}");
        Ok(())
    }

    /// Re-derives every KEK under the current RMK.
    ///
    /// # Errors
    ///
    /// Propagates the first derivation failure.
    pub async fn validate_rmk_rotation(&self) -> Result<(), SpikeError> {
        let inner = self.inner.read().await;
        for (kek_id, meta) in inner.metadata.iter() {
            kdf::derive_kek(&inner.rmk, &meta.salt, kek_id)?;
        }
        Ok(())
    }

    /// Restores KEK metadata, RMK reference and version from the snapshot
    /// and clears the cache.
    pub async fn rollback_rmk_rotation(
        &self,
        snapshot: &RmkRotationSnapshot,
        old_rmk: &RootKey,
    ) -> Result<(), SpikeError> {
        let mut inner = self.inner.write().await;
        let rows: Vec<KekMetadata> = snapshot.metadata.values().cloned().collect();
        self.store.replace_kek_metadata(&rows).await?;
        inner.metadata = snapshot.metadata.clone();
        inner.rmk_version = snapshot.rmk_version;
        inner.rmk = old_rmk.clone();
        inner.metadata_key = kdf::derive_metadata_key(old_rmk)?;
        inner.cache.clear();
        tracing::warn!(
            "rolled RMK rotation back to version {} (snapshot of {})",
            snapshot.rmk_version,
            snapshot.taken_at
        );
        Ok(())
    }
}
