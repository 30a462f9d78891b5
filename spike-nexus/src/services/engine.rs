//! The envelope-encrypting secret engine.
//!
//! Sits between the API handlers and the [`SecretStore`]: every write
//! generates a fresh DEK, seals the JSON-encoded key→value map, wraps the
//! DEK under the current KEK and commits metadata + ciphertext +
//! wrapped-DEK in a single serializable transaction. Reads resolve the
//! wrapping KEK by id, unwrap, decrypt, and — when the wrapping KEK is no
//! longer current and lazy rewrap is enabled — schedule a background
//! rewrap with the sweeper.
//!
//! The five metadata columns are sealed individually under nonces derived
//! from one fresh base nonce and the fixed per-field salts.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use spike_core::envelope::{
    self, FIELD_SALT_CREATED_TIME, FIELD_SALT_CURRENT_VERSION, FIELD_SALT_MAX_VERSIONS,
    FIELD_SALT_OLDEST_VERSION, FIELD_SALT_UPDATED_TIME, NONCE_LEN,
};
use spike_types::api::{Secret, SecretMetadata, SecretVersion};
use spike_types::crypto::Kek;
use spike_types::error::SpikeError;

use crate::metrics::{
    METRICS_ID_NEXUS_REWRAPS, METRICS_ID_NEXUS_SECRET_READS, METRICS_ID_NEXUS_SECRET_WRITES,
};
use crate::services::kek_manager::KekManager;
use crate::services::store::{
    RewrapUpdate, SecretMetadataRecord, SecretStoreService, SecretVersionRecord,
};

/// A queued lazy-rewrap of one secret version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewrapRequest {
    /// The secret path.
    pub path: String,
    /// The version whose wrapping KEK is stale.
    pub version: u32,
}

/// The secret engine: envelope codec plus store plus KEK manager.
#[derive(Clone)]
pub struct SecretEngine {
    store: SecretStoreService,
    kek_manager: KekManager,
    rewrap_tx: mpsc::UnboundedSender<RewrapRequest>,
    default_max_versions: u32,
}

impl SecretEngine {
    /// Creates the engine. `rewrap_tx` feeds the sweeper's lazy queue.
    pub fn new(
        store: SecretStoreService,
        kek_manager: KekManager,
        rewrap_tx: mpsc::UnboundedSender<RewrapRequest>,
        default_max_versions: u32,
    ) -> Self {
        Self {
            store,
            kek_manager,
            rewrap_tx,
            default_max_versions,
        }
    }

    /// The KEK manager this engine wraps under.
    pub fn kek_manager(&self) -> &KekManager {
        &self.kek_manager
    }

    fn seal_metadata(
        key: &Kek,
        path: &str,
        meta: &SecretMetadata,
    ) -> Result<SecretMetadataRecord, SpikeError> {
        let base_nonce = envelope::random_nonce(&mut rand::thread_rng());
        let seal_field = |salt: &[u8; NONCE_LEN], plaintext: &str| -> Result<Vec<u8>, SpikeError> {
            let nonce = envelope::derive_field_nonce(&base_nonce, salt)?;
            envelope::seal(key.as_bytes(), &nonce, plaintext.as_bytes(), &[])
        };
        Ok(SecretMetadataRecord {
            path: path.to_owned(),
            base_nonce: base_nonce.to_vec(),
            enc_current_version: seal_field(
                &FIELD_SALT_CURRENT_VERSION,
                &meta.current_version.to_string(),
            )?,
            enc_oldest_version: seal_field(
                &FIELD_SALT_OLDEST_VERSION,
                &meta.oldest_version.to_string(),
            )?,
            enc_created_time: seal_field(&FIELD_SALT_CREATED_TIME, &meta.created_time.to_rfc3339())?,
            enc_updated_time: seal_field(&FIELD_SALT_UPDATED_TIME, &meta.updated_time.to_rfc3339())?,
            enc_max_versions: seal_field(&FIELD_SALT_MAX_VERSIONS, &meta.max_versions.to_string())?,
        })
    }

    fn open_metadata(key: &Kek, record: &SecretMetadataRecord) -> Result<SecretMetadata, SpikeError> {
        let open_field = |salt: &[u8; NONCE_LEN], ciphertext: &[u8]| -> Result<String, SpikeError> {
            let nonce = envelope::derive_field_nonce(&record.base_nonce, salt)?;
            let plaintext = Zeroizing::new(envelope::open(key.as_bytes(), &nonce, ciphertext, &[])?);
            String::from_utf8(plaintext.to_vec())
                .map_err(|err| SpikeError::DataUnmarshalFailure(err.to_string()))
        };
        let parse_u32 = |value: String| -> Result<u32, SpikeError> {
            value
                .parse()
                .map_err(|_| SpikeError::DataUnmarshalFailure(format!("not a version: {value}")))
        };
        let parse_ts = |value: String| -> Result<DateTime<Utc>, SpikeError> {
            DateTime::parse_from_rfc3339(&value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| SpikeError::DataUnmarshalFailure(err.to_string()))
        };
        Ok(SecretMetadata {
            current_version: parse_u32(open_field(
                &FIELD_SALT_CURRENT_VERSION,
                &record.enc_current_version,
            )?)?,
            oldest_version: parse_u32(open_field(
                &FIELD_SALT_OLDEST_VERSION,
                &record.enc_oldest_version,
            )?)?,
            created_time: parse_ts(open_field(&FIELD_SALT_CREATED_TIME, &record.enc_created_time)?)?,
            updated_time: parse_ts(open_field(&FIELD_SALT_UPDATED_TIME, &record.enc_updated_time)?)?,
            max_versions: parse_u32(open_field(
                &FIELD_SALT_MAX_VERSIONS,
                &record.enc_max_versions,
            )?)?,
        })
    }

    async fn load_decrypted_metadata(
        &self,
        path: &str,
    ) -> Result<Option<SecretMetadata>, SpikeError> {
        let Some(record) = self.store.load_metadata(path).await? else {
            return Ok(None);
        };
        let key = self.kek_manager.metadata_key().await;
        Self::open_metadata(&key, &record).map(Some)
    }

    /// Stores a new version of the secret at `path`.
    ///
    /// Returns the version number the write produced.
    pub async fn store_secret(
        &self,
        path: &str,
        values: HashMap<String, String>,
    ) -> Result<u32, SpikeError> {
        let now = Utc::now();
        let existing_versions = self.store.load_versions(path).await?;
        let highest = existing_versions.last().map(|row| row.version).unwrap_or(0);

        let mut meta = self
            .load_decrypted_metadata(path)
            .await?
            .unwrap_or(SecretMetadata {
                current_version: 0,
                oldest_version: 0,
                created_time: now,
                updated_time: now,
                max_versions: self.default_max_versions,
            });

        let new_version = highest.max(meta.current_version) + 1;
        meta.current_version = new_version;
        meta.updated_time = now;
        if meta.oldest_version == 0 {
            meta.oldest_version = new_version;
        }
        let mut prune_below = None;
        if meta.max_versions > 0 && new_version - meta.oldest_version + 1 > meta.max_versions {
            let new_oldest = new_version + 1 - meta.max_versions;
            prune_below = Some(new_oldest);
            meta.oldest_version = new_oldest;
        }

        let plaintext = Zeroizing::new(
            serde_json::to_vec(&values)
                .map_err(|err| SpikeError::DataMarshalFailure(err.to_string()))?,
        );
        let (dek, nonce, ciphertext) = {
            let mut rng = rand::thread_rng();
            let dek = envelope::generate_dek(&mut rng);
            let nonce = envelope::random_nonce(&mut rng);
            let ciphertext = envelope::seal(dek.as_bytes(), &nonce, &plaintext, &[])?;
            (dek, nonce, ciphertext)
        };

        let (kek_id, kek) = self.kek_manager.active_kek().await?;
        let wrapped = {
            let mut rng = rand::thread_rng();
            envelope::wrap_dek(&dek, &kek, &kek_id, &mut rng)?
        };

        let metadata_key = self.kek_manager.metadata_key().await;
        let metadata_record = Self::seal_metadata(&metadata_key, path, &meta)?;
        let version_record = SecretVersionRecord {
            path: path.to_owned(),
            version: new_version,
            nonce: nonce.to_vec(),
            ciphertext,
            created_time: now,
            deleted_time: None,
            kek_id: Some(wrapped.kek_id.clone()),
            wrapped_dek: Some(wrapped.wrapped.clone()),
            dek_nonce: Some(wrapped.nonce.to_vec()),
            aead_alg: Some(wrapped.aead_alg),
            rewrapped_at: None,
        };

        self.store
            .store_secret(metadata_record, vec![version_record])
            .await?;
        // wrap accounting is best-effort and outside the transaction
        self.kek_manager.record_wraps(1).await;

        if let Some(oldest) = prune_below {
            if let Err(err) = self.store.delete_versions_below(path, oldest).await {
                tracing::warn!("could not prune {path} below version {oldest}: {err}");
            }
        }

        ::metrics::counter!(METRICS_ID_NEXUS_SECRET_WRITES).increment(1);
        Ok(new_version)
    }

    async fn open_version(&self, row: &SecretVersionRecord) -> Result<SecretVersion, SpikeError> {
        let plaintext = match &row.kek_id {
            Some(kek_id) => {
                let wrapped = row.wrapped_dek.as_deref().ok_or_else(|| {
                    SpikeError::StateIntegrityCheck(format!(
                        "version {}@{} has a kek_id but no wrapped DEK",
                        row.path, row.version
                    ))
                })?;
                let dek_nonce = row.dek_nonce.as_deref().ok_or_else(|| {
                    SpikeError::StateIntegrityCheck(format!(
                        "version {}@{} has a kek_id but no DEK nonce",
                        row.path, row.version
                    ))
                })?;
                let kek = self.kek_manager.derive(kek_id).await?;
                let dek = envelope::unwrap_dek(wrapped, dek_nonce, &kek)?;
                Zeroizing::new(envelope::open(
                    dek.as_bytes(),
                    &row.nonce,
                    &row.ciphertext,
                    &[],
                )?)
            }
            // legacy row: sealed directly under the metadata key
            None => {
                let key = self.kek_manager.metadata_key().await;
                Zeroizing::new(envelope::open(
                    key.as_bytes(),
                    &row.nonce,
                    &row.ciphertext,
                    &[],
                )?)
            }
        };
        let data: HashMap<String, String> = serde_json::from_slice(&plaintext)
            .map_err(|err| SpikeError::DataUnmarshalFailure(err.to_string()))?;
        Ok(SecretVersion {
            data,
            created_time: row.created_time,
            deleted_time: row.deleted_time,
        })
    }

    /// Loads the secret at `path`.
    ///
    /// `version` of `None` or 0 means the current version; a specific
    /// version must exist and not be deleted. The returned model covers
    /// metadata plus all non-deleted versions.
    pub async fn load_secret(
        &self,
        path: &str,
        version: Option<u32>,
    ) -> Result<Secret, SpikeError> {
        let record = self
            .store
            .load_metadata(path)
            .await?
            .ok_or(SpikeError::EntityNotFound)?;
        let key = self.kek_manager.metadata_key().await;
        let meta = Self::open_metadata(&key, &record)?;

        let rows = self.store.load_versions(path).await?;
        if meta.current_version != 0
            && !rows.iter().any(|row| row.version == meta.current_version)
        {
            return Err(SpikeError::StateIntegrityCheck(format!(
                "metadata of {path} points at missing version {}",
                meta.current_version
            )));
        }

        let requested = match version {
            Some(0) | None => meta.current_version,
            Some(v) => v,
        };
        if requested != 0 {
            let found = rows
                .iter()
                .find(|row| row.version == requested)
                .ok_or(SpikeError::EntityNotFound)?;
            if found.deleted_time.is_some() {
                return Err(SpikeError::EntityNotFound);
            }
        }

        let active_id = self.kek_manager.active_kek_id().await;
        let lazy = self.kek_manager.policy().lazy_rewrap_enabled;
        let mut versions = BTreeMap::new();
        for row in &rows {
            if row.deleted_time.is_some() {
                continue;
            }
            versions.insert(row.version, self.open_version(row).await?);
            if lazy && row.kek_id.as_ref().is_some_and(|id| *id != active_id) {
                // fire-and-forget: the sweeper drains the queue
                let _ = self.rewrap_tx.send(RewrapRequest {
                    path: path.to_owned(),
                    version: row.version,
                });
            }
        }

        ::metrics::counter!(METRICS_ID_NEXUS_SECRET_READS).increment(1);
        Ok(Secret {
            path: path.to_owned(),
            metadata: meta,
            versions,
        })
    }

    /// Soft-deletes the given versions (empty slice: the current version)
    /// and refreshes the metadata row.
    pub async fn delete_secret(&self, path: &str, versions: &[u32]) -> Result<(), SpikeError> {
        self.set_deleted(path, versions, Some(Utc::now())).await
    }

    /// Clears the deletion marker of the given versions (empty slice: the
    /// newest deleted version) and refreshes the metadata row.
    pub async fn undelete_secret(&self, path: &str, versions: &[u32]) -> Result<(), SpikeError> {
        self.set_deleted(path, versions, None).await
    }

    async fn set_deleted(
        &self,
        path: &str,
        versions: &[u32],
        deleted_time: Option<DateTime<Utc>>,
    ) -> Result<(), SpikeError> {
        let mut meta = self
            .load_decrypted_metadata(path)
            .await?
            .ok_or(SpikeError::EntityNotFound)?;
        let rows = self.store.load_versions(path).await?;

        let targets: Vec<u32> = if versions.is_empty() {
            let implied = if deleted_time.is_some() {
                // delete: the current version
                (meta.current_version != 0).then_some(meta.current_version)
            } else {
                // undelete: the newest deleted version
                rows.iter()
                    .rev()
                    .find(|row| row.deleted_time.is_some())
                    .map(|row| row.version)
            };
            implied.into_iter().collect()
        } else {
            versions.to_vec()
        };
        if targets.is_empty() {
            return Err(SpikeError::EntityNotFound);
        }

        for version in &targets {
            self.store
                .update_deleted_time(path, *version, deleted_time)
                .await?;
        }

        // recompute the visible window from the surviving rows
        let rows = self.store.load_versions(path).await?;
        let live: Vec<u32> = rows
            .iter()
            .filter(|row| row.deleted_time.is_none())
            .map(|row| row.version)
            .collect();
        meta.current_version = live.iter().max().copied().unwrap_or(0);
        meta.oldest_version = live.iter().min().copied().unwrap_or(0);
        meta.updated_time = Utc::now();

        let key = self.kek_manager.metadata_key().await;
        let record = Self::seal_metadata(&key, path, &meta)?;
        self.store.store_secret(record, Vec::new()).await
    }

    /// All secret paths, sorted.
    pub async fn list_paths(&self) -> Result<Vec<String>, SpikeError> {
        self.store.load_paths().await
    }

    /// Loads every secret in the store.
    ///
    /// Per-path failures are logged and skipped — damage to one row must
    /// not hide the rest of the batch.
    pub async fn load_all_secrets(&self) -> Result<Vec<Secret>, SpikeError> {
        let mut secrets = Vec::new();
        for path in self.store.load_paths().await? {
            match self.load_secret(&path, None).await {
                Ok(secret) => secrets.push(secret),
                Err(err) => tracing::warn!("skipping unreadable secret {path}: {err}"),
            }
        }
        Ok(secrets)
    }

    /// Rewraps one version's DEK under the current KEK.
    ///
    /// The ciphertext and its AEAD nonce stay untouched; only the wrapping
    /// moves. Returns `false` when there was nothing to do (row gone, row
    /// legacy, already current, or lost the compare-and-set race).
    pub async fn rewrap_version(&self, path: &str, version: u32) -> Result<bool, SpikeError> {
        let Some(row) = self.store.load_version(path, version).await? else {
            return Ok(false);
        };
        // legacy rows keep their pre-envelope format
        let Some(old_kek_id) = row.kek_id else {
            return Ok(false);
        };
        let (active_id, active_kek) = self.kek_manager.active_kek().await?;
        if old_kek_id == active_id {
            return Ok(false);
        }
        let wrapped = row.wrapped_dek.as_deref().ok_or_else(|| {
            SpikeError::StateIntegrityCheck(format!(
                "version {path}@{version} has a kek_id but no wrapped DEK"
            ))
        })?;
        let dek_nonce = row.dek_nonce.as_deref().ok_or_else(|| {
            SpikeError::StateIntegrityCheck(format!(
                "version {path}@{version} has a kek_id but no DEK nonce"
            ))
        })?;

        let old_kek = self.kek_manager.derive(&old_kek_id).await?;
        let rewrapped = envelope::rewrap_dek(
            wrapped,
            dek_nonce,
            &old_kek,
            &active_kek,
            &active_id,
            &mut rand::thread_rng(),
        )?;

        let applied = self
            .store
            .update_wrapping(RewrapUpdate {
                path: path.to_owned(),
                version,
                expected_kek_id: old_kek_id,
                kek_id: rewrapped.kek_id,
                wrapped_dek: rewrapped.wrapped,
                dek_nonce: rewrapped.nonce.to_vec(),
                aead_alg: rewrapped.aead_alg,
                rewrapped_at: Utc::now(),
            })
            .await?;
        if applied {
            self.kek_manager.record_wraps(1).await;
            ::metrics::counter!(METRICS_ID_NEXUS_REWRAPS).increment(1);
        }
        Ok(applied)
    }
}
