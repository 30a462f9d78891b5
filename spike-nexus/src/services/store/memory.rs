//! Volatile in-memory implementation of [`SecretStore`].
//!
//! Selected with `BACKEND_STORE=memory`. Rows are held exactly as the
//! SQLite backend would persist them (still encrypted); a process restart
//! loses everything. Reads take the store's shared lock, writes the
//! exclusive one.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use spike_types::error::SpikeError;
use spike_types::{KekId, KekMetadata};

use super::{RewrapUpdate, SecretMetadataRecord, SecretStore, SecretVersionRecord};

#[derive(Default)]
struct Inner {
    metadata: HashMap<String, SecretMetadataRecord>,
    versions: HashMap<String, BTreeMap<u32, SecretVersionRecord>>,
    keks: BTreeMap<String, KekMetadata>,
}

/// The in-memory secret store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn store_secret(
        &self,
        metadata: SecretMetadataRecord,
        versions: Vec<SecretVersionRecord>,
    ) -> Result<(), SpikeError> {
        let mut inner = self.inner.write();
        let per_path = inner.versions.entry(metadata.path.clone()).or_default();
        for version in versions {
            per_path.insert(version.version, version);
        }
        inner.metadata.insert(metadata.path.clone(), metadata);
        Ok(())
    }

    async fn load_metadata(
        &self,
        path: &str,
    ) -> Result<Option<SecretMetadataRecord>, SpikeError> {
        Ok(self.inner.read().metadata.get(path).cloned())
    }

    async fn load_versions(&self, path: &str) -> Result<Vec<SecretVersionRecord>, SpikeError> {
        Ok(self
            .inner
            .read()
            .versions
            .get(path)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_version(
        &self,
        path: &str,
        version: u32,
    ) -> Result<Option<SecretVersionRecord>, SpikeError> {
        Ok(self
            .inner
            .read()
            .versions
            .get(path)
            .and_then(|rows| rows.get(&version).cloned()))
    }

    async fn load_paths(&self) -> Result<Vec<String>, SpikeError> {
        let mut paths: Vec<String> = self.inner.read().metadata.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn update_deleted_time(
        &self,
        path: &str,
        version: u32,
        deleted_time: Option<DateTime<Utc>>,
    ) -> Result<(), SpikeError> {
        let mut inner = self.inner.write();
        let row = inner
            .versions
            .get_mut(path)
            .and_then(|rows| rows.get_mut(&version))
            .ok_or(SpikeError::EntityNotFound)?;
        row.deleted_time = deleted_time;
        Ok(())
    }

    async fn delete_versions_below(&self, path: &str, oldest: u32) -> Result<(), SpikeError> {
        let mut inner = self.inner.write();
        if let Some(rows) = inner.versions.get_mut(path) {
            rows.retain(|version, _| *version >= oldest);
        }
        Ok(())
    }

    async fn update_wrapping(&self, update: RewrapUpdate) -> Result<bool, SpikeError> {
        let mut inner = self.inner.write();
        let Some(row) = inner
            .versions
            .get_mut(&update.path)
            .and_then(|rows| rows.get_mut(&update.version))
        else {
            return Ok(false);
        };
        if row.kek_id.as_ref() != Some(&update.expected_kek_id) {
            return Ok(false);
        }
        row.kek_id = Some(update.kek_id);
        row.wrapped_dek = Some(update.wrapped_dek);
        row.dek_nonce = Some(update.dek_nonce);
        row.aead_alg = Some(update.aead_alg);
        row.rewrapped_at = Some(update.rewrapped_at);
        Ok(true)
    }

    async fn list_refs_by_kek(&self, kek_id: &KekId) -> Result<Vec<(String, u32)>, SpikeError> {
        let inner = self.inner.read();
        let mut refs = Vec::new();
        for (path, rows) in inner.versions.iter() {
            for row in rows.values() {
                if row.deleted_time.is_none() && row.kek_id.as_ref() == Some(kek_id) {
                    refs.push((path.clone(), row.version));
                }
            }
        }
        refs.sort();
        Ok(refs)
    }

    async fn count_refs_by_kek(&self, kek_id: &KekId) -> Result<u64, SpikeError> {
        Ok(self.list_refs_by_kek(kek_id).await?.len() as u64)
    }

    async fn load_kek_metadata(&self) -> Result<Vec<KekMetadata>, SpikeError> {
        Ok(self.inner.read().keks.values().cloned().collect())
    }

    async fn upsert_kek_metadata(&self, metadata: &KekMetadata) -> Result<(), SpikeError> {
        self.inner
            .write()
            .keks
            .insert(metadata.id.as_str().to_owned(), metadata.clone());
        Ok(())
    }

    async fn replace_kek_metadata(&self, metadata: &[KekMetadata]) -> Result<(), SpikeError> {
        let mut inner = self.inner.write();
        inner.keks.clear();
        for meta in metadata {
            inner.keks.insert(meta.id.as_str().to_owned(), meta.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SpikeError> {
        Ok(())
    }
}
