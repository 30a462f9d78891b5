//! The persistent store interface of the Nexus engine.
//!
//! This module defines the [`SecretStore`] trait over encrypted rows —
//! the store never sees plaintext, only ciphertext columns produced by the
//! engine — plus the row types matching the on-disk schema.
//!
//! Current `SecretStore` implementations:
//! - SQLite (WAL, serializable transactions)
//! - Memory (volatile, for tests and ephemeral deployments)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spike_types::error::SpikeError;
use spike_types::{AeadAlg, KekId, KekMetadata};

pub mod memory;
pub mod sqlite;

/// Dynamic trait object for the secret store.
///
/// Must be `Send + Sync` to work with async contexts (e.g., Axum).
pub type SecretStoreService = Arc<dyn SecretStore + Send + Sync>;

/// One encrypted secret version row, as persisted.
///
/// Envelope rows carry `kek_id`, `wrapped_dek`, `dek_nonce` and `aead_alg`.
/// Legacy rows (written before envelope encryption) carry none of them and
/// are decrypted directly with the metadata key; they are read but never
/// written.
#[derive(Clone, Debug, PartialEq)]
pub struct SecretVersionRecord {
    /// The secret path.
    pub path: String,
    /// The version number, 1-based.
    pub version: u32,
    /// The AEAD nonce of `ciphertext`.
    pub nonce: Vec<u8>,
    /// The AEAD ciphertext of the JSON-encoded key→value map.
    pub ciphertext: Vec<u8>,
    /// When this version was written.
    pub created_time: DateTime<Utc>,
    /// When this version was soft-deleted, if it was.
    pub deleted_time: Option<DateTime<Utc>>,
    /// The wrapping KEK, absent on legacy rows.
    pub kek_id: Option<KekId>,
    /// The wrapped DEK, absent on legacy rows.
    pub wrapped_dek: Option<Vec<u8>>,
    /// The nonce of the DEK wrap, absent on legacy rows.
    pub dek_nonce: Option<Vec<u8>>,
    /// The AEAD algorithm of the version, absent on legacy rows.
    pub aead_alg: Option<AeadAlg>,
    /// When the DEK was last rewrapped, if ever.
    pub rewrapped_at: Option<DateTime<Utc>>,
}

/// The encrypted per-path metadata row.
///
/// The five scalar columns are individually encrypted under nonces derived
/// from `base_nonce` and the fixed per-field salts.
#[derive(Clone, Debug, PartialEq)]
pub struct SecretMetadataRecord {
    /// The secret path.
    pub path: String,
    /// The fresh random base nonce of this row.
    pub base_nonce: Vec<u8>,
    /// Encrypted `current_version`.
    pub enc_current_version: Vec<u8>,
    /// Encrypted `oldest_version`.
    pub enc_oldest_version: Vec<u8>,
    /// Encrypted `created_time`.
    pub enc_created_time: Vec<u8>,
    /// Encrypted `updated_time`.
    pub enc_updated_time: Vec<u8>,
    /// Encrypted `max_versions`.
    pub enc_max_versions: Vec<u8>,
}

/// A compare-and-set update of a version row's DEK wrapping.
///
/// The store applies the update only while the row still references
/// `expected_kek_id`; a concurrent rewrap wins and this one is dropped.
#[derive(Clone, Debug)]
pub struct RewrapUpdate {
    /// The secret path.
    pub path: String,
    /// The version number.
    pub version: u32,
    /// The KEK the caller unwrapped under.
    pub expected_kek_id: KekId,
    /// The new wrapping KEK.
    pub kek_id: KekId,
    /// The freshly wrapped DEK.
    pub wrapped_dek: Vec<u8>,
    /// The nonce of the new wrap.
    pub dek_nonce: Vec<u8>,
    /// The AEAD algorithm of the new wrap.
    pub aead_alg: AeadAlg,
    /// The rewrap timestamp.
    pub rewrapped_at: DateTime<Utc>,
}

/// Trait that implementations of the persistent store must provide.
///
/// Writes take the store's exclusive lock, reads the shared one; a write is
/// visible to subsequent reads iff its transaction committed, and the
/// implementation rolls back on any error before returning.
#[async_trait]
pub trait SecretStore {
    /// Upserts a metadata row and version rows in one serializable transaction.
    async fn store_secret(
        &self,
        metadata: SecretMetadataRecord,
        versions: Vec<SecretVersionRecord>,
    ) -> Result<(), SpikeError>;

    /// Loads the metadata row of a path, or `None` if the path is unknown.
    async fn load_metadata(&self, path: &str)
    -> Result<Option<SecretMetadataRecord>, SpikeError>;

    /// Loads all version rows of a path, ordered by version.
    async fn load_versions(&self, path: &str) -> Result<Vec<SecretVersionRecord>, SpikeError>;

    /// Loads a single version row.
    async fn load_version(
        &self,
        path: &str,
        version: u32,
    ) -> Result<Option<SecretVersionRecord>, SpikeError>;

    /// All known secret paths, sorted.
    async fn load_paths(&self) -> Result<Vec<String>, SpikeError>;

    /// Sets or clears the `deleted_time` of a version row.
    async fn update_deleted_time(
        &self,
        path: &str,
        version: u32,
        deleted_time: Option<DateTime<Utc>>,
    ) -> Result<(), SpikeError>;

    /// Hard-deletes version rows below `oldest` (version pruning).
    async fn delete_versions_below(&self, path: &str, oldest: u32) -> Result<(), SpikeError>;

    /// Applies a rewrap update. Returns `false` if the row no longer
    /// references the expected KEK (or disappeared) and was left alone.
    async fn update_wrapping(&self, update: RewrapUpdate) -> Result<bool, SpikeError>;

    /// Lists `(path, version)` of non-deleted version rows wrapped by `kek_id`.
    async fn list_refs_by_kek(&self, kek_id: &KekId) -> Result<Vec<(String, u32)>, SpikeError>;

    /// Counts non-deleted version rows wrapped by `kek_id`.
    async fn count_refs_by_kek(&self, kek_id: &KekId) -> Result<u64, SpikeError>;

    /// Loads the full KEK metadata set.
    async fn load_kek_metadata(&self) -> Result<Vec<KekMetadata>, SpikeError>;

    /// Inserts or updates one KEK metadata row.
    async fn upsert_kek_metadata(&self, metadata: &KekMetadata) -> Result<(), SpikeError>;

    /// Atomically replaces the whole KEK metadata set (RMK rotation rollback).
    async fn replace_kek_metadata(&self, metadata: &[KekMetadata]) -> Result<(), SpikeError>;

    /// Flushes and closes the store.
    async fn close(&self) -> Result<(), SpikeError>;
}
