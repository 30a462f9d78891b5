//! Version 1 request and response types for the Keeper and Nexus APIs.
//!
//! Binary fields (shards, contributions) travel as base64 strings; the
//! strongly-typed wrappers in [`crate::crypto`] handle that transparently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    KekId, KekMetadata, KeeperId, RmkVersion,
    api::Secret,
    crypto::{Contribution, Shard},
};

/// Body of `POST /v1/store/contribute` on a Keeper.
#[derive(Clone, Serialize, Deserialize)]
pub struct ContributeShardRequest {
    /// The id of the contributing Keeper.
    pub keeper_id: KeeperId,
    /// The 32-byte entropy contribution, base64-encoded on the wire.
    pub shard: Contribution,
}

/// Body of the `200` response of `POST /v1/store/shard` on a Keeper.
#[derive(Clone, Serialize, Deserialize)]
pub struct ShardResponse {
    /// The Keeper's Shamir share value, base64-encoded on the wire.
    pub shard: Shard,
}

/// Body of `PUT /v1/secrets` on Nexus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutSecretRequest {
    /// The secret path, e.g. `app/db`.
    pub path: String,
    /// The key→value map to store as a new version.
    pub values: HashMap<String, String>,
}

/// Body of the response of `PUT /v1/secrets`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutSecretResponse {
    /// The version number the write produced.
    pub version: u32,
}

/// Body of `POST /v1/secrets/get` on Nexus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSecretRequest {
    /// The secret path.
    pub path: String,
    /// The requested version; `None` or 0 means the current version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Body of the response of `POST /v1/secrets/get`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSecretResponse {
    /// The decrypted secret.
    pub secret: Secret,
}

/// Body of `POST /v1/secrets/delete` and `POST /v1/secrets/undelete`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretVersionsRequest {
    /// The secret path.
    pub path: String,
    /// The versions to act on; empty means the current version.
    #[serde(default)]
    pub versions: Vec<u32>,
}

/// Body of the response of `GET /v1/secrets/paths`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListPathsResponse {
    /// All secret paths, sorted.
    pub keys: Vec<String>,
}

/// Body of the response of `GET /v1/operator/keks`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KekListResponse {
    /// Metadata of every KEK, newest first.
    pub keks: Vec<KekMetadata>,
    /// The currently active KEK id.
    pub current: KekId,
}

/// One entry of the KEK stats report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KekStatEntry {
    /// Metadata of the KEK.
    #[serde(flatten)]
    pub metadata: KekMetadata,
    /// How many live secret versions still reference this KEK.
    pub referencing_versions: u64,
}

/// Body of the response of `GET /v1/operator/keks/stats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KekStatsResponse {
    /// Per-KEK statistics.
    pub keks: Vec<KekStatEntry>,
}

/// Body of the response of `GET /v1/operator/keks/current`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentKekResponse {
    /// The currently active KEK id.
    pub current: KekId,
    /// The current RMK version.
    pub rmk_version: RmkVersion,
}

/// Body of the response of `POST /v1/operator/keks/rotate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotateKekResponse {
    /// The KEK that moved to grace.
    pub previous: KekId,
    /// The freshly created active KEK.
    pub current: KekId,
}

/// Body of the response of `POST /v1/operator/rmk/rotate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotateRmkResponse {
    /// The RMK version before rotation.
    pub old_version: RmkVersion,
    /// The RMK version after rotation.
    pub new_version: RmkVersion,
}

/// Minimal in-body error tag used across all endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A short machine-readable error label.
    pub err: String,
}

impl ErrorBody {
    /// Creates an error body from a label.
    pub fn new(err: impl Into<String>) -> Self {
        Self { err: err.into() }
    }
}
