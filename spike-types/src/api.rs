//! # API module
//!
//! Entry point for all API version modules.
//!
//! Currently exposes the version 1 SPIKE API types under [`v1`], the
//! decrypted secret model shared between the storage engine and the wire,
//! and a base64 serde helper for binary fields crossing the HTTP surface.

use std::collections::{BTreeMap, HashMap};

use http::HeaderName;
use serde::{Deserialize, Serialize};

pub mod v1;

/// The name of the header carrying the verified peer SPIFFE ID in
/// deployments where TLS termination happens in front of the service.
pub static PEER_IDENTITY_HEADER: HeaderName = HeaderName::from_static("x-spike-peer-id");

/// Serde helper serializing byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes bytes as a base64 string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserializes a base64 string into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// The decrypted metadata of a secret path — the visible portion of the
/// per-path model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    /// The newest version number, or 0 for a shell secret.
    pub current_version: u32,
    /// The oldest retained version number, or 0 for a shell secret.
    pub oldest_version: u32,
    /// When the path was first written.
    pub created_time: chrono::DateTime<chrono::Utc>,
    /// When the path was last written.
    pub updated_time: chrono::DateTime<chrono::Utc>,
    /// How many versions to retain before pruning the oldest.
    pub max_versions: u32,
}

/// One decrypted secret version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecretVersion {
    /// The key→value map of this version.
    pub data: HashMap<String, String>,
    /// When this version was written.
    pub created_time: chrono::DateTime<chrono::Utc>,
    /// When this version was soft-deleted, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// A fully decrypted secret: metadata plus its versions, keyed by version
/// number. Returned values are read-only to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// The secret path.
    pub path: String,
    /// The decrypted per-path metadata.
    pub metadata: SecretMetadata,
    /// The decrypted versions.
    pub versions: BTreeMap<u32, SecretVersion>,
}
