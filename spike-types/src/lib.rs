#![deny(missing_docs)]
//! Core type definitions for the SPIKE secret-custody system.
//!
//! This crate groups together the strongly-typed values and message
//! structures shared by the Keeper and Nexus services. It provides:
//!
//! * Thin wrappers around primitive values such as keeper identifiers,
//!   KEK identifiers and root-key versions, with consistent serialization
//!   and display implementations.
//! * Sensitive byte-buffer types that zeroize on drop (see [`crypto`]).
//! * The typed error kinds surfaced by the core (see [`error`]).
//! * The peer-identity gate over SPIFFE IDs (see [`auth`]).
//! * API versioned types for service communication (see [`api`]).
//!
//! Use these types to pass, store, and (de)serialize identifiers and
//! cryptographic values in a type-safe way throughout your application.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod api;
pub mod auth;
pub mod crypto;
pub mod error;

/// The identifier of a Keeper instance, as used in the peer map.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeeperId(String);

/// The identifier of a Key Encryption Key, formatted `vN-YYYY-MM`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KekId(String);

/// The version of the Root Master Key. Starts at 1 and only grows.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RmkVersion(u32);

/// Lifecycle status of a KEK.
///
/// Exactly one KEK is `Active` at any time. A rotated-out KEK moves to
/// `Grace` (still readable, secrets get rewrapped off it) and finally to
/// `Retired` once nothing references it anymore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KekStatus {
    /// The KEK new writes wrap DEKs under.
    Active,
    /// Rotated out but still readable.
    Grace,
    /// No longer referenced by any live secret version.
    Retired,
}

/// The AEAD algorithm a secret version was sealed with.
///
/// Stored per version to support later algorithm agility; AES-256-GCM is
/// the only algorithm currently written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlg {
    /// AES-256-GCM with 12-byte nonces.
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl KeeperId {
    /// Creates a new `KeeperId` by wrapping a `String`.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl KekId {
    /// Creates a new `KekId` by wrapping a `String`.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RmkVersion {
    /// The first valid version.
    pub const INITIAL: Self = Self(1);

    /// Creates a new `RmkVersion` by wrapping a `u32`.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Converts the version to a `u32`.
    pub fn into_inner(self) -> u32 {
        self.0
    }

    /// Returns the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl AeadAlg {
    /// Stable on-disk label of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            AeadAlg::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Parses the stable on-disk label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aes-256-gcm" => Some(AeadAlg::Aes256Gcm),
            _ => None,
        }
    }
}

impl KekStatus {
    /// Stable on-disk label of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            KekStatus::Active => "active",
            KekStatus::Grace => "grace",
            KekStatus::Retired => "retired",
        }
    }

    /// Parses the stable on-disk label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(KekStatus::Active),
            "grace" => Some(KekStatus::Grace),
            "retired" => Some(KekStatus::Retired),
            _ => None,
        }
    }
}

impl From<String> for KeeperId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for KeeperId {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(value.to_owned()))
    }
}

impl From<&str> for KeeperId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for KekId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for KekId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for KeeperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for KekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RmkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

impl fmt::Display for KekStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of a single KEK, one row per KEK.
///
/// The derived key itself is never part of the metadata; it is recomputed
/// from the RMK and `salt` on demand (see the KEK manager in spike-nexus).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KekMetadata {
    /// The KEK id, `vN-YYYY-MM`.
    pub id: KekId,
    /// Monotonic version, 1-based.
    pub version: u32,
    /// The 32-byte HKDF salt. Public material.
    #[serde(with = "api::base64_bytes")]
    pub salt: Vec<u8>,
    /// The RMK version this KEK was last derived under.
    pub rmk_version: RmkVersion,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Retirement timestamp, if retired.
    pub retired_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Number of DEK wraps performed under this KEK. Monotonic until rotation.
    pub wraps_count: i64,
    /// Lifecycle status.
    pub status: KekStatus,
}
