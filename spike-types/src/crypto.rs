//! Sensitive byte-buffer types shared across the SPIKE services.
//!
//! All key material in SPIKE is 32 bytes: Keeper entropy contributions, the
//! Root Master Key folded from them, Shamir share values, and the derived
//! KEK/DEK symmetric keys. Each gets its own wrapper so ownership crossing
//! a boundary is visible in signatures, and each wipes its buffer on drop.
//!
//! Secret wrappers purposefully do not implement `Debug` or `Display` to
//! avoid accidental leakage.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SpikeError;

/// Length in bytes of every key buffer in the system.
pub const KEY_LEN: usize = 32;

macro_rules! key_buffer {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            /// Wraps the provided bytes, taking ownership.
            pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            /// Wraps a byte slice, which must be exactly 32 bytes long.
            ///
            /// # Errors
            ///
            /// Returns [`SpikeError::EntityInvalid`] on a length mismatch.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, SpikeError> {
                let arr: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| SpikeError::EntityInvalid(format!(
                        "expected {KEY_LEN} bytes, got {}",
                        bytes.len()
                    )))?;
                Ok(Self(arr))
            }

            /// Borrows the raw bytes.
            ///
            /// **Note**: use with care! The bytes are sensitive data.
            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            /// Returns `true` iff every byte is zero.
            pub fn is_all_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                crate::api::base64_bytes::serialize(&self.0, serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = crate::api::base64_bytes::deserialize(deserializer)?;
                Self::from_slice(&bytes).map_err(serde::de::Error::custom)
            }
        }
    };
}

key_buffer!(
    /// 32 bytes of uniformly random entropy produced once per Keeper process.
    ///
    /// Cached for the process lifetime and never persisted.
    Contribution
);

key_buffer!(
    /// The Root Master Key: the bitwise XOR of all peer contributions.
    ///
    /// Held only in memory, by a Keeper during bootstrap and by Nexus after
    /// recovery.
    RootKey
);

key_buffer!(
    /// One Shamir share value as served by a Keeper.
    ///
    /// The share id is implied by the Keeper's position in the sorted
    /// peer-id list and is not part of the wire value.
    Shard
);

key_buffer!(
    /// A derived 32-byte Key Encryption Key.
    Kek
);

key_buffer!(
    /// A random per-secret-version Data Encryption Key.
    Dek
);
