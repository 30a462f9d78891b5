//! Deterministic derivation of Key Encryption Keys from the Root Master Key.
//!
//! `KEK = HKDF-SHA256(ikm = RMK, salt = metadata.salt,
//! info = "spike:kek:v1:" || kek_id, length = 32)`.
//!
//! Same inputs always yield the same KEK. RMK rotation relies on exactly
//! this property: rewrapping KEK metadata under a new RMK reference must
//! not change any derived key, so derivation is a pure function of
//! `(rmk, salt, kek_id)` and nothing else.

use hkdf::Hkdf;
use sha2::Sha256;
use spike_types::KekId;
use spike_types::crypto::{KEY_LEN, Kek, RootKey};
use spike_types::error::SpikeError;

/// Domain-separation prefix of the HKDF info parameter.
///
/// Part of the on-disk format: every persisted wrapped DEK depends on it.
const KEK_INFO_PREFIX: &[u8] = b"spike:kek:v1:";

/// HKDF info of the metadata-column key.
///
/// The `secret_metadata` schema stores no key id, so its cipher key must be
/// derivable from the RMK alone. Part of the on-disk format.
const METADATA_INFO: &[u8] = b"spike:metadata:v1";

/// Derives the 32-byte KEK identified by `kek_id` from the RMK and salt.
///
/// # Errors
///
/// Returns [`SpikeError::CryptoEncryptionFailed`] if HKDF expansion fails
/// (cannot happen for 32-byte outputs, kept for contract completeness).
pub fn derive_kek(rmk: &RootKey, salt: &[u8], kek_id: &KekId) -> Result<Kek, SpikeError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), rmk.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand_multi_info(&[KEK_INFO_PREFIX, kek_id.as_str().as_bytes()], &mut okm)
        .map_err(|_| SpikeError::CryptoEncryptionFailed)?;
    Ok(Kek::from_bytes(okm))
}

/// Derives the key the per-field encrypted metadata columns use.
///
/// Also the cipher key of pre-envelope (legacy) secret rows, which carry
/// neither a `kek_id` nor a wrapped DEK.
pub fn derive_metadata_key(rmk: &RootKey) -> Result<Kek, SpikeError> {
    let hk = Hkdf::<Sha256>::new(None, rmk.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(METADATA_INFO, &mut okm)
        .map_err(|_| SpikeError::CryptoEncryptionFailed)?;
    Ok(Kek::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let rmk = RootKey::from_bytes([0xAA; 32]);
        let salt = [0xBB; 32];
        let kek_id = KekId::new("v1-2025-01");

        let first = derive_kek(&rmk, &salt, &kek_id).expect("derivation succeeds");
        let second = derive_kek(&rmk, &salt, &kek_id).expect("derivation succeeds");
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn derivation_separates_inputs() {
        let rmk = RootKey::from_bytes([0xAA; 32]);
        let other_rmk = RootKey::from_bytes([0xAB; 32]);
        let salt = [0xBB; 32];
        let kek_id = KekId::new("v1-2025-01");

        let base = derive_kek(&rmk, &salt, &kek_id).expect("derivation succeeds");
        for other in [
            derive_kek(&other_rmk, &salt, &kek_id).expect("derivation succeeds"),
            derive_kek(&rmk, &[0xBC; 32], &kek_id).expect("derivation succeeds"),
            derive_kek(&rmk, &salt, &KekId::new("v2-2025-02")).expect("derivation succeeds"),
        ] {
            assert_ne!(base.as_bytes(), other.as_bytes());
        }
    }
}
