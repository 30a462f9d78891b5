//! The AES-256-GCM envelope codec.
//!
//! Each secret version is encrypted with a fresh random Data Encryption Key
//! (DEK); the DEK is wrapped under the current Key Encryption Key (KEK)
//! with its own fresh nonce and empty AAD. Rewrapping moves a DEK to a new
//! KEK without touching the version ciphertext or its nonce.
//!
//! Metadata rows encrypt five scalar fields under one fresh random base
//! nonce combined with a fixed per-field salt (`base XOR salt`). The salts
//! are distinct 12-byte ASCII constants and part of the on-disk format:
//! derived nonces differ pairwise within a row and stay uniformly random
//! across rows.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::{CryptoRng, Rng, RngCore};
use spike_types::crypto::{Dek, KEY_LEN, Kek};
use spike_types::error::SpikeError;
use spike_types::{AeadAlg, KekId};

/// Nonce length of the only supported cipher.
pub const NONCE_LEN: usize = 12;

/// Per-field nonce salt for `current_version`.
pub const FIELD_SALT_CURRENT_VERSION: [u8; NONCE_LEN] = *b"cur_version ";
/// Per-field nonce salt for `oldest_version`.
pub const FIELD_SALT_OLDEST_VERSION: [u8; NONCE_LEN] = *b"old_version ";
/// Per-field nonce salt for `created_time`.
pub const FIELD_SALT_CREATED_TIME: [u8; NONCE_LEN] = *b"created_time";
/// Per-field nonce salt for `updated_time`.
pub const FIELD_SALT_UPDATED_TIME: [u8; NONCE_LEN] = *b"updated_time";
/// Per-field nonce salt for `max_versions`.
pub const FIELD_SALT_MAX_VERSIONS: [u8; NONCE_LEN] = *b"max_versions";

/// A DEK wrapped under a KEK, together with everything needed to unwrap it.
#[derive(Clone)]
pub struct WrappedDek {
    /// The AEAD ciphertext of the 32-byte DEK.
    pub wrapped: Vec<u8>,
    /// The fresh nonce used for the wrap.
    pub nonce: [u8; NONCE_LEN],
    /// The id of the wrapping KEK.
    pub kek_id: KekId,
    /// The algorithm the wrap used.
    pub aead_alg: AeadAlg,
}

fn cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm, SpikeError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| SpikeError::CryptoEncryptionFailed)
}

/// Draws a fresh random 12-byte nonce.
pub fn random_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    nonce
}

/// Generates a fresh random DEK.
pub fn generate_dek<R: Rng + CryptoRng>(rng: &mut R) -> Dek {
    let mut bytes = [0u8; KEY_LEN];
    rng.fill_bytes(&mut bytes);
    Dek::from_bytes(bytes)
}

/// AEAD-encrypts `plaintext` under the given key, nonce, and AAD.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SpikeError> {
    cipher(key)?
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SpikeError::CryptoEncryptionFailed)
}

/// AEAD-decrypts `ciphertext` under the given key, nonce, and AAD.
///
/// # Errors
///
/// Returns [`SpikeError::CryptoNonceSizeMismatch`] for a malformed stored
/// nonce and [`SpikeError::CryptoDecryptionFailed`] for any AEAD failure.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SpikeError> {
    let nonce: &[u8; NONCE_LEN] =
        nonce
            .try_into()
            .map_err(|_| SpikeError::CryptoNonceSizeMismatch {
                expected: NONCE_LEN,
                actual: nonce.len(),
            })?;
    cipher(key)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SpikeError::CryptoDecryptionFailed)
}

/// Wraps a DEK under a KEK with a fresh nonce and empty AAD.
pub fn wrap_dek<R: Rng + CryptoRng>(
    dek: &Dek,
    kek: &Kek,
    kek_id: &KekId,
    rng: &mut R,
) -> Result<WrappedDek, SpikeError> {
    let nonce = random_nonce(rng);
    let wrapped = seal(kek.as_bytes(), &nonce, dek.as_bytes(), &[])?;
    Ok(WrappedDek {
        wrapped,
        nonce,
        kek_id: kek_id.clone(),
        aead_alg: AeadAlg::Aes256Gcm,
    })
}

/// Unwraps a DEK from its ciphertext under the resolving KEK.
pub fn unwrap_dek(wrapped: &[u8], nonce: &[u8], kek: &Kek) -> Result<Dek, SpikeError> {
    let plaintext = open(kek.as_bytes(), nonce, wrapped, &[])?;
    Dek::from_slice(&plaintext).map_err(|_| SpikeError::CryptoDecryptionFailed)
}

/// Moves a wrapped DEK from `old_kek` to `new_kek` without touching the
/// secret ciphertext.
pub fn rewrap_dek<R: Rng + CryptoRng>(
    wrapped: &[u8],
    nonce: &[u8],
    old_kek: &Kek,
    new_kek: &Kek,
    new_kek_id: &KekId,
    rng: &mut R,
) -> Result<WrappedDek, SpikeError> {
    let dek = unwrap_dek(wrapped, nonce, old_kek)?;
    wrap_dek(&dek, new_kek, new_kek_id, rng)
}

/// Derives a per-field nonce as `base XOR salt`.
///
/// # Errors
///
/// Returns [`SpikeError::CryptoNonceSizeMismatch`] if the stored base nonce
/// does not match the cipher's nonce size.
pub fn derive_field_nonce(
    base: &[u8],
    salt: &[u8; NONCE_LEN],
) -> Result<[u8; NONCE_LEN], SpikeError> {
    let base: &[u8; NONCE_LEN] =
        base.try_into()
            .map_err(|_| SpikeError::CryptoNonceSizeMismatch {
                expected: NONCE_LEN,
                actual: base.len(),
            })?;
    let mut out = [0u8; NONCE_LEN];
    for (o, (b, s)) in out.iter_mut().zip(base.iter().zip(salt.iter())) {
        *o = b ^ s;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let dek = Dek::from_bytes([0xCC; 32]);
        let kek = Kek::from_bytes([0xDD; 32]);
        let kek_id = KekId::new("k");

        let wrapped = wrap_dek(&dek, &kek, &kek_id, &mut rand::thread_rng())
            .expect("wrap succeeds");
        assert_eq!(wrapped.kek_id, kek_id);
        assert_eq!(wrapped.aead_alg, AeadAlg::Aes256Gcm);

        let unwrapped =
            unwrap_dek(&wrapped.wrapped, &wrapped.nonce, &kek).expect("unwrap succeeds");
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn unwrap_under_wrong_kek_fails() {
        let dek = Dek::from_bytes([0xCC; 32]);
        let kek = Kek::from_bytes([0xDD; 32]);
        let wrapped = wrap_dek(&dek, &kek, &KekId::new("k"), &mut rand::thread_rng())
            .expect("wrap succeeds");

        let err = unwrap_dek(&wrapped.wrapped, &wrapped.nonce, &Kek::from_bytes([0xDE; 32]))
            .expect_err("wrong key must fail");
        assert!(matches!(err, SpikeError::CryptoDecryptionFailed));
    }

    #[test]
    fn rewrap_preserves_the_dek() {
        let mut rng = rand::thread_rng();
        let dek = generate_dek(&mut rng);
        let old_kek = Kek::from_bytes([0x01; 32]);
        let new_kek = Kek::from_bytes([0x02; 32]);
        let new_id = KekId::new("v2-2025-02");

        let wrapped = wrap_dek(&dek, &old_kek, &KekId::new("v1-2025-01"), &mut rng)
            .expect("wrap succeeds");
        let rewrapped = rewrap_dek(
            &wrapped.wrapped,
            &wrapped.nonce,
            &old_kek,
            &new_kek,
            &new_id,
            &mut rng,
        )
        .expect("rewrap succeeds");

        assert_eq!(rewrapped.kek_id, new_id);
        let unwrapped = unwrap_dek(&rewrapped.wrapped, &rewrapped.nonce, &new_kek)
            .expect("unwrap under new kek");
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn open_rejects_bad_nonce_size() {
        let key = [0u8; 32];
        let err = open(&key, &[0u8; 11], b"", &[]).expect_err("11-byte nonce");
        assert!(matches!(
            err,
            SpikeError::CryptoNonceSizeMismatch {
                expected: 12,
                actual: 11
            }
        ));
    }

    #[test]
    fn open_authenticates_aad() {
        let key = [0x33; 32];
        let nonce = [0x44; 12];
        let sealed = seal(&key, &nonce, b"payload", b"row:1").expect("seal succeeds");
        assert!(open(&key, &nonce, &sealed, b"row:1").is_ok());
        let err = open(&key, &nonce, &sealed, b"row:2").expect_err("aad mismatch");
        assert!(matches!(err, SpikeError::CryptoDecryptionFailed));
    }

    #[test]
    fn field_salts_are_pairwise_distinct() {
        let salts = [
            FIELD_SALT_CURRENT_VERSION,
            FIELD_SALT_OLDEST_VERSION,
            FIELD_SALT_CREATED_TIME,
            FIELD_SALT_UPDATED_TIME,
            FIELD_SALT_MAX_VERSIONS,
        ];
        for (i, a) in salts.iter().enumerate() {
            for b in salts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn field_nonces_differ_within_a_row() {
        let base = random_nonce(&mut rand::thread_rng());
        let n1 = derive_field_nonce(&base, &FIELD_SALT_CURRENT_VERSION).expect("12 bytes");
        let n2 = derive_field_nonce(&base, &FIELD_SALT_OLDEST_VERSION).expect("12 bytes");
        assert_ne!(n1, n2);

        let err = derive_field_nonce(&base[..8], &FIELD_SALT_CURRENT_VERSION)
            .expect_err("short base nonce");
        assert!(matches!(err, SpikeError::CryptoNonceSizeMismatch { .. }));
    }
}
