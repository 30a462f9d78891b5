//! Threshold (Shamir) secret sharing of the Root Master Key.
//!
//! Shares live in the P-256 scalar field, a prime-order group with a
//! canonical fixed-width big-endian serialization. A share is the pair
//! `(id, value)` where `id` is the evaluation point (the 1-based position
//! of the Keeper in the lexicographically sorted peer-id list) and `value`
//! is the polynomial evaluated at that point. Reconstruction is Lagrange
//! interpolation at x = 0.
//!
//! Splitting can be driven by [`deterministic_rng`], a pseudo-random stream
//! with a fixed seed: every Keeper that folds the same contributions then
//! computes the identical share tuple and can pick its own indexed share
//! without further coordination.
//!
//! Secret state wrappers purposefully do not implement `Debug` to avoid
//! accidental leakage.

use p256::elliptic_curve::ff::{Field as _, PrimeField as _};
use p256::elliptic_curve::ops::Reduce;
use p256::{FieldBytes, Scalar, U256};
use rand::SeedableRng as _;
use rand::{CryptoRng, Rng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest as _, Sha256};
use spike_types::crypto::{RootKey, Shard};
use spike_types::error::SpikeError;

/// The fixed byte string whose SHA-256 digest seeds deterministic splitting.
///
/// All Keepers share this constant so they evaluate the same polynomial;
/// changing it breaks agreement with every share already persisted.
const SPLIT_SEED_INPUT: &[u8] = b"42";

/// One Shamir share: the evaluation point and the polynomial value.
#[derive(Clone, PartialEq, Eq)]
pub struct ShamirShare {
    id: Scalar,
    value: Scalar,
}

impl Drop for ShamirShare {
    fn drop(&mut self) {
        // the id is public, the value is key material
        self.value = Scalar::ZERO;
    }
}

impl ShamirShare {
    /// Reassembles a share from its canonical 32-byte big-endian encodings.
    ///
    /// # Errors
    ///
    /// Returns [`SpikeError::CryptoRecoverFailed`] if either encoding is not
    /// a canonical scalar.
    pub fn from_bytes(id: &[u8; 32], value: &[u8; 32]) -> Result<Self, SpikeError> {
        let id = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(*id)))
            .ok_or(SpikeError::CryptoRecoverFailed)?;
        let value = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(*value)))
            .ok_or(SpikeError::CryptoRecoverFailed)?;
        Ok(Self { id, value })
    }

    /// Reassembles a Keeper's share from its sorted peer index and the
    /// 32-byte shard value it serves.
    pub fn from_indexed_shard(index: usize, shard: &Shard) -> Result<Self, SpikeError> {
        let value = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(*shard.as_bytes())))
            .ok_or(SpikeError::CryptoRecoverFailed)?;
        Ok(Self {
            id: share_id(index),
            value,
        })
    }

    /// The canonical 32-byte big-endian encoding of the share id.
    pub fn id_bytes(&self) -> [u8; 32] {
        self.id.to_repr().into()
    }

    /// The canonical 32-byte big-endian encoding of the share value.
    ///
    /// **Note**: use with care! The value is key material.
    pub fn value_bytes(&self) -> [u8; 32] {
        self.value.to_repr().into()
    }

    /// Converts the share value into the wire [`Shard`] buffer.
    pub fn to_shard(&self) -> Shard {
        Shard::from_bytes(self.value_bytes())
    }
}

/// The share id for a Keeper at the given 0-based sorted peer index.
pub fn share_id(index: usize) -> Scalar {
    Scalar::from(index as u64 + 1)
}

/// A pseudo-random stream with a fixed seed for deterministic splitting.
pub fn deterministic_rng() -> ChaCha20Rng {
    let seed: [u8; 32] = Sha256::digest(SPLIT_SEED_INPUT).into();
    ChaCha20Rng::from_seed(seed)
}

/// Evaluates the polynomial with the provided coefficients at `x` (Horner).
fn evaluate_poly(coeffs: &[Scalar], x: Scalar) -> Scalar {
    let mut acc = Scalar::ZERO;
    for coeff in coeffs.iter().rev() {
        acc = acc * x + coeff;
    }
    acc
}

/// Splits a 32-byte secret into `count` shares with threshold `threshold`.
///
/// Reconstruction needs `threshold + 1` shares. The secret is mapped into
/// the scalar field by reduction; for uniformly random 32-byte secrets the
/// bias is negligible and the reduced value is what recovery returns.
///
/// # Errors
///
/// Returns [`SpikeError::EntityInvalid`] if `count < threshold + 1`.
pub fn split<R: Rng + CryptoRng>(
    secret: &RootKey,
    threshold: usize,
    count: usize,
    rng: &mut R,
) -> Result<Vec<ShamirShare>, SpikeError> {
    if count < threshold + 1 {
        return Err(SpikeError::EntityInvalid(format!(
            "cannot split into {count} shares with threshold {threshold}"
        )));
    }
    let secret_scalar =
        <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*secret.as_bytes()));

    let mut coeffs = Vec::with_capacity(threshold + 1);
    coeffs.push(secret_scalar);
    for _ in 0..threshold {
        coeffs.push(Scalar::random(&mut *rng));
    }

    let shares = (0..count)
        .map(|index| {
            let id = share_id(index);
            ShamirShare {
                id,
                value: evaluate_poly(&coeffs, id),
            }
        })
        .collect();

    for coeff in coeffs.iter_mut() {
        *coeff = Scalar::ZERO;
    }
    Ok(shares)
}

/// Reconstructs the secret from at least `threshold + 1` shares via
/// Lagrange interpolation at x = 0.
///
/// # Errors
///
/// Returns [`SpikeError::CryptoRecoverFailed`] if too few shares are
/// provided or the share ids are not pairwise distinct.
pub fn recover(shares: &[ShamirShare], threshold: usize) -> Result<RootKey, SpikeError> {
    if shares.len() < threshold + 1 {
        return Err(SpikeError::CryptoRecoverFailed);
    }
    let used = &shares[..threshold + 1];

    let mut secret = Scalar::ZERO;
    for (i, share) in used.iter().enumerate() {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for (j, other) in used.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator *= other.id;
            denominator *= other.id - share.id;
        }
        let denominator_inv = Option::<Scalar>::from(denominator.invert())
            .ok_or(SpikeError::CryptoRecoverFailed)?;
        secret += share.value * numerator * denominator_inv;
    }

    Ok(RootKey::from_bytes(secret.to_repr().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools as _;

    fn roundtrip(secret_byte: u8, threshold: usize, count: usize) {
        let secret = RootKey::from_bytes([secret_byte; 32]);
        let shares = split(&secret, threshold, count, &mut rand::thread_rng())
            .expect("valid parameters");
        assert_eq!(shares.len(), count);

        // every subset of size threshold + 1 reconstructs the secret
        for subset in shares.iter().cloned().combinations(threshold + 1) {
            let recovered = recover(&subset, threshold).expect("enough shares");
            assert_eq!(recovered.as_bytes(), secret.as_bytes());
        }
    }

    #[test]
    fn split_recover_3_1() {
        roundtrip(0x07, 1, 3);
    }

    #[test]
    fn split_recover_5_2() {
        roundtrip(0x42, 2, 5);
    }

    #[test]
    fn too_few_shares_fail() {
        let secret = RootKey::from_bytes([0x11; 32]);
        let shares =
            split(&secret, 1, 3, &mut rand::thread_rng()).expect("valid parameters");
        let err = recover(&shares[..1], 1).expect_err("one share is below threshold + 1");
        assert!(matches!(err, SpikeError::CryptoRecoverFailed));
    }

    #[test]
    fn count_below_threshold_rejected() {
        let secret = RootKey::from_bytes([0x11; 32]);
        let err = split(&secret, 2, 2, &mut rand::thread_rng())
            .expect_err("2 shares cannot carry threshold 2");
        assert!(matches!(err, SpikeError::EntityInvalid(_)));
    }

    #[test]
    fn deterministic_split_is_identical_across_processes() {
        let secret = RootKey::from_bytes([0x07; 32]);
        let a = split(&secret, 1, 3, &mut deterministic_rng()).expect("valid parameters");
        let b = split(&secret, 1, 3, &mut deterministic_rng()).expect("valid parameters");
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id_bytes(), y.id_bytes());
            assert_eq!(x.value_bytes(), y.value_bytes());
        }
    }

    #[test]
    fn shard_roundtrip_via_sorted_index() {
        let secret = RootKey::from_bytes([0xA5; 32]);
        let shares = split(&secret, 1, 3, &mut deterministic_rng()).expect("valid parameters");

        // a recovery peer sees only (index, shard-value) pairs
        let reassembled: Vec<ShamirShare> = shares
            .iter()
            .enumerate()
            .map(|(index, share)| {
                ShamirShare::from_indexed_shard(index, &share.to_shard())
                    .expect("canonical value")
            })
            .collect();
        let recovered = recover(&reassembled[1..], 1).expect("two shares suffice");
        assert_eq!(recovered.as_bytes(), secret.as_bytes());
    }
}
