//! Folding Keeper contributions into the Root Master Key.

use spike_types::crypto::{Contribution, KEY_LEN, RootKey};

/// Computes the RMK as the bitwise XOR of all peer contributions.
///
/// The fold is order-independent, so Keepers may receive contributions in
/// any order and still agree on the result.
pub fn fold_contributions<'a>(contributions: impl IntoIterator<Item = &'a Contribution>) -> RootKey {
    let mut out = [0u8; KEY_LEN];
    for contribution in contributions {
        for (o, b) in out.iter_mut().zip(contribution.as_bytes()) {
            *o ^= b;
        }
    }
    RootKey::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_xor_and_order_independent() {
        let a = Contribution::from_bytes([0x01; 32]);
        let b = Contribution::from_bytes([0x02; 32]);
        let c = Contribution::from_bytes([0x04; 32]);

        let rmk = fold_contributions([&a, &b, &c]);
        assert_eq!(rmk.as_bytes(), &[0x07; 32]);

        let rmk_rev = fold_contributions([&c, &a, &b]);
        assert_eq!(rmk, rmk_rev);
    }

    #[test]
    fn fold_of_nothing_is_zero() {
        let rmk = fold_contributions([]);
        assert!(rmk.is_all_zero());
    }
}
