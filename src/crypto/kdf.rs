//! Deterministic passphrase → X25519 recipient derivation.
//!
//! Security-sensitive public contract (see design spec §9): the salt and
//! scrypt cost parameters are fixed and versioned. Any future change to
//! either requires a new `AGE_KDF_VERSION` and an explicit migration path —
//! do not tune these in place.

use crate::error::{CryptoError, Result};
use scrypt::Params;

pub const AGE_KDF_VERSION: u32 = 1;
const SALT: &[u8] = b"proxsave-v1";
const LOG_N: u8 = 17; // N = 2^17
const R: u32 = 8;
const P: u32 = 1;
const KEY_LEN: usize = 32;

/// Derives a 32-byte X25519 scalar from a passphrase via
/// `scrypt(passphrase, salt="proxsave-v1", N=2^17, r=8, p=1, keyLen=32)`,
/// then clamps it per the X25519 curve convention so it is a valid scalar.
pub fn derive_x25519_scalar(passphrase: &str) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(LOG_N, R, P, KEY_LEN).map_err(|_| CryptoError::KeyDerivation)?;
    let mut out = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase.as_bytes(), SALT, &params, &mut out)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(clamp_scalar(out))
}

/// Applies the standard X25519 clamping operation to a raw 32-byte scalar.
fn clamp_scalar(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = derive_x25519_scalar("correct horse battery staple").unwrap();
        let b = derive_x25519_scalar("correct horse battery staple").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_passphrases_differ() {
        let a = derive_x25519_scalar("passphrase-one").unwrap();
        let b = derive_x25519_scalar("passphrase-two").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn clamping_invariants_hold() {
        let scalar = derive_x25519_scalar("any passphrase").unwrap();
        assert_eq!(scalar[0] & 0b0000_0111, 0);
        assert_eq!(scalar[31] & 0b1000_0000, 0);
        assert_eq!(scalar[31] & 0b0100_0000, 0b0100_0000);
    }
}
