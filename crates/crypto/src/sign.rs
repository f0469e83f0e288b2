use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signer, Verifier, VerifyingKey};
use sha2::Sha512;

use veilnet_core::Signature;

use crate::keys::SigningKeypair;
use crate::subkey::DerivedSigningKey;

/// Detached Ed25519 signature over `message`.
pub fn sign(keys: &SigningKeypair, message: &[u8]) -> Signature {
    Signature(keys.signing_key.sign(message).to_bytes())
}

/// Sign with a blinded subkey. Derived scalars have no recoverable seed,
/// so this goes through the expanded-key path with the derivation's own
/// hash prefix instead of re-hashing a seed.
pub fn sign_derived(keys: &DerivedSigningKey, message: &[u8]) -> Signature {
    let esk = ExpandedSecretKey {
        scalar: keys.scalar,
        hash_prefix: keys.hash_prefix,
    };
    Signature(raw_sign::<Sha512>(&esk, message, &keys.verifying_key).to_bytes())
}

/// Verify a detached signature under a 32-byte public key. Malformed
/// public keys simply fail verification.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    vk.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = SigningKeypair::generate();
        let sig = sign(&keys, b"record");
        assert!(verify(&keys.public_key_bytes(), b"record", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_message() {
        let keys = SigningKeypair::generate();
        let sig = sign(&keys, b"record");
        assert!(!verify(&keys.public_key_bytes(), b"other", &sig));
    }

    #[test]
    fn test_verify_rejects_malformed_public_key() {
        let keys = SigningKeypair::generate();
        let sig = sign(&keys, b"record");
        // not a valid curve point
        let bogus = [0xff; 32];
        assert!(!verify(&bogus, b"record", &sig));
    }

    #[test]
    fn test_verify_rejects_corrupted_signature() {
        let keys = SigningKeypair::generate();
        let mut sig = sign(&keys, b"record");
        sig.0[3] ^= 0x80;
        assert!(!verify(&keys.public_key_bytes(), b"record", &sig));
    }
}
