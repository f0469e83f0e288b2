//! Blinded subkey derivation.
//!
//! Hidden-service introsets are signed with per-epoch subkeys derived
//! from the root identity by a public blinding factor
//! `h = H(domain ‖ root ‖ n)` reduced mod l. Anyone can compute the
//! blinded public key from the root; only the key owner can produce the
//! matching private scalar.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, Scalar};
use ed25519_dalek::hazmat::ExpandedSecretKey;
use ed25519_dalek::VerifyingKey;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::keys::SigningKeypair;
use crate::{CryptoError, CryptoResult};

const DERIVE_DOMAIN: &[u8] = b"veilnet-derived-key";

type Blake2b256 = Blake2b<U32>;

/// Private half of a blinded subkey, with the signing hash the derived
/// path needs since there is no seed to expand.
pub struct DerivedSigningKey {
    pub(crate) scalar: Scalar,
    pub(crate) hash_prefix: [u8; 32],
    pub(crate) verifying_key: VerifyingKey,
}

impl DerivedSigningKey {
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

fn blinding_factor(root: &[u8; 32], n: u64) -> Scalar {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, DERIVE_DOMAIN);
    Digest::update(&mut hasher, root);
    Digest::update(&mut hasher, &n.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Scalar::from_bytes_mod_order(digest)
}

/// Blind the root public key for index `n`: `A' = h·A`.
pub fn derive_subkey(root: &[u8; 32], n: u64) -> CryptoResult<[u8; 32]> {
    let point = CompressedEdwardsY(*root)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidInput("root key is not a curve point".into()))?;
    let h = blinding_factor(root, n);
    let blinded: EdwardsPoint = point * h;
    Ok(blinded.compress().to_bytes())
}

/// Blind the root private key for index `n`: scalar `h·a` with a signing
/// hash bound to both `h` and the root's own hash prefix.
pub fn derive_subkey_private(root: &SigningKeypair, n: u64) -> CryptoResult<DerivedSigningKey> {
    let root_pub = root.public_key_bytes();
    let h = blinding_factor(&root_pub, n);

    let secret = root.signing_key.to_bytes();
    let expanded = ExpandedSecretKey::from(&secret);
    let scalar = expanded.scalar * h;

    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, h.as_bytes());
    Digest::update(&mut hasher, &expanded.hash_prefix);
    let hash_prefix: [u8; 32] = hasher.finalize().into();

    let public = EdwardsPoint::mul_base(&scalar).compress();
    let verifying_key = VerifyingKey::from_bytes(&public.to_bytes())
        .map_err(|e| CryptoError::Primitive(format!("derived key invalid: {e}")))?;

    Ok(DerivedSigningKey {
        scalar,
        hash_prefix,
        verifying_key,
    })
}
