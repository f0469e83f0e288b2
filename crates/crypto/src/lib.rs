//! Veilnet Cryptography
//!
//! Primitives for the path subsystem: tunnel Diffie-Hellman with
//! public-key mixing, Blake2b hashing and keyed MACs, the XChaCha20
//! relay stream, Ed25519 identity signatures (including the derived-key
//! path), the post-quantum KEM used in build records, blinded subkey
//! derivation, and the CSPRNG helpers.
//!
//! Everything hangs off an injectable [`Crypto`] handle; there is no
//! process-wide crypto state.

mod dh;
mod error;
mod hash;
mod kem;
mod keys;
mod rand_source;
mod sign;
mod stream;
mod subkey;

pub use dh::*;
pub use error::*;
pub use kem::*;
pub use keys::*;
pub use rand_source::*;
pub use sign::*;
pub use subkey::*;

use veilnet_core::{SharedSecret, ShortHash, Signature, TunnelNonce};

/// Handle for all cryptographic operations. Constructed once by the host
/// and passed by reference; tests may build their own.
#[derive(Default)]
pub struct Crypto;

impl Crypto {
    pub fn new() -> Self {
        Crypto
    }

    /// Path-build DH, client side.
    pub fn dh_client(
        &self,
        their_pub: &[u8; 32],
        our_sec: &EncryptionKeypair,
        nonce: &TunnelNonce,
    ) -> CryptoResult<SharedSecret> {
        dh::dh_client(their_pub, our_sec, nonce)
    }

    /// Path-build DH, relay side.
    pub fn dh_server(
        &self,
        their_pub: &[u8; 32],
        our_sec: &EncryptionKeypair,
        nonce: &TunnelNonce,
    ) -> CryptoResult<SharedSecret> {
        dh::dh_server(their_pub, our_sec, nonce)
    }

    /// Transport-layer DH, client side. Same construction as
    /// [`Crypto::dh_client`]; kept as a named operation so audit
    /// boundaries between path and transport keying stay visible.
    pub fn transport_dh_client(
        &self,
        their_pub: &[u8; 32],
        our_sec: &EncryptionKeypair,
        nonce: &TunnelNonce,
    ) -> CryptoResult<SharedSecret> {
        dh::dh_client(their_pub, our_sec, nonce)
    }

    /// Transport-layer DH, server side.
    pub fn transport_dh_server(
        &self,
        their_pub: &[u8; 32],
        our_sec: &EncryptionKeypair,
        nonce: &TunnelNonce,
    ) -> CryptoResult<SharedSecret> {
        dh::dh_server(their_pub, our_sec, nonce)
    }

    pub fn short_hash(&self, data: &[u8]) -> ShortHash {
        hash::short_hash(data)
    }

    pub fn hmac(&self, data: &[u8], key: &SharedSecret) -> CryptoResult<ShortHash> {
        hash::hmac(data, key)
    }

    /// In-place XChaCha20 stream XOR. Symmetric: applying it twice with
    /// the same key and nonce restores the input.
    pub fn xchacha20(
        &self,
        buf: &mut [u8],
        key: &SharedSecret,
        nonce: &TunnelNonce,
    ) -> CryptoResult<()> {
        stream::xchacha20(buf, key, nonce)
    }

    pub fn sign(&self, keys: &SigningKeypair, message: &[u8]) -> Signature {
        sign::sign(keys, message)
    }

    pub fn sign_derived(&self, keys: &DerivedSigningKey, message: &[u8]) -> Signature {
        sign::sign_derived(keys, message)
    }

    pub fn verify(&self, public_key: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
        sign::verify(public_key, message, signature)
    }

    pub fn pqe_keygen(&self) -> PqKeyPair {
        kem::pqe_keygen()
    }

    /// Encapsulate a fresh 32-byte session key to `public_key`.
    pub fn pqe_encrypt(
        &self,
        public_key: &PqPublicKey,
    ) -> CryptoResult<(PqCipherBlock, SharedSecret)> {
        kem::pqe_encrypt(public_key)
    }

    pub fn pqe_decrypt(
        &self,
        ciphertext: &PqCipherBlock,
        secret_key: &PqSecretKey,
    ) -> CryptoResult<SharedSecret> {
        kem::pqe_decrypt(ciphertext, secret_key)
    }

    /// Blinded public subkey for index `n` under `root`.
    pub fn derive_subkey(&self, root: &[u8; 32], n: u64) -> CryptoResult<[u8; 32]> {
        subkey::derive_subkey(root, n)
    }

    /// Blinded private subkey; carries its own signing state because the
    /// derived scalar has no recoverable seed.
    pub fn derive_subkey_private(
        &self,
        root: &SigningKeypair,
        n: u64,
    ) -> CryptoResult<DerivedSigningKey> {
        subkey::derive_subkey_private(root, n)
    }

    pub fn random_fill(&self, buf: &mut [u8]) {
        rand_source::random_fill(buf)
    }

    pub fn random_u64(&self) -> u64 {
        rand_source::random_u64()
    }

    pub fn random_nonce(&self) -> TunnelNonce {
        let mut bytes = [0u8; 32];
        rand_source::random_fill(&mut bytes);
        TunnelNonce(bytes)
    }
}
