//! Post-quantum key encapsulation for build records.
//!
//! Each route-commit record encapsulates a 32-byte session key to the
//! hop's advertised KEM public key; the session key masks the remaining
//! record slots as the commit message moves up the path. Ciphertexts are
//! carried with a one-byte variant tag so the algorithm can be rotated
//! without a wire break.

use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as CiphertextTrait, PublicKey as PublicKeyTrait, SharedSecret as SharedSecretTrait,
};

use veilnet_core::SharedSecret;

use crate::{CryptoError, CryptoResult};

/// Wire tag for the current KEM variant.
pub const PQ_VARIANT_TAG: u8 = 0x00;

pub const PQ_PUBLIC_KEY_SIZE: usize = 1568;
pub const PQ_CIPHERTEXT_SIZE: usize = 1568;

/// KEM public key as advertised in a router contact.
#[derive(Clone, PartialEq, Eq)]
pub struct PqPublicKey(pub Vec<u8>);

impl PqPublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PQ_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidInput(format!(
                "kem public key must be {PQ_PUBLIC_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(PqPublicKey(bytes.to_vec()))
    }
}

impl std::fmt::Debug for PqPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PqPublicKey({} bytes)", self.0.len())
    }
}

/// KEM secret key; never leaves the owning relay.
pub struct PqSecretKey(mlkem1024::SecretKey);

pub struct PqKeyPair {
    pub public: PqPublicKey,
    pub secret: PqSecretKey,
}

/// Tag-prefixed KEM ciphertext as carried inside a build record.
#[derive(Clone, PartialEq, Eq)]
pub struct PqCipherBlock(Vec<u8>);

impl PqCipherBlock {
    /// Wire bytes: variant tag followed by the ciphertext.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PQ_CIPHERTEXT_SIZE + 1 {
            return Err(CryptoError::InvalidInput(format!(
                "kem ciphertext must be {} bytes, got {}",
                PQ_CIPHERTEXT_SIZE + 1,
                bytes.len()
            )));
        }
        if bytes[0] != PQ_VARIANT_TAG {
            return Err(CryptoError::InvalidInput(format!(
                "unknown kem variant tag {:#04x}",
                bytes[0]
            )));
        }
        Ok(PqCipherBlock(bytes.to_vec()))
    }
}

impl std::fmt::Debug for PqCipherBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PqCipherBlock({} bytes)", self.0.len())
    }
}

pub fn pqe_keygen() -> PqKeyPair {
    let (pk, sk) = mlkem1024::keypair();
    PqKeyPair {
        public: PqPublicKey(pk.as_bytes().to_vec()),
        secret: PqSecretKey(sk),
    }
}

pub fn pqe_encrypt(public_key: &PqPublicKey) -> CryptoResult<(PqCipherBlock, SharedSecret)> {
    let pk = mlkem1024::PublicKey::from_bytes(public_key.as_bytes())
        .map_err(|e| CryptoError::InvalidInput(format!("bad kem public key: {e}")))?;
    let (session, ciphertext) = mlkem1024::encapsulate(&pk);

    let mut wire = Vec::with_capacity(1 + PQ_CIPHERTEXT_SIZE);
    wire.push(PQ_VARIANT_TAG);
    wire.extend_from_slice(ciphertext.as_bytes());

    let mut key = [0u8; 32];
    key.copy_from_slice(session.as_bytes());
    Ok((PqCipherBlock(wire), SharedSecret(key)))
}

pub fn pqe_decrypt(
    ciphertext: &PqCipherBlock,
    secret_key: &PqSecretKey,
) -> CryptoResult<SharedSecret> {
    let ct = mlkem1024::Ciphertext::from_bytes(&ciphertext.0[1..])
        .map_err(|e| CryptoError::Primitive(format!("bad kem ciphertext: {e}")))?;
    let session = mlkem1024::decapsulate(&ct, &secret_key.0);

    let mut key = [0u8; 32];
    key.copy_from_slice(session.as_bytes());
    Ok(SharedSecret(key))
}
