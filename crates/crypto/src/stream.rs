use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;

use veilnet_core::{SharedSecret, TunnelNonce};

use crate::CryptoResult;

/// In-place XChaCha20 stream XOR. The 32-byte tunnel nonce feeds the
/// cipher's 24-byte IV from its leading bytes; the remainder is entropy
/// for the replay filters only.
pub fn xchacha20(buf: &mut [u8], key: &SharedSecret, nonce: &TunnelNonce) -> CryptoResult<()> {
    let mut iv = [0u8; 24];
    iv.copy_from_slice(&nonce.as_bytes()[..24]);
    let mut cipher = XChaCha20::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(buf);
    Ok(())
}
