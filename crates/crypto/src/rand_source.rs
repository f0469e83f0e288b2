use rand::rngs::OsRng;
use rand::RngCore;

/// Fill `buf` from the OS CSPRNG.
pub fn random_fill(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

pub fn random_u64() -> u64 {
    OsRng.next_u64()
}
