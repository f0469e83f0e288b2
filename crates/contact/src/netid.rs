use std::fmt;

use veilnet_core::constants::NET_ID_SIZE;
use veilnet_core::{Result, VeilnetError};

/// 8-byte ASCII tag separating network instances (mainnet, testnets).
/// Shorter names are zero-padded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetId([u8; NET_ID_SIZE]);

impl NetId {
    pub fn new(name: &str) -> Result<NetId> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NET_ID_SIZE {
            return Err(VeilnetError::InvalidInput(format!(
                "net id must be 1..={NET_ID_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(VeilnetError::InvalidInput(
                "net id must be printable ascii".into(),
            ));
        }
        let mut buf = [0u8; NET_ID_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(NetId(buf))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<NetId> {
        let buf: [u8; NET_ID_SIZE] = bytes.try_into().map_err(|_| {
            VeilnetError::InvalidMessage(format!(
                "net id must be {NET_ID_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(NetId(buf))
    }

    pub fn as_bytes(&self) -> &[u8; NET_ID_SIZE] {
        &self.0
    }

    fn name_len(&self) -> usize {
        self.0.iter().position(|b| *b == 0).unwrap_or(NET_ID_SIZE)
    }
}

impl Default for NetId {
    fn default() -> Self {
        let mut buf = [0u8; NET_ID_SIZE];
        buf[..7].copy_from_slice(b"veilnet");
        NetId(buf)
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0[..self.name_len()]))
    }
}

impl fmt::Debug for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_net_id() {
        assert_eq!(NetId::default().to_string(), "veilnet");
    }

    #[test]
    fn test_short_names_pad() {
        let id = NetId::new("gamma").unwrap();
        assert_eq!(id.as_bytes(), b"gamma\0\0\0");
        assert_eq!(id.to_string(), "gamma");
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(NetId::new("").is_err());
        assert!(NetId::new("way-too-long").is_err());
        assert!(NetId::new("spa ce").is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        let id = NetId::new("testnet1").unwrap();
        let back = NetId::from_wire(id.as_bytes()).unwrap();
        assert_eq!(id, back);
        assert!(NetId::from_wire(b"short").is_err());
    }
}
