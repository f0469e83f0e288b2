//! Shared fixtures for this crate's unit tests.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use parking_lot::Mutex;

use veilnet_contact::{NetId, RouterContact};
use veilnet_core::{PathId, Result, RouterId, SendStatus, SendStatusHandler, Time, WireTransport};
use veilnet_crypto::{Crypto, Identity};

pub fn t(ms: u64) -> Time {
    Duration::from_millis(ms)
}

/// Transport that records every submitted message and forgotten id.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(RouterId, Vec<u8>)>>,
    pub forgotten: Mutex<Vec<PathId>>,
}

impl RecordingTransport {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn take_sent(&self) -> Vec<(RouterId, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock())
    }
}

impl WireTransport for RecordingTransport {
    fn submit(&self, peer: &RouterId, message: Vec<u8>) -> Result<()> {
        self.sent.lock().push((*peer, message));
        Ok(())
    }

    fn send_with_status(
        &self,
        peer: &RouterId,
        message: Vec<u8>,
        on_status: SendStatusHandler,
    ) -> Result<()> {
        self.sent.lock().push((*peer, message));
        on_status(SendStatus::Success);
        Ok(())
    }

    fn forget_path(&self, path_id: &PathId) {
        self.forgotten.lock().push(*path_id);
    }
}

/// Generate `n` relay identities with contacts on distinct localhost
/// ports.
pub fn make_relays(crypto: &Crypto, n: usize) -> Vec<(Identity, RouterContact)> {
    (0..n)
        .map(|i| {
            let identity = Identity::generate();
            let rc = RouterContact::new_signed(
                crypto,
                &identity,
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2000 + i as u16),
                NetId::default(),
                t(1_000),
            );
            (identity, rc)
        })
        .collect()
}
