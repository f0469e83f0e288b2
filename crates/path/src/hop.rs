use std::time::Duration;

use veilnet_core::{PathId, RouterId, SharedSecret, ShortHash, TunnelNonce};
use veilnet_contact::RouterContact;
use veilnet_crypto::{EncryptionKeypair, PqCipherBlock};

/// Everything the client keeps about one hop of an owned path.
pub struct PathHopConfig {
    /// Forwarding id toward the next hop.
    pub tx_id: PathId,
    /// Id the previous hop (or the client) addresses us on.
    pub rx_id: PathId,
    /// The relay serving this hop.
    pub rc: RouterContact,
    /// Ephemeral commit keypair, used only for this build.
    pub commit_key: EncryptionKeypair,
    /// Derived hop secret.
    pub shared: SharedSecret,
    /// `short_hash(shared)`; XORed into every tunnel nonce at this hop.
    pub nonce_xor: ShortHash,
    /// Router id of the next hop; the hop's own id at the terminal.
    pub upstream: RouterId,
    /// Per-build nonce mixed into the DH.
    pub nonce: TunnelNonce,
    /// KEM session key; masks this hop's view of the commit slots.
    pub pq_session: SharedSecret,
    /// KEM ciphertext carried in this hop's build record.
    pub pq_cipher: PqCipherBlock,
    pub lifetime: Duration,
}

impl PathHopConfig {
    pub fn router_id(&self) -> RouterId {
        self.rc.router_id()
    }

    /// Terminal hops point upstream at themselves.
    pub fn is_terminal(&self) -> bool {
        self.upstream == self.rc.router_id()
    }
}

impl std::fmt::Debug for PathHopConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHopConfig")
            .field("router", &self.rc.router_id())
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("upstream", &self.upstream)
            .finish()
    }
}
