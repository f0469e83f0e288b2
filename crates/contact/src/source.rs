use veilnet_core::RouterId;
use veilnet_crypto::Identity;

use crate::RouterContact;

/// Read-only access to the local router's own contact and key material.
/// The builder and transit layer consume this instead of owning keys.
pub trait RcSource: Send + Sync {
    fn router_id(&self) -> RouterId;
    fn identity(&self) -> &Identity;
    fn rc(&self) -> &RouterContact;
}

/// Plain in-memory identity, used by relays and by tests.
pub struct LocalNode {
    identity: Identity,
    rc: RouterContact,
}

impl LocalNode {
    pub fn new(identity: Identity, rc: RouterContact) -> Self {
        Self { identity, rc }
    }
}

impl RcSource for LocalNode {
    fn router_id(&self) -> RouterId {
        self.rc.router_id()
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn rc(&self) -> &RouterContact {
        &self.rc
    }
}
