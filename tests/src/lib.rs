//! Shared harness for the end-to-end scenarios: an in-memory wire
//! transport plus fully wired relay nodes, so a client and a chain of
//! relays can exchange real commit and relay messages without sockets.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use veilnet_contact::{LocalNode, NetId, RcSource, RouterContact};
use veilnet_core::config::{NodeDbConfig, PathConfig};
use veilnet_core::{
    InlineDispatcher, PathId, Result, RouterId, SendStatus, SendStatusHandler, Time, WireTransport,
};
use veilnet_crypto::{Crypto, Identity};
use veilnet_nodedb::NodeDb;
use veilnet_path::{PathContext, Profiles, RoutingHandler, Services};

pub fn t(ms: u64) -> Time {
    Duration::from_millis(ms)
}

/// A queued message: sender, destination, encoded bytes.
pub type QueuedMessage = (RouterId, RouterId, Vec<u8>);

#[derive(Default)]
pub struct SharedNet {
    queue: Mutex<VecDeque<QueuedMessage>>,
    pub forgotten: Mutex<Vec<(RouterId, PathId)>>,
    /// Destinations that silently eat traffic (for timeout scenarios).
    pub blackholes: Mutex<Vec<RouterId>>,
}

impl SharedNet {
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn drain(&self) -> Vec<QueuedMessage> {
        self.queue.lock().drain(..).collect()
    }

    pub fn forgotten_for(&self, who: &RouterId) -> Vec<PathId> {
        self.forgotten
            .lock()
            .iter()
            .filter(|(node, _)| node == who)
            .map(|(_, id)| *id)
            .collect()
    }
}

/// One node's handle onto the shared network.
pub struct NodeTransport {
    net: Arc<SharedNet>,
    me: RouterId,
}

impl WireTransport for NodeTransport {
    fn submit(&self, peer: &RouterId, message: Vec<u8>) -> Result<()> {
        if !self.net.blackholes.lock().contains(peer) {
            self.net.queue.lock().push_back((self.me, *peer, message));
        }
        Ok(())
    }

    fn send_with_status(
        &self,
        peer: &RouterId,
        message: Vec<u8>,
        on_status: SendStatusHandler,
    ) -> Result<()> {
        self.submit(peer, message)?;
        on_status(SendStatus::Success);
        Ok(())
    }

    fn forget_path(&self, path_id: &PathId) {
        self.net.forgotten.lock().push((self.me, *path_id));
    }
}

/// A fully wired node: identity, contact cache, profiles, context, and
/// its transport endpoint.
pub struct TestNode {
    pub node: LocalNode,
    pub context: PathContext,
    pub nodedb: NodeDb,
    pub profiles: Arc<Profiles>,
    pub transport: NodeTransport,
}

impl TestNode {
    pub fn new(crypto: &Crypto, net: &Arc<SharedNet>, port: u16, now: Time) -> TestNode {
        let identity = Identity::generate();
        let rc = RouterContact::new_signed(
            crypto,
            &identity,
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port),
            NetId::default(),
            now,
        );
        let node = LocalNode::new(identity, rc);
        let context = PathContext::new(node.router_id());
        TestNode {
            transport: NodeTransport {
                net: net.clone(),
                me: node.router_id(),
            },
            context,
            nodedb: NodeDb::in_memory(Arc::new(InlineDispatcher), NodeDbConfig::default()),
            profiles: Arc::new(Profiles::new()),
            node,
        }
    }

    pub fn router_id(&self) -> RouterId {
        self.node.router_id()
    }

    pub fn rc(&self) -> RouterContact {
        self.node.rc().clone()
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            crypto: crypto_ref(),
            nodedb: &self.nodedb,
            profiles: &self.profiles,
            transport: &self.transport,
            source: &self.node,
        }
    }
}

// The crypto handle is stateless; one per harness keeps signatures
// simple without threading lifetimes through Services.
fn crypto_ref() -> &'static Crypto {
    static CRYPTO: Crypto = Crypto;
    &CRYPTO
}

pub fn test_crypto() -> &'static Crypto {
    crypto_ref()
}

/// A network of relays plus the routing glue to step messages through
/// them.
pub struct TestNet {
    pub net: Arc<SharedNet>,
    pub nodes: HashMap<RouterId, TestNode>,
    pub order: Vec<RouterId>,
}

impl TestNet {
    /// Spin up `n` relays with transit enabled, each knowing every
    /// other's contact.
    pub fn new(n: usize, now: Time) -> TestNet {
        veilnet_logging::init();
        let crypto = crypto_ref();
        let net = Arc::new(SharedNet::default());
        let mut nodes = HashMap::new();
        let mut order = Vec::new();
        let built: Vec<TestNode> = (0..n)
            .map(|i| TestNode::new(crypto, &net, 3000 + i as u16, now))
            .collect();
        let rcs: Vec<RouterContact> = built.iter().map(|node| node.rc()).collect();
        for node in built {
            node.context.allow_transit();
            for rc in &rcs {
                if rc.router_id() != node.router_id() {
                    node.nodedb.put(rc.clone(), now);
                }
            }
            order.push(node.router_id());
            nodes.insert(node.router_id(), node);
        }
        TestNet { net, nodes, order }
    }

    pub fn node(&self, idx: usize) -> &TestNode {
        &self.nodes[&self.order[idx]]
    }

    /// Add a client node: it routes traffic but takes no transit and
    /// does not appear in the relay order. It learns every relay's
    /// contact.
    pub fn add_client(&mut self, now: Time) -> RouterId {
        let crypto = crypto_ref();
        let client = TestNode::new(crypto, &self.net, 4000, now);
        for rc in self.rcs() {
            client.nodedb.put(rc, now);
        }
        let id = client.router_id();
        self.nodes.insert(id, client);
        id
    }

    pub fn rcs(&self) -> Vec<RouterContact> {
        self.order.iter().map(|id| self.nodes[id].rc()).collect()
    }

    /// Deliver every queued message to relay nodes; messages addressed
    /// to unknown routers (e.g. the client) are returned instead.
    pub fn deliver(
        &self,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Vec<QueuedMessage> {
        let mut undeliverable = Vec::new();
        for (from, to, bytes) in self.net.drain() {
            match self.nodes.get(&to) {
                Some(node) => {
                    // errors are dropped frames, which scenarios assert on
                    // through state rather than return values
                    let _ = node.context.handle_wire_message(
                        &node.services(),
                        &bytes,
                        &from,
                        None,
                        handler,
                        now,
                    );
                }
                None => undeliverable.push((from, to, bytes)),
            }
        }
        undeliverable
    }

    /// Flush all relay queues.
    pub fn pump(&self, handler: &mut dyn RoutingHandler, now: Time) {
        for node in self.nodes.values() {
            node.context.pump(&node.services(), handler, now);
        }
    }

    /// Deliver and pump until the network is quiet, collecting traffic
    /// addressed outside the relay set.
    pub fn run_until_quiet(
        &self,
        handler: &mut dyn RoutingHandler,
        now: Time,
    ) -> Vec<QueuedMessage> {
        let mut external = Vec::new();
        for _ in 0..32 {
            external.extend(self.deliver(handler, now));
            self.pump(handler, now);
            if self.net.pending() == 0 {
                break;
            }
        }
        external
    }
}

/// Routing handler that records whatever reaches it.
#[derive(Default)]
pub struct CapturingHandler {
    pub traffic: Vec<(PathId, u64, Vec<u8>)>,
    pub hidden_service: Vec<(PathId, Vec<u8>)>,
    pub dht: Vec<(PathId, Vec<u8>)>,
    pub intros: Vec<(PathId, Vec<u8>)>,
    pub grant_exits: bool,
}

impl RoutingHandler for CapturingHandler {
    fn on_transfer_traffic(&mut self, path: PathId, protocol: u64, payload: &[u8]) -> Result<()> {
        self.traffic.push((path, protocol, payload.to_vec()));
        Ok(())
    }

    fn on_hidden_service_frame(&mut self, path: PathId, payload: &[u8]) -> Result<()> {
        self.hidden_service.push((path, payload.to_vec()));
        Ok(())
    }

    fn on_dht_message(&mut self, path: PathId, payload: &[u8]) -> Result<()> {
        self.dht.push((path, payload.to_vec()));
        Ok(())
    }

    fn on_got_intro(&mut self, path: PathId, payload: &[u8]) -> Result<()> {
        self.intros.push((path, payload.to_vec()));
        Ok(())
    }

    fn on_exit_granted(&mut self, _: PathId, _: u64) -> Result<()> {
        Ok(())
    }

    fn on_exit_rejected(&mut self, _: PathId, _: u64, _: Duration) -> Result<()> {
        Ok(())
    }

    fn on_exit_closed(&mut self, _: PathId) -> Result<()> {
        Ok(())
    }

    fn on_obtain_exit(&mut self, _: PathId, _: u64, _: u64) -> Result<bool> {
        Ok(self.grant_exits)
    }
}

/// A default path config with short hop counts for tests.
pub fn path_config(hops: usize) -> PathConfig {
    PathConfig {
        num_hops: hops,
        num_paths: 1,
        ..PathConfig::default()
    }
}
