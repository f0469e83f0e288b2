use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use tracing::warn;

use veilnet_core::bencode::{DictBuilder, DictReader, Value};
use veilnet_core::config::RcConfig;
use veilnet_core::constants::{RC_EXPIRES_SOON_SLACK, RC_LIFETIME};
use veilnet_core::{Result, RouterId, Signature, Time, VeilnetError};
use veilnet_crypto::{Crypto, Identity, PqPublicKey};

use crate::{NetId, RouterVersion, SrvRecord};

/// Current RC document version. Version 0 encoded addresses as a legacy
/// `a` list; version 1 uses packed-inet `4`/`6` strings.
pub const RC_VERSION: u64 = 1;

/// A relay's signed, self-describing contact record.
#[derive(Clone)]
pub struct RouterContact {
    pub net_id: NetId,
    /// X25519 key tunnels are keyed against.
    pub enc_key: [u8; 32],
    /// KEM key build records encapsulate to.
    pub pq_key: PqPublicKey,
    /// Identity key; signs the record and doubles as the router id.
    pub pub_key: RouterId,
    pub addr: SocketAddrV4,
    pub addr6: Option<SocketAddrV6>,
    /// Milliseconds since epoch at signing time.
    pub last_updated: Time,
    pub version: u64,
    pub router_version: Option<RouterVersion>,
    pub srv_records: Vec<SrvRecord>,
    pub signature: Signature,
    /// Byte-exact signed region, retained so the record round-trips.
    signed_region: Vec<u8>,
}

impl RouterContact {
    /// Signing ceremony on the owning relay.
    pub fn new_signed(
        crypto: &Crypto,
        identity: &Identity,
        addr: SocketAddrV4,
        net_id: NetId,
        now: Time,
    ) -> RouterContact {
        let mut rc = RouterContact {
            net_id,
            enc_key: identity.encryption.public_key_bytes(),
            pq_key: identity.pq.public.clone(),
            pub_key: RouterId(identity.router_id_bytes()),
            addr,
            addr6: None,
            last_updated: now,
            version: RC_VERSION,
            router_version: Some(RouterVersion([0, 1, 0])),
            srv_records: Vec::new(),
            signature: Signature::default(),
            signed_region: Vec::new(),
        };
        rc.sign(crypto, identity);
        rc
    }

    pub fn router_id(&self) -> RouterId {
        self.pub_key
    }

    /// Re-sign after mutating fields; refreshes the cached signed region.
    pub fn sign(&mut self, crypto: &Crypto, identity: &Identity) {
        self.pub_key = RouterId(identity.router_id_bytes());
        self.signed_region = self.encode_signed_region();
        self.signature = crypto.sign(&identity.signing, &self.signed_region);
    }

    /// The canonical dictionary without the signature slot.
    fn signed_dict(&self) -> DictBuilder {
        let mut builder = DictBuilder::new()
            .insert_bytes("e", self.enc_key.to_vec())
            .insert_bytes("i", self.net_id.as_bytes().to_vec())
            .insert_bytes("k", self.pub_key.as_bytes().to_vec())
            .insert_bytes("q", self.pq_key.as_bytes().to_vec())
            .insert_int("t", self.last_updated.as_millis() as i64)
            .insert_int("v", self.version as i64);
        if self.version == 0 {
            // legacy address list; re-encoding must reproduce the signed
            // bytes of old documents
            builder = builder.insert(
                "a",
                Value::List(vec![Value::Bytes(pack_v4(&self.addr).to_vec())]),
            );
        } else {
            builder = builder.insert_bytes("4", pack_v4(&self.addr).to_vec());
            if let Some(addr6) = &self.addr6 {
                builder = builder.insert_bytes("6", pack_v6(addr6).to_vec());
            }
        }
        if let Some(rv) = &self.router_version {
            builder = builder.insert("r", rv.to_value());
        }
        if !self.srv_records.is_empty() {
            builder = builder.insert(
                "s",
                Value::List(self.srv_records.iter().map(|s| s.to_value()).collect()),
            );
        }
        builder
    }

    pub fn encode_signed_region(&self) -> Vec<u8> {
        self.signed_dict().build().encode()
    }

    /// Full wire/disk encoding, signature included.
    pub fn encode(&self) -> Vec<u8> {
        self.signed_dict()
            .insert_bytes("z", self.signature.as_bytes().to_vec())
            .build()
            .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<RouterContact> {
        let value = Value::decode(bytes)?;
        let dict = DictReader::new(&value)?;

        let version = dict.require_int("v")? as u64;
        let (addr, addr6) = match version {
            0 => {
                // legacy list of packed v4 entries; first one wins
                let list = dict
                    .require("a")?
                    .as_list()
                    .ok_or_else(|| VeilnetError::InvalidMessage("legacy addr not a list".into()))?;
                let first = list.first().and_then(|v| v.as_bytes()).ok_or_else(|| {
                    VeilnetError::InvalidMessage("legacy addr list is empty".into())
                })?;
                (unpack_v4(first)?, None)
            }
            RC_VERSION => {
                let addr = unpack_v4(dict.require_bytes("4")?)?;
                let addr6 = match dict.get("6") {
                    Some(v) => {
                        let bytes = v.as_bytes().ok_or_else(|| {
                            VeilnetError::InvalidMessage("addr6 is not bytes".into())
                        })?;
                        Some(unpack_v6(bytes)?)
                    }
                    None => None,
                };
                (addr, addr6)
            }
            other => {
                return Err(VeilnetError::InvalidMessage(format!(
                    "unknown rc document version {other}"
                )))
            }
        };

        let pq_key = PqPublicKey::from_bytes(dict.require_bytes("q")?)
            .map_err(VeilnetError::from)?;
        let router_version = match dict.get("r") {
            Some(v) => Some(RouterVersion::from_value(v)?),
            None => None,
        };
        let srv_records = match dict.get("s") {
            Some(v) => {
                let list = v
                    .as_list()
                    .ok_or_else(|| VeilnetError::InvalidMessage("srv slot not a list".into()))?;
                list.iter()
                    .map(SrvRecord::from_value)
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };

        let mut rc = RouterContact {
            net_id: NetId::from_wire(dict.require_bytes("i")?)?,
            enc_key: dict.require_array("e")?,
            pq_key,
            pub_key: RouterId(dict.require_array("k")?),
            addr,
            addr6,
            last_updated: Duration::from_millis(dict.require_int("t")?.max(0) as u64),
            version,
            router_version,
            srv_records,
            signature: Signature(dict.require_array::<64>("z")?),
            signed_region: Vec::new(),
        };

        // the decoder enforces canonical key order, so re-encoding the
        // dictionary minus the signature slot reproduces the signed bytes
        rc.signed_region = rc.encode_signed_region();
        Ok(rc)
    }

    /// Validate this contact for use. Order matters: cheap structural
    /// checks run before the signature.
    pub fn verify(&self, crypto: &Crypto, now: Time, cfg: &RcConfig) -> Result<()> {
        let expected = NetId::new(&cfg.net_id)?;
        if self.net_id != expected {
            return Err(VeilnetError::WrongNetId(self.net_id.to_string()));
        }
        if cfg.block_bogons {
            if is_bogon_v4(self.addr.ip()) {
                return Err(VeilnetError::BogonAddress(self.addr.to_string()));
            }
            if let Some(addr6) = &self.addr6 {
                if is_bogon_v6(addr6.ip()) {
                    return Err(VeilnetError::BogonAddress(addr6.to_string()));
                }
            }
        }
        if self.last_updated > now + cfg.clock_skew {
            warn!(rc = %self.pub_key.short_hex(), "contact timestamp is in the future");
            return Err(VeilnetError::Expired);
        }
        if self.is_expired_with(now, cfg.lifetime) {
            return Err(VeilnetError::Expired);
        }
        if !crypto.verify(
            self.pub_key.as_bytes(),
            &self.signed_region,
            &self.signature,
        ) {
            return Err(VeilnetError::BadSignature);
        }
        Ok(())
    }

    /// `true` iff this record supersedes `other` for the same relay.
    pub fn is_newer_than(&self, other: &RouterContact) -> bool {
        self.last_updated > other.last_updated
    }

    pub fn age(&self, now: Time) -> Duration {
        now.saturating_sub(self.last_updated)
    }

    pub fn is_expired(&self, now: Time) -> bool {
        self.is_expired_with(now, RC_LIFETIME)
    }

    fn is_expired_with(&self, now: Time, lifetime: Duration) -> bool {
        self.age(now) >= lifetime
    }

    pub fn expires_soon(&self, now: Time) -> bool {
        self.age(now) + RC_EXPIRES_SOON_SLACK >= RC_LIFETIME
    }

    pub fn time_until_expires(&self, now: Time) -> Duration {
        RC_LIFETIME.saturating_sub(self.age(now))
    }
}

impl PartialEq for RouterContact {
    // every field except signed_region, which is a cache of the other
    // fields' canonical encoding
    fn eq(&self, other: &Self) -> bool {
        self.net_id == other.net_id
            && self.enc_key == other.enc_key
            && self.pq_key == other.pq_key
            && self.pub_key == other.pub_key
            && self.addr == other.addr
            && self.addr6 == other.addr6
            && self.last_updated == other.last_updated
            && self.version == other.version
            && self.router_version == other.router_version
            && self.srv_records == other.srv_records
            && self.signature == other.signature
    }
}

impl Eq for RouterContact {}

impl PartialOrd for RouterContact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouterContact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pub_key.cmp(&other.pub_key)
    }
}

impl fmt::Debug for RouterContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterContact")
            .field("pub_key", &self.pub_key)
            .field("addr", &self.addr)
            .field("net_id", &self.net_id)
            .field("last_updated", &self.last_updated.as_millis())
            .finish()
    }
}

fn pack_v4(addr: &SocketAddrV4) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

fn unpack_v4(bytes: &[u8]) -> Result<SocketAddrV4> {
    let raw: [u8; 6] = bytes
        .try_into()
        .map_err(|_| VeilnetError::InvalidMessage("packed v4 addr must be 6 bytes".into()))?;
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

fn pack_v6(addr: &SocketAddrV6) -> [u8; 18] {
    let mut out = [0u8; 18];
    out[..16].copy_from_slice(&addr.ip().octets());
    out[16..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

fn unpack_v6(bytes: &[u8]) -> Result<SocketAddrV6> {
    let raw: [u8; 18] = bytes
        .try_into()
        .map_err(|_| VeilnetError::InvalidMessage("packed v6 addr must be 18 bytes".into()))?;
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&raw[..16]);
    let port = u16::from_be_bytes([raw[16], raw[17]]);
    Ok(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))
}

fn is_bogon_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.octets()[0] == 0
}

fn is_bogon_v6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7 and link local fe80::/10
        || (ip.segments()[0] & 0xfe00) == 0xfc00
        || (ip.segments()[0] & 0xffc0) == 0xfe80
}
