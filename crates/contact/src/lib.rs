//! Veilnet Router Contacts
//!
//! A router contact (RC) is the signed record a relay publishes to be
//! found: identity key, tunnel-encryption key, KEM key, advertised
//! addresses, network tag, and freshness timestamp, all under a detached
//! Ed25519 signature over the canonical bencoded form.

mod netid;
mod rc;
mod source;
mod srv;
mod version;

pub use netid::*;
pub use rc::*;
pub use source::*;
pub use srv::*;
pub use version::*;
