//! Veilnet Path Subsystem
//!
//! The distributed state machine at the center of the mixnet: transit
//! hops multiplexing relay traffic, client-owned paths with their layered
//! encryption and routing-message handling, the pathset/builder pair that
//! keeps circuits alive, and the context that indexes everything by path
//! id and drives per-tick upkeep.

mod builder;
mod context;
mod hop;
mod limiter;
mod messages;
mod pathset;
mod profiles;
mod records;
mod routing;
mod transit;

#[allow(clippy::module_inception)]
mod path;

#[cfg(test)]
pub(crate) mod testutil;

pub use builder::*;
pub use context::*;
pub use hop::*;
pub use limiter::*;
pub use messages::*;
pub use path::*;
pub use pathset::*;
pub use profiles::*;
pub use records::*;
pub use routing::*;
pub use transit::*;
