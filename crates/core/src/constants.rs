//! Protocol sizes and timing constants.

use std::time::Duration;

pub const PUB_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const PATH_ID_SIZE: usize = 16;
pub const TUNNEL_NONCE_SIZE: usize = 32;
pub const SHORT_HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const NET_ID_SIZE: usize = 8;

/// Relay data frames: `path_id (16) ‖ tunnel_nonce (32) ‖ ciphertext`.
/// The ciphertext covers a 32-byte end-to-end digest plus the fixed body,
/// so the full frame is 16 + 32 + 32 + 768 = 848 bytes at every hop.
pub const RELAY_BODY_SIZE: usize = 128 * 6;
pub const RELAY_FRAME_OVERHEAD: usize = PATH_ID_SIZE + TUNNEL_NONCE_SIZE + SHORT_HASH_SIZE;
pub const RELAY_FRAME_SIZE: usize = RELAY_FRAME_OVERHEAD + RELAY_BODY_SIZE;
/// Body layout is a two-byte length prefix followed by payload and zero
/// padding.
pub const MAX_RELAY_PAYLOAD: usize = RELAY_BODY_SIZE - 2;

/// Build record frames: `hmac (32) ‖ commit_pub (32) ‖ nonce (32) ‖ body`.
/// The body must fit a bencoded build record including the KEM ciphertext.
pub const RECORD_FRAME_OVERHEAD: usize = SHORT_HASH_SIZE + PUB_KEY_SIZE + TUNNEL_NONCE_SIZE;
pub const RECORD_FRAME_BODY_SIZE: usize = 2048;
pub const RECORD_FRAME_SIZE: usize = RECORD_FRAME_OVERHEAD + RECORD_FRAME_BODY_SIZE;

/// Maximum hops per path; the route-commit message always carries this
/// many record slots, unused ones randomized.
pub const MAX_HOPS: usize = 8;

pub const MAX_TRANSIT_QUEUE_DEPTH: usize = 512;

/// Sliding-window width for per-direction sequence-number replay checks.
pub const SEQUENCE_WINDOW: u64 = 128;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub const PATH_BUILD_RATE: Duration = Duration::from_millis(100);
/// Cooldown between builds over the same first-hop edge.
pub const MIN_PATH_BUILD_INTERVAL: Duration = Duration::from_millis(500);
pub const PATH_BUILD_TIMEOUT: Duration = Duration::from_secs(10);
pub const PATH_BUILD_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const REPLAY_FILTER_WINDOW: Duration = Duration::from_secs(60);
pub const PATH_EXPIRES_SOON_SLACK: Duration = Duration::from_secs(5);

pub const NODEDB_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const RC_STALE_INSERTION_AGE: Duration = Duration::from_secs(12 * 60 * 60);
pub const RC_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
pub const RC_EXPIRES_SOON_SLACK: Duration = Duration::from_secs(60);
