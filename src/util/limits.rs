//! Queue sizes, timing defaults and protocol bounds

use std::time::Duration;

/// Capacity of small internal channels (server events)
pub const SMALL_LIMIT: usize = 64;
/// Default send/receive queue capacity when a Profile does not set one
pub const MEDIUM_LIMIT: usize = 256;
/// Capacity used for bursty channels
pub const LARGE_LIMIT: usize = 1024;

/// Sleep used when a Profile leaves it at zero
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(60);
/// Jitter percentage used when a Profile asks for more than 100
pub const DEFAULT_JITTER: u8 = 5;

/// Time allowed for a handshake reply (client) or the first packet (listener)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for the best-effort shutdown notice of a closing session
pub const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed poll cycles after which a client session gives up
pub const MAX_ERRORS: u32 = 3;

/// Largest payload carried by one packet before `Session::write` fragments it
pub const FRAGMENT_SIZE: usize = 32 * 1024;
/// Most in-flight reassembly clusters per session
pub const MAX_CLUSTERS: usize = 256;
/// Most payload bytes buffered for reassembly per session
pub const MAX_REASSEMBLY_BYTES: usize = 64 * 1024 * 1024;
/// Age after which an incomplete cluster is evicted
pub const CLUSTER_TTL: Duration = Duration::from_secs(300);

/// Largest encoded frame accepted from the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
