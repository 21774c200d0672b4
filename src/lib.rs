//! Command-and-control communications core
//!
//! Establishes, multiplexes and tears down many logical connections
//! ("sessions") to remote agents over pluggable transports.
//!
//! # Architecture
//!
//! - **protocol**: Packet, codec and the Transform/Wrapper pipeline
//! - **transform**: Wrapper and Transform implementations
//! - **connector**: TCP, TLS, UDP, raw IP/ICMP and WC2 transports
//! - **profile**: Connection configuration and connector hints
//! - **session**: Sessions and fragment reassembly
//! - **server**: Server, Listener and Scheduler
//! - **client**: Client handshake, oneshot and the default dispatch target
//! - **text**: Randomized pattern templates
//! - **util**: Errors, limits, device identity, TLS and socket helpers

/// Client handshake and default dispatch target
pub mod client;
/// Pluggable transports
pub mod connector;
/// Connection configuration
pub mod profile;
/// Protocol layer: packets, codec and pipeline
pub mod protocol;
/// Server, listeners and scheduler
pub mod server;
/// Session layer
pub mod session;
/// Pattern templates
pub mod text;
/// Wrappers and Transforms
pub mod transform;
/// Utility modules (error, limits, device, TLS, etc.)
pub mod util;

pub use client::{connect, connect_with, default_mux, oneshot};
pub use connector::{Acceptor, Connection, Connector};
pub use profile::{Profile, Setting};
pub use protocol::{Flags, Packet, Pipeline, message};
pub use server::{Dispatch, Listener, Scheduler, Server};
pub use session::{Session, State};
pub use transform::{Transform, Wrapper};

// Re-export commonly used types
pub use util::error::{C2Error, ErrorKind, Result};
