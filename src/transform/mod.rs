//! Wire-level Wrappers and content-level Transforms
//!
//! Outbound data passes through the Transform first and the Wrapper second;
//! inbound data is unwrapped first and then decoded by the Transform.

/// Random padding Transform
pub mod padding;
/// Keyed XOR Wrapper
pub mod xor;

pub use padding::*;
pub use xor::*;

use bytes::Bytes;
use std::fmt::Debug;
use std::io;

/// Wire-level byte transform applied at the connection boundary
pub trait Wrapper: Debug + Send + Sync {
    fn wrap(&self, data: Bytes) -> io::Result<Bytes>;
    fn unwrap(&self, data: Bytes) -> io::Result<Bytes>;
}

/// Content-level packet transform applied before the Wrapper
pub trait Transform: Debug + Send + Sync {
    fn encode(&self, data: Bytes) -> io::Result<Bytes>;
    fn decode(&self, data: Bytes) -> io::Result<Bytes>;
}
