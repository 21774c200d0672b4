//! Client side of the protocol

#[allow(clippy::module_inception)]
pub mod client;

pub use client::{
    Mux, connect, connect_with, default_mux, default_root, handshake, oneshot,
};
