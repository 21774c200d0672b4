//! Pluggable transports
//!
//! A [`Connector`] opens client connections and binds listeners. Every
//! transport hands back boxed `AsyncRead + AsyncWrite` connections so the
//! session layer never sees the concrete socket type.

/// UDP, raw IP and ICMP transports
pub mod datagram;
/// Plain TCP transport
pub mod tcp;
/// TLS over TCP transport
pub mod tls;
/// Web-camouflage transport (HTTP upgrade preamble over TCP)
pub mod wc2;

pub use datagram::{IpConnector, UdpConnector};
pub use tcp::TcpConnector;
pub use tls::TlsConnector;
pub use wc2::{Generator, Wc2Connector};

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream produced by a transport
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// A connected transport stream
pub type Connection = Box<dyn Conn>;

/// Transport capability: dial an address or bind a listener
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    /// Short transport name used in logs and status output
    fn kind(&self) -> &'static str;

    async fn connect(&self, address: &str) -> io::Result<Connection>;

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>>;
}

/// Bound listener handing out accepted connections
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next connection and its peer address
    async fn accept(&self) -> io::Result<(Connection, String)>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<String>;
}
