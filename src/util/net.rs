//! Network-related utilities (TCP tuning, address resolution)

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Enable low-latency options and keepalive on a TCP stream (best-effort).
pub fn configure_tcp_stream(stream: &TcpStream, address: &str) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("[Net] Failed to enable TCP_NODELAY for {}: {}", address, err);
    }

    #[cfg(any(unix, windows))]
    {
        use socket2::{SockRef, TcpKeepalive};

        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(120))
            .with_interval(Duration::from_secs(30));

        if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!(
                "[Net] Failed to configure TCP keepalive for {}: {}",
                address, err
            );
        }
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host.
pub fn host_of(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => address,
    }
}

/// Resolve an address that may omit the port (raw IP transports have none).
pub async fn resolve(address: &str) -> io::Result<SocketAddr> {
    let target = if address.parse::<SocketAddr>().is_ok() || has_port(address) {
        address.to_string()
    } else if address.contains(':') {
        format!("[{}]:0", address)
    } else {
        format!("{}:0", address)
    };
    tokio::net::lookup_host(target.as_str())
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", address),
            )
        })
}

fn has_port(address: &str) -> bool {
    host_of(address) != address && !address.starts_with('[') || address.contains("]:")
}
