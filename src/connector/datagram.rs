//! Datagram transports
//!
//! UDP, raw IP and ICMP are exposed as byte streams. Each write becomes one
//! datagram and each read drains one received datagram. On the listening side
//! a single socket is demultiplexed per remote peer by a background task.

use crate::connector::{Acceptor, Connection, Connector};
use crate::util::limits::SMALL_LIMIT;
use crate::util::resolve;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Largest datagram we read
const MAX_DATAGRAM: usize = 65535;
const ICMP_PROTOCOL: u8 = 1;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_HEADER: usize = 8;
/// Identifier stamped on every echo frame we send
const ICMP_IDENT: u16 = 0x4332;
/// Sequence numbers separate the two directions on loopback
///
/// ICMP carries them in the echo header, raw IP as a one-byte tag.
const SEQ_DIAL: u16 = 1;
const SEQ_LISTEN: u16 = 2;
const IP_TAG: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Udp,
    Ip,
    Icmp,
}

/// UDP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

/// Raw IP transport carrying the given protocol number
///
/// Protocol `1` selects ICMP echo framing. Requires raw-socket privileges.
#[derive(Debug, Clone, Copy)]
pub struct IpConnector {
    protocol: u8,
}

impl IpConnector {
    pub fn new(protocol: u8) -> Self {
        Self { protocol }
    }

    pub fn icmp() -> Self {
        Self::new(ICMP_PROTOCOL)
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    fn framing(&self) -> Framing {
        if self.protocol == ICMP_PROTOCOL {
            Framing::Icmp
        } else {
            Framing::Ip
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    fn kind(&self) -> &'static str {
        "udp"
    }

    async fn connect(&self, address: &str) -> io::Result<Connection> {
        dial(Framing::Udp, 0, address).await
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>> {
        bind_acceptor(Framing::Udp, 0, bind).await
    }
}

#[async_trait]
impl Connector for IpConnector {
    fn kind(&self) -> &'static str {
        match self.framing() {
            Framing::Icmp => "icmp",
            _ => "ip",
        }
    }

    async fn connect(&self, address: &str) -> io::Result<Connection> {
        dial(self.framing(), self.protocol, address).await
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>> {
        bind_acceptor(self.framing(), self.protocol, bind).await
    }
}

async fn dial(framing: Framing, protocol: u8, address: &str) -> io::Result<Connection> {
    let peer = resolve(address).await?;
    let local = match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = Arc::new(DatagramSocket::open(framing, protocol, local)?);
    let peer = socket.normalize(peer);
    Ok(Box::new(DatagramConn {
        socket,
        peer,
        source: Source::Socket(vec![0u8; MAX_DATAGRAM]),
        pending: Bytes::new(),
        sequence: SEQ_DIAL,
    }))
}

async fn bind_acceptor(
    framing: Framing,
    protocol: u8,
    bind: &str,
) -> io::Result<Box<dyn Acceptor>> {
    let local = resolve(bind).await?;
    let socket = Arc::new(DatagramSocket::open(framing, protocol, local)?);
    let local = socket.socket.local_addr()?;
    let (tx, rx) = mpsc::channel(SMALL_LIMIT);
    let task = tokio::spawn(demux(Arc::clone(&socket), tx));
    tracing::debug!("[Datagram] Bound {:?} socket on {}", framing, local);
    Ok(Box::new(DatagramAcceptor {
        incoming: Mutex::new(rx),
        local,
        task,
    }))
}

/// Route datagrams from the shared socket to per-peer connections
async fn demux(socket: Arc<DatagramSocket>, incoming: mpsc::Sender<(Connection, String)>) {
    let mut scratch = vec![0u8; MAX_DATAGRAM];
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();

    loop {
        let received =
            std::future::poll_fn(|cx| socket.poll_recv(cx, &mut scratch, SEQ_DIAL)).await;
        let (range, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("[Datagram] Receive failed: {}", e);
                continue;
            }
        };
        let data = Bytes::copy_from_slice(&scratch[range]);

        if let Some(tx) = peers.get(&peer) {
            match tx.try_send(data) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("[Datagram] Dropping datagram from {}", peer);
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(data)) => {
                    peers.remove(&peer);
                    if !open_peer(&socket, &mut peers, peer, data, &incoming).await {
                        return;
                    }
                }
            }
        } else if !open_peer(&socket, &mut peers, peer, data, &incoming).await {
            return;
        }
    }
}

async fn open_peer(
    socket: &Arc<DatagramSocket>,
    peers: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    peer: SocketAddr,
    first: Bytes,
    incoming: &mpsc::Sender<(Connection, String)>,
) -> bool {
    let (tx, rx) = mpsc::channel(SMALL_LIMIT);
    let _ = tx.try_send(first);
    peers.insert(peer, tx);
    peers.retain(|_, tx| !tx.is_closed());

    let conn = DatagramConn {
        socket: Arc::clone(socket),
        peer,
        source: Source::Channel(rx),
        pending: Bytes::new(),
        sequence: SEQ_LISTEN,
    };
    incoming
        .send((Box::new(conn), peer.to_string()))
        .await
        .is_ok()
}

/// Socket plus the framing applied to every datagram
#[derive(Debug)]
struct DatagramSocket {
    socket: UdpSocket,
    framing: Framing,
}

impl DatagramSocket {
    fn open(framing: Framing, protocol: u8, local: SocketAddr) -> io::Result<Self> {
        let socket = match framing {
            Framing::Udp => {
                let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_nonblocking(true)?;
                socket.bind(&local.into())?;
                socket
            }
            Framing::Ip | Framing::Icmp => {
                if framing == Framing::Icmp && local.is_ipv6() {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "ICMP transport supports IPv4 only",
                    ));
                }
                let socket = Socket::new(
                    Domain::for_address(local),
                    Type::RAW,
                    Some(Protocol::from(protocol as i32)),
                )?;
                socket.set_nonblocking(true)?;
                socket.bind(&SocketAddr::new(local.ip(), 0).into())?;
                socket
            }
        };
        let socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            framing,
        })
    }

    /// Raw sockets have no ports
    fn normalize(&self, addr: SocketAddr) -> SocketAddr {
        match self.framing {
            Framing::Udp => addr,
            _ => SocketAddr::new(addr.ip(), 0),
        }
    }

    /// Receive the next datagram carrying our framing, returning the payload
    /// range within `scratch`
    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        scratch: &mut [u8],
        sequence: u16,
    ) -> Poll<io::Result<(Range<usize>, SocketAddr)>> {
        loop {
            let (len, peer) = {
                let mut buf = ReadBuf::new(scratch);
                let peer = ready!(self.socket.poll_recv_from(cx, &mut buf))?;
                (buf.filled().len(), peer)
            };
            if let Some(range) = frame_payload(self.framing, &scratch[..len], peer.is_ipv4(), sequence) {
                return Poll::Ready(Ok((range, self.normalize(peer))));
            }
        }
    }

    fn poll_send(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        peer: SocketAddr,
        sequence: u16,
    ) -> Poll<io::Result<usize>> {
        let (frame, header) = match self.framing {
            Framing::Udp => return self.socket.poll_send_to(cx, data, peer),
            Framing::Ip => (ip_frame(data, sequence), IP_TAG),
            Framing::Icmp => (icmp_frame(data, sequence), ICMP_HEADER),
        };
        let n = ready!(self.socket.poll_send_to(cx, &frame, peer))?;
        Poll::Ready(Ok(n.saturating_sub(header).min(data.len())))
    }
}

/// Payload range of an inbound datagram, `None` when it is not ours
///
/// Frames stamped with a sequence other than `sequence` are dropped, which
/// keeps a socket from reading back its own traffic on loopback.
fn frame_payload(framing: Framing, data: &[u8], ipv4: bool, sequence: u16) -> Option<Range<usize>> {
    if framing == Framing::Udp {
        return Some(0..data.len());
    }
    // IPv4 raw sockets deliver the IP header, IPv6 ones do not
    let start = if ipv4 {
        let ihl = (*data.first()? & 0x0f) as usize * 4;
        if ihl < 20 || ihl > data.len() {
            return None;
        }
        ihl
    } else {
        0
    };
    if framing == Framing::Ip {
        let tag = *data.get(start)?;
        return (u16::from(tag) == sequence).then_some(start + IP_TAG..data.len());
    }

    let icmp = data.get(start..start + ICMP_HEADER)?;
    let ident = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    if icmp[0] != ICMP_ECHO_REQUEST || icmp[1] != 0 || ident != ICMP_IDENT || seq != sequence {
        return None;
    }
    Some(start + ICMP_HEADER..data.len())
}

fn ip_frame(data: &[u8], sequence: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(IP_TAG + data.len());
    frame.push(sequence as u8);
    frame.extend_from_slice(data);
    frame
}

fn icmp_frame(data: &[u8], sequence: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ICMP_HEADER + data.len());
    frame.extend_from_slice(&[ICMP_ECHO_REQUEST, 0, 0, 0]);
    frame.extend_from_slice(&ICMP_IDENT.to_be_bytes());
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame.extend_from_slice(data);
    let sum = checksum(&frame);
    frame[2..4].copy_from_slice(&sum.to_be_bytes());
    frame
}

/// RFC 1071 internet checksum
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

enum Source {
    /// Dialed connection reading straight from its own socket
    Socket(Vec<u8>),
    /// Accepted connection fed by the demux task
    Channel(mpsc::Receiver<Bytes>),
}

/// One logical datagram conversation with a single peer
struct DatagramConn {
    socket: Arc<DatagramSocket>,
    peer: SocketAddr,
    source: Source,
    pending: Bytes,
    sequence: u16,
}

impl DatagramConn {
    /// Sequence number expected on inbound frames
    fn inbound_sequence(&self) -> u16 {
        if self.sequence == SEQ_DIAL {
            SEQ_LISTEN
        } else {
            SEQ_DIAL
        }
    }
}

impl AsyncRead for DatagramConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            let inbound = this.inbound_sequence();
            match &mut this.source {
                Source::Socket(scratch) => loop {
                    let (range, from) = ready!(this.socket.poll_recv(cx, scratch, inbound))?;
                    if from == this.peer {
                        this.pending = Bytes::copy_from_slice(&scratch[range]);
                        break;
                    }
                },
                Source::Channel(rx) => match ready!(rx.poll_recv(cx)) {
                    Some(data) => this.pending = data,
                    None => return Poll::Ready(Ok(())),
                },
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DatagramConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.socket.poll_send(cx, buf, this.peer, this.sequence)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct DatagramAcceptor {
    incoming: Mutex<mpsc::Receiver<(Connection, String)>>,
    local: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for DatagramAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Acceptor for DatagramAcceptor {
    async fn accept(&self) -> io::Result<(Connection, String)> {
        self.incoming.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "datagram listener stopped")
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.local.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_checksum_known_vector() {
        // Echo request, id 1, seq 1, no payload
        let frame = [8u8, 0, 0, 0, 0, 1, 0, 1];
        assert_eq!(checksum(&frame), 0xf7fd);
    }

    #[test]
    fn test_icmp_frame_checksums_to_zero() {
        let frame = icmp_frame(b"odd", SEQ_DIAL);
        assert_eq!(frame[0], ICMP_ECHO_REQUEST);
        assert_eq!(checksum(&frame), 0);
    }

    fn ipv4_header() -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header
    }

    #[test]
    fn test_raw_ip_drops_own_direction() {
        let mut outbound = ipv4_header();
        outbound.extend_from_slice(&ip_frame(b"hi", SEQ_DIAL));

        // The dialer reads only listener-stamped frames, so its own echo is skipped
        assert_eq!(frame_payload(Framing::Ip, &outbound, true, SEQ_LISTEN), None);
        let range = frame_payload(Framing::Ip, &outbound, true, SEQ_DIAL).unwrap();
        assert_eq!(&outbound[range], b"hi");

        let reply = ip_frame(b"ok", SEQ_LISTEN);
        let range = frame_payload(Framing::Ip, &reply, false, SEQ_LISTEN).unwrap();
        assert_eq!(&reply[range], b"ok");
        assert_eq!(frame_payload(Framing::Ip, &ipv4_header(), true, SEQ_DIAL), None);
    }

    #[test]
    fn test_icmp_payload_checks_sequence() {
        let mut inbound = ipv4_header();
        inbound.extend_from_slice(&icmp_frame(b"ping", SEQ_LISTEN));
        assert_eq!(frame_payload(Framing::Icmp, &inbound, true, SEQ_DIAL), None);
        let range = frame_payload(Framing::Icmp, &inbound, true, SEQ_LISTEN).unwrap();
        assert_eq!(&inbound[range], b"ping");
    }

    #[test]
    fn test_ip_connector_kind() {
        assert_eq!(IpConnector::icmp().kind(), "icmp");
        assert_eq!(IpConnector::new(17).kind(), "ip");
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let acceptor = UdpConnector.listen("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = UdpConnector.connect(&addr).await.unwrap();
        client.write_all(b"first").await.unwrap();

        let (mut conn, _peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        conn.write_all(b"reply").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
