//! Common test utilities and helpers

use async_trait::async_trait;
use bytes::BytesMut;
use c2link::connector::Acceptor;
use c2link::protocol::message;
use c2link::util::Device;
use c2link::{Connection, Connector, Packet, Pipeline};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, duplex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

/// Install a test subscriber once; later calls are ignored
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// How the far end of a [`StubConnector`] answers the first packet
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Reply {
    /// Reply with a packet of this message ID
    Message(u8),
    /// Reply with a frame that does not decode
    Garbage,
    /// Close without replying
    Hangup,
    /// Read the packet and never reply
    Silent,
    /// Answer the first connection with `Complete`, hang up on the rest
    CompleteThenHangup,
}

/// In-memory connector whose peer is a task answering one packet per connection
///
/// Every packet the peer reads is forwarded to `received`.
#[derive(Debug)]
pub struct StubConnector {
    reply: Reply,
    received: mpsc::UnboundedSender<Packet>,
    connects: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl StubConnector {
    pub fn new(reply: Reply) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (received, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            reply,
            received,
            connects: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            drops: Arc::new(AtomicUsize::new(0)),
        });
        (connector, rx)
    }

    /// Connector answering every packet with `Complete`
    pub fn complete() -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        Self::new(Reply::Message(message::COMPLETE))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn connect(&self, _address: &str) -> io::Result<Connection> {
        let previous = self.connects.fetch_add(1, Ordering::SeqCst);
        let (near, mut far) = duplex(256 * 1024);
        let reply = match &self.reply {
            Reply::CompleteThenHangup if previous == 0 => Reply::Message(message::COMPLETE),
            Reply::CompleteThenHangup => Reply::Hangup,
            other => other.clone(),
        };
        let received = self.received.clone();

        tokio::spawn(async move {
            let pipeline = Pipeline::default();
            let Ok(Some(packet)) = pipeline.read_packet(&mut far).await else {
                return;
            };
            let device = packet.device;
            let job = packet.job;
            let _ = received.send(packet);
            match reply {
                Reply::Message(id) => {
                    let mut answer = Packet::new(id).from_device(device);
                    answer.job = job;
                    let _ = pipeline.write_packet(&mut far, &answer).await;
                }
                Reply::Garbage => {
                    use tokio::io::AsyncWriteExt;
                    let _ = far.write_all(&[0, 0, 0, 3, 0xde, 0xad, 0xbf]).await;
                }
                Reply::Hangup | Reply::CompleteThenHangup => {}
                Reply::Silent => {
                    sleep(Duration::from_secs(3600)).await;
                }
            }
        });

        Ok(Box::new(CountingConn {
            inner: near,
            shutdowns: Arc::clone(&self.shutdowns),
            drops: Arc::clone(&self.drops),
        }))
    }

    async fn listen(&self, _bind: &str) -> io::Result<Box<dyn Acceptor>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stub connector cannot listen",
        ))
    }
}

/// Connector whose every dial fails
#[derive(Debug)]
pub struct FailingConnector;

#[async_trait]
impl Connector for FailingConnector {
    fn kind(&self) -> &'static str {
        "failing"
    }

    async fn connect(&self, _address: &str) -> io::Result<Connection> {
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    async fn listen(&self, _bind: &str) -> io::Result<Box<dyn Acceptor>> {
        Err(io::Error::from(io::ErrorKind::AddrInUse))
    }
}

/// Duplex end counting shutdowns and drops
pub struct CountingConn {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

impl AsyncRead for CountingConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for CountingConn {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A device distinct from the local one
#[allow(dead_code)]
pub fn test_device(hostname: &str) -> Device {
    Device {
        id: Uuid::new_v4(),
        hostname: hostname.to_string(),
        os: "linux".to_string(),
        pid: 4242,
    }
}

/// Send a Hello for `device` over plain TCP and return the reply
#[allow(dead_code)]
pub async fn send_hello(address: &str, device: &Device) -> anyhow::Result<Packet> {
    let mut payload = BytesMut::new();
    device.marshal(&mut payload);
    let mut hello = Packet::new(message::HELLO).from_device(device.id);
    hello.job = 9;
    hello.payload = payload.freeze();
    round_trip(address, &hello).await
}

/// One packet out, one packet back over plain TCP
#[allow(dead_code)]
pub async fn round_trip(address: &str, packet: &Packet) -> anyhow::Result<Packet> {
    let pipeline = Pipeline::default();
    let mut stream = TcpStream::connect(address).await?;
    pipeline.write_packet(&mut stream, packet).await?;
    pipeline
        .read_packet(&mut stream)
        .await?
        .ok_or_else(|| anyhow::anyhow!("connection closed without a reply"))
}

/// Wait for a condition to become true (with timeout)
#[allow(dead_code)]
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}
