use crate::connector::{Acceptor, Connection, Connector};
use crate::util::configure_tcp_stream;
use crate::util::limits::{HANDSHAKE_TIMEOUT, SMALL_LIMIT};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Pause after a failed accept in the upgrade loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Plain TCP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, address: &str) -> io::Result<Connection> {
        let stream = TcpStream::connect(address).await?;
        configure_tcp_stream(&stream, address);
        Ok(Box::new(stream))
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(bind).await?;
        tracing::debug!("[TCP] Bound {}", listener.local_addr()?);
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

/// Accepts plain TCP connections
pub struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<(Connection, String)> {
        let (stream, peer) = self.listener.accept().await?;
        let peer = peer.to_string();
        configure_tcp_stream(&stream, &peer);
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }
}

/// Server-side step turning an accepted TCP stream into a connection
#[async_trait]
pub(crate) trait Upgrade: Send + Sync + 'static {
    /// Short name for log lines
    fn label(&self) -> &'static str;

    /// `Ok(None)` when the peer was refused
    async fn upgrade(&self, stream: TcpStream, peer: &str) -> io::Result<Option<Connection>>;
}

/// TCP acceptor running each connection's upgrade in its own task
///
/// Finished upgrades queue up for `accept`, so a stalled peer only holds
/// its own task until `HANDSHAKE_TIMEOUT`.
pub(crate) struct UpgradeAcceptor {
    incoming: Mutex<mpsc::Receiver<(Connection, String)>>,
    local: SocketAddr,
    task: JoinHandle<()>,
}

impl UpgradeAcceptor {
    pub(crate) fn spawn<U: Upgrade>(listener: TcpListener, upgrade: U) -> io::Result<Self> {
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(SMALL_LIMIT);
        let task = tokio::spawn(upgrade_loop(listener, Arc::new(upgrade), tx));
        Ok(Self {
            incoming: Mutex::new(rx),
            local,
            task,
        })
    }
}

impl Drop for UpgradeAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Acceptor for UpgradeAcceptor {
    async fn accept(&self) -> io::Result<(Connection, String)> {
        self.incoming.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "upgrade listener stopped")
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.local.to_string())
    }
}

async fn upgrade_loop<U: Upgrade>(
    listener: TcpListener,
    upgrade: Arc<U>,
    tx: mpsc::Sender<(Connection, String)>,
) {
    let label = upgrade.label();
    loop {
        let accepted = tokio::select! {
            _ = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("[{}] Accept error: {}", label, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let peer = peer.to_string();
        configure_tcp_stream(&stream, &peer);

        let upgrade = Arc::clone(&upgrade);
        let tx = tx.clone();
        tokio::spawn(async move {
            let upgraded = tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade.upgrade(stream, &peer)).await;
            match upgraded {
                Ok(Ok(Some(conn))) => {
                    let _ = tx.send((conn, peer)).await;
                }
                Ok(Ok(None)) => tracing::debug!("[{}] Refused {}", label, peer),
                Ok(Err(e)) => tracing::debug!("[{}] Upgrade from {} failed: {}", label, peer, e),
                Err(_) => tracing::debug!("[{}] Upgrade from {} timed out", label, peer),
            }
        });
    }
    tracing::debug!("[{}] Upgrade loop stopped", label);
}
