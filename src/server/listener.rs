//! Listener: admits sessions arriving on one bound address
//!
//! Three kinds of task cooperate here. The accept loop hands each raw
//! connection to its own handler task. Handlers read one packet, answer it
//! and close the connection. The registry loop is the only place the session
//! map is touched; handlers reach it through channels.

use crate::connector::{Acceptor, Connection};
use crate::profile::Profile;
use crate::protocol::{Flags, Packet, Pipeline, decode_packet, message};
use crate::server::Dispatch;
use crate::session::{Session, SessionParts, SessionStatus};
use crate::util::limits::{HANDSHAKE_TIMEOUT, SMALL_LIMIT};
use crate::util::{C2Error, Device, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// Pause after a failed accept so a broken socket does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Introspection snapshot of a listener
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub address: String,
    pub connector: String,
    pub size: usize,
    pub sessions: Vec<SessionStatus>,
}

enum ListenerEvent {
    Lookup(Uuid, oneshot::Sender<Option<Session>>),
    Connected(oneshot::Sender<Vec<Session>>),
}

/// Everything a server hands to a new listener
pub(crate) struct ListenerParts {
    pub name: String,
    pub address: String,
    pub kind: &'static str,
    pub profile: Profile,
    pub cancel: CancellationToken,
    pub dispatch: Arc<dyn Dispatch>,
}

/// Receivers consumed when the loops start
struct Pending {
    new_rx: mpsc::Receiver<(Session, oneshot::Sender<Session>)>,
    events_rx: mpsc::Receiver<ListenerEvent>,
}

struct ListenerInner {
    name: String,
    address: String,
    kind: &'static str,
    sleep: Duration,
    jitter: u8,
    size: usize,
    pipeline: Pipeline,
    cancel: CancellationToken,
    dispatch: Arc<dyn Dispatch>,
    new_tx: mpsc::Sender<(Session, oneshot::Sender<Session>)>,
    events_tx: mpsc::Sender<ListenerEvent>,
    pending: std::sync::Mutex<Option<Pending>>,
    done: watch::Sender<bool>,
}

/// Handle to a listener; clones share the same listener
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("connector", &self.inner.kind)
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(parts: ListenerParts) -> Self {
        let (new_tx, new_rx) = mpsc::channel(SMALL_LIMIT);
        let (events_tx, events_rx) = mpsc::channel(SMALL_LIMIT);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ListenerInner {
                name: parts.name,
                address: parts.address,
                kind: parts.kind,
                sleep: parts.profile.sleep(),
                jitter: parts.profile.jitter(),
                size: parts.profile.size(),
                pipeline: parts.profile.pipeline(),
                cancel: parts.cancel,
                dispatch: parts.dispatch,
                new_tx,
                events_tx,
                pending: std::sync::Mutex::new(Some(Pending { new_rx, events_rx })),
                done,
            }),
        }
    }

    /// Case-folded registry name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Address the acceptor is bound to
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn connector_kind(&self) -> &'static str {
        self.inner.kind
    }

    /// Queue capacity given to admitted sessions
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Spawn the registry and accept loops
    ///
    /// `server_close` receives the listener name once every session is gone.
    pub(crate) fn start(&self, acceptor: Box<dyn Acceptor>, server_close: mpsc::Sender<String>) {
        let Some(pending) = self.inner.pending.lock().ok().and_then(|mut p| p.take()) else {
            tracing::warn!("[Listener] {} already started", self.inner.name);
            return;
        };
        let span = info_span!(
            "c2link.listener",
            listener = %self.inner.name,
            address = %self.inner.address
        );
        tokio::spawn(
            self.clone()
                .registry(pending, server_close)
                .instrument(span.clone()),
        );
        tokio::spawn(self.clone().accept_loop(acceptor).instrument(span));
        tracing::info!(
            "[Listener] {} listening on {} ({})",
            self.inner.name,
            self.inner.address,
            self.inner.kind
        );
    }

    async fn registry(self, pending: Pending, server_close: mpsc::Sender<String>) {
        let Pending {
            mut new_rx,
            mut events_rx,
        } = pending;
        let (close_tx, mut close_rx) = mpsc::channel::<Uuid>(SMALL_LIMIT);
        let mut sessions: HashMap<Uuid, Session> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                Some((session, reply)) = new_rx.recv() => {
                    let id = session.id();
                    if let Some(existing) = sessions.get(&id).filter(|s| s.is_active()) {
                        tracing::debug!("[Listener] Session {} already registered", id);
                        let _ = reply.send(existing.clone());
                        continue;
                    }
                    session.start(Some(close_tx.clone()));
                    tracing::info!(
                        "[Listener] New session {} ({}) from {}",
                        id,
                        session.device().hostname,
                        session.host()
                    );
                    sessions.insert(id, session.clone());
                    let _ = reply.send(session);
                }
                Some(id) = close_rx.recv() => {
                    // A replaced session may ack after its successor registered
                    if sessions.get(&id).is_some_and(|s| !s.is_active()) {
                        sessions.remove(&id);
                        tracing::info!("[Listener] Session {} removed", id);
                    }
                }
                Some(event) = events_rx.recv() => match event {
                    ListenerEvent::Lookup(id, reply) => {
                        let _ = reply.send(sessions.get(&id).cloned());
                    }
                    ListenerEvent::Connected(reply) => {
                        let _ = reply.send(sessions.values().cloned().collect());
                    }
                },
            }
        }

        tracing::debug!(
            "[Listener] {} shutting down with {} sessions",
            self.inner.name,
            sessions.len()
        );
        new_rx.close();
        while new_rx.try_recv().is_ok() {}
        events_rx.close();

        for session in sessions.values() {
            session.signal();
        }
        while !sessions.is_empty() {
            match close_rx.recv().await {
                Some(id) => {
                    sessions.remove(&id);
                }
                None => break,
            }
        }

        let _ = server_close.send(self.inner.name.clone()).await;
        self.inner.done.send_replace(true);
        tracing::info!("[Listener] {} closed", self.inner.name);
    }

    async fn accept_loop(self, acceptor: Box<dyn Acceptor>) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok((conn, peer)) => {
                    let span = info_span!("c2link.connection", peer_addr = %peer);
                    let listener = self.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle(conn, &peer).await {
                                tracing::debug!("[Listener] Dropped connection from {}: {}", peer, e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::warn!("[Listener] Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        tracing::debug!("[Listener] {} stopped accepting", self.inner.name);
    }

    /// Serve one raw connection: read a packet, answer it, close
    async fn handle(&self, mut conn: Connection, peer: &str) -> Result<()> {
        let result = self.serve(&mut conn, peer).await;
        let _ = conn.shutdown().await;
        result
    }

    async fn serve(&self, conn: &mut Connection, peer: &str) -> Result<()> {
        let pipeline = &self.inner.pipeline;
        let packet = tokio::time::timeout(HANDSHAKE_TIMEOUT, pipeline.read_packet(conn))
            .await
            .map_err(|_| C2Error::Protocol(format!("no packet from {} in time", peer)))??
            .ok_or(C2Error::InvalidResponse)?;

        if packet.is_oneshot() {
            tracing::debug!("[Listener] Oneshot job {} from {}", packet.job, peer);
            self.inner.dispatch.dispatch(packet, None);
            return Ok(());
        }

        let reply = if packet.id == message::HELLO {
            self.admit(packet, peer).await?
        } else {
            let session = self
                .lookup(packet.device)
                .await
                .ok_or_else(|| C2Error::Protocol(format!("unknown device {}", packet.device)))?;
            session.exchange(packet).await?
        };
        pipeline.write_packet(conn, &reply).await
    }

    /// Handle a Hello: register (or find) the device's session and confirm
    async fn admit(&self, hello: Packet, peer: &str) -> Result<Packet> {
        let mut payload = hello.payload.clone();
        let device = Device::unmarshal(&mut payload)?;
        let embedded = if hello.flags.has(Flags::DATA) {
            Some(decode_packet(payload).map_err(|e| C2Error::InvalidPacket(e.to_string()))?)
        } else {
            None
        };

        let session = Session::new(SessionParts {
            device,
            host: peer.to_string(),
            sleep: self.inner.sleep,
            jitter: self.inner.jitter,
            size: self.inner.size,
            pipeline: self.inner.pipeline.clone(),
            connector: None,
            dispatch: Arc::clone(&self.inner.dispatch),
            cancel: self.inner.cancel.child_token(),
        });
        session.begin_handshake()?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .new_tx
            .send((session, tx))
            .await
            .map_err(|_| C2Error::SessionClosed)?;
        let session = rx.await.map_err(|_| C2Error::SessionClosed)?;

        if let Some(packet) = embedded {
            session.deliver(packet).await?;
        }

        let mut complete = Packet::new(message::COMPLETE).from_device(session.id());
        complete.job = hello.job;
        Ok(complete)
    }

    async fn lookup(&self, id: Uuid) -> Option<Session> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .events_tx
            .send(ListenerEvent::Lookup(id, tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Snapshot of every registered session
    pub async fn connected(&self) -> Vec<Session> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .events_tx
            .send(ListenerEvent::Connected(tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> ListenerStatus {
        ListenerStatus {
            address: self.inner.address.clone(),
            connector: self.inner.kind.to_string(),
            size: self.inner.size,
            sessions: self.connected().await.iter().map(Session::status).collect(),
        }
    }

    /// Signal the listener to close without waiting
    pub(crate) fn signal(&self) {
        self.inner.cancel.cancel();
    }

    /// Close the listener and every session it admitted
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        // A listener that never started has nothing to drain
        if self.inner.pending.lock().ok().and_then(|mut p| p.take()).is_some() {
            self.inner.done.send_replace(true);
            return;
        }
        self.wait().await;
    }

    /// Wait until the listener has closed
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }
}
