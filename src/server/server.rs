//! Server: supervisor of listeners
//!
//! The server owns the listener registry and the scheduler that receives
//! packets from admitted sessions. A single event loop task mutates the
//! registry; everything else talks to it through channels.

use crate::client::{self, default_mux};
use crate::connector::Connector;
use crate::profile::Profile;
use crate::protocol::Packet;
use crate::server::listener::{ListenerParts, ListenerStatus};
use crate::server::{Dispatch, Listener, Scheduler};
use crate::session::Session;
use crate::util::limits::SMALL_LIMIT;
use crate::util::{C2Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Introspection snapshot of a server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub tasks: serde_json::Value,
    pub listeners: BTreeMap<String, ListenerStatus>,
}

enum ServerEvent {
    /// Claim a name before binding; replies `false` when taken
    Reserve(String, oneshot::Sender<bool>),
    Release(String),
    Listeners(oneshot::Sender<Vec<Listener>>),
}

struct ServerInner {
    cancel: CancellationToken,
    new_tx: mpsc::Sender<Listener>,
    close_tx: mpsc::Sender<String>,
    events_tx: mpsc::Sender<ServerEvent>,
    done: watch::Sender<bool>,
    scheduler: Arc<Scheduler>,
}

/// Handle to a server; clones share the same server
///
/// Construction spawns the event loop, so it must happen inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Server {
    /// Server with its own root cancellation and no logging span
    pub fn new() -> Self {
        Self::with_token(&CancellationToken::new(), None)
    }

    /// Server whose root is a child of `parent`
    ///
    /// The event loop runs inside `span`; without one it runs in a disabled
    /// span and logs nothing of its own.
    pub fn with_token(parent: &CancellationToken, span: Option<Span>) -> Self {
        let cancel = parent.child_token();
        let (new_tx, new_rx) = mpsc::channel(SMALL_LIMIT);
        let (close_tx, close_rx) = mpsc::channel(SMALL_LIMIT);
        let (events_tx, events_rx) = mpsc::channel(SMALL_LIMIT);
        let (done, _) = watch::channel(false);

        let server = Self {
            inner: Arc::new(ServerInner {
                cancel: cancel.clone(),
                new_tx,
                close_tx,
                events_tx,
                done: done.clone(),
                scheduler: Arc::new(Scheduler::new()),
            }),
        };
        let span = span.unwrap_or_else(Span::none);
        tokio::spawn(run(cancel, new_rx, close_rx, events_rx, done).instrument(span));
        server
    }

    /// Root token shared by every listener and session of this server
    pub fn token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Target of packets from sessions admitted by this server's listeners
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    /// Bind a new listener named `name` (case-insensitive) on `bind`
    ///
    /// Without an explicit connector the profile's setting is decoded; TLS and
    /// WC2 listeners need an explicit connector.
    pub async fn listen(
        &self,
        name: &str,
        bind: &str,
        connector: Option<Arc<dyn Connector>>,
        profile: Option<&Profile>,
    ) -> Result<Listener> {
        if !self.is_active() {
            return Err(C2Error::ServerClosed);
        }
        let connector = connector
            .or_else(|| profile.and_then(|p| p.setting().listener()))
            .ok_or(C2Error::NoConnector)?;
        let name = name.to_lowercase();
        if name.is_empty() {
            return Err(C2Error::Config("listener name cannot be empty".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .events_tx
            .send(ServerEvent::Reserve(name.clone(), tx))
            .await
            .map_err(|_| C2Error::ServerClosed)?;
        if !rx.await.map_err(|_| C2Error::ServerClosed)? {
            return Err(C2Error::ListenerExists(name));
        }

        let acceptor = match connector.listen(bind).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                let _ = self.inner.events_tx.send(ServerEvent::Release(name)).await;
                return Err(C2Error::transport(format!("unable to listen on {}", bind), e));
            }
        };

        let profile = profile.cloned().unwrap_or_default();
        let listener = Listener::new(ListenerParts {
            address: acceptor.local_addr().unwrap_or_else(|_| bind.to_string()),
            name,
            kind: connector.kind(),
            profile,
            cancel: self.inner.cancel.child_token(),
            dispatch: self.inner.scheduler.clone() as Arc<dyn Dispatch>,
        });
        self.inner
            .new_tx
            .send(listener.clone())
            .await
            .map_err(|_| C2Error::ServerClosed)?;
        listener.start(acceptor, self.inner.close_tx.clone());
        Ok(listener)
    }

    /// Client handshake using the profile's setting
    pub async fn connect(&self, address: &str, profile: &Profile) -> Result<Session> {
        self.connect_with(address, None, Some(profile), None).await
    }

    /// Client handshake under this server's root token
    pub async fn connect_with(
        &self,
        address: &str,
        connector: Option<Arc<dyn Connector>>,
        profile: Option<&Profile>,
        packet: Option<Packet>,
    ) -> Result<Session> {
        if !self.is_active() {
            return Err(C2Error::ServerClosed);
        }
        client::handshake(
            &self.inner.cancel,
            default_mux(),
            address,
            connector,
            profile,
            packet,
        )
        .await
    }

    /// Fire a single packet without creating a session
    pub async fn oneshot(
        &self,
        address: &str,
        connector: Option<Arc<dyn Connector>>,
        profile: Option<&Profile>,
        packet: Option<Packet>,
    ) -> Result<()> {
        client::oneshot(address, connector, profile, packet).await
    }

    /// Current listeners
    pub async fn listeners(&self) -> Vec<Listener> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .events_tx
            .send(ServerEvent::Listeners(tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn listener(&self, name: &str) -> Option<Listener> {
        let name = name.to_lowercase();
        self.listeners()
            .await
            .into_iter()
            .find(|l| l.name() == name)
    }

    /// Every session of every listener
    pub async fn connected(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for listener in self.listeners().await {
            sessions.extend(listener.connected().await);
        }
        sessions
    }

    pub async fn status(&self) -> ServerStatus {
        let mut listeners = BTreeMap::new();
        for listener in self.listeners().await {
            listeners.insert(listener.name().to_string(), listener.status().await);
        }
        ServerStatus {
            tasks: self.inner.scheduler.status(),
            listeners,
        }
    }

    /// Status as a JSON value
    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.status().await).unwrap_or_default()
    }

    /// Shut down every listener and session, then wait for the event loop
    pub async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.wait().await;
        Ok(())
    }

    /// Wait until the server has shut down
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }
}

async fn run(
    cancel: CancellationToken,
    mut new_rx: mpsc::Receiver<Listener>,
    mut close_rx: mpsc::Receiver<String>,
    mut events_rx: mpsc::Receiver<ServerEvent>,
    done: watch::Sender<bool>,
) {
    let mut active: HashMap<String, Listener> = HashMap::new();
    let mut reserved: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(listener) = new_rx.recv() => {
                let name = listener.name().to_string();
                reserved.remove(&name);
                tracing::info!("[Server] Added listener {} on {}", name, listener.address());
                active.insert(name, listener);
            }
            Some(name) = close_rx.recv() => {
                if active.remove(&name).is_some() {
                    tracing::info!("[Server] Removed listener {}", name);
                }
            }
            Some(event) = events_rx.recv() => match event {
                ServerEvent::Reserve(name, reply) => {
                    let free = !active.contains_key(&name) && reserved.insert(name);
                    let _ = reply.send(free);
                }
                ServerEvent::Release(name) => {
                    reserved.remove(&name);
                }
                ServerEvent::Listeners(reply) => {
                    let _ = reply.send(active.values().cloned().collect());
                }
            },
        }
    }

    tracing::debug!("[Server] Shutting down {} listeners", active.len());
    new_rx.close();
    while let Ok(listener) = new_rx.try_recv() {
        active.insert(listener.name().to_string(), listener);
    }
    events_rx.close();

    for listener in active.values() {
        listener.signal();
    }
    while !active.is_empty() {
        match close_rx.recv().await {
            Some(name) => {
                active.remove(&name);
            }
            None => break,
        }
    }
    done.send_replace(true);
    tracing::info!("[Server] Shutdown complete");
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
