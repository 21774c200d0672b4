//! Session: one logical connection to a remote agent
//!
//! A session outlives the transport connections that carry it. Client
//! sessions poll their listener every `sleep ± jitter%`, opening a fresh
//! connection for each exchange. Listener-side sessions are fed by the
//! listener's connection handlers through [`Session::exchange`].
//!
//! Every session runs one loop task that owns its fragment table. The loop
//! exits on cancellation, on a `Shutdown` from the peer, or (client side)
//! after too many failed poll cycles, and acknowledges its close to the
//! owning listener when it has one.

use crate::connector::Connector;
use crate::protocol::{Packet, Pipeline, message};
use crate::server::Dispatch;
use crate::session::cluster::{FragmentTable, fragment};
use crate::util::Device;
use crate::util::limits::{
    FRAGMENT_SIZE, HANDSHAKE_TIMEOUT, MAX_ERRORS, SHUTDOWN_NOTICE_TIMEOUT,
};
use crate::util::{C2Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Handshaking = 1,
    Established = 2,
    Closing = 3,
    Closed = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Connecting,
            1 => State::Handshaking,
            2 => State::Established,
            3 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Introspection snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub host: String,
    pub hostname: String,
    pub os: String,
    pub pid: u32,
    pub state: State,
    pub sleep_ms: u64,
    pub jitter: u8,
    pub queued: usize,
    pub created: DateTime<Utc>,
}

/// Everything needed to build a session
pub(crate) struct SessionParts {
    pub device: Device,
    pub host: String,
    pub sleep: Duration,
    pub jitter: u8,
    pub size: usize,
    pub pipeline: Pipeline,
    /// Present for client sessions, which dial out on every poll
    pub connector: Option<Arc<dyn Connector>>,
    pub dispatch: Arc<dyn Dispatch>,
    pub cancel: CancellationToken,
}

struct SessionInner {
    device: Device,
    host: String,
    sleep: Duration,
    jitter: u8,
    size: usize,
    pipeline: Pipeline,
    connector: Option<Arc<dyn Connector>>,
    dispatch: Arc<dyn Dispatch>,
    state: AtomicU8,
    cancel: CancellationToken,
    send_tx: mpsc::Sender<Packet>,
    send_rx: Mutex<mpsc::Receiver<Packet>>,
    recv_tx: mpsc::Sender<Packet>,
    recv_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    done: watch::Sender<bool>,
    created: DateTime<Utc>,
}

/// Handle to a session; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("host", &self.inner.host)
            .field("state", &self.state())
            .finish()
    }
}

/// Why a session loop stopped
enum Exit {
    Cancelled,
    Remote,
    Failed,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let size = parts.size.max(1);
        let (send_tx, send_rx) = mpsc::channel(size);
        let (recv_tx, recv_rx) = mpsc::channel(size);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                device: parts.device,
                host: parts.host,
                sleep: parts.sleep,
                jitter: parts.jitter,
                size,
                pipeline: parts.pipeline,
                connector: parts.connector,
                dispatch: parts.dispatch,
                state: AtomicU8::new(State::Connecting as u8),
                cancel: parts.cancel,
                send_tx,
                send_rx: Mutex::new(send_rx),
                recv_tx,
                recv_rx: Mutex::new(Some(recv_rx)),
                done,
                created: Utc::now(),
            }),
        }
    }

    /// Device UUID of the remote agent (or of this process for client sessions)
    pub fn id(&self) -> Uuid {
        self.inner.device.id
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Remote address this session polls or was admitted from
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn sleep(&self) -> Duration {
        self.inner.sleep
    }

    pub fn jitter(&self) -> u8 {
        self.inner.jitter
    }

    /// Capacity of the send and receive queues
    pub fn queue_capacity(&self) -> usize {
        self.inner.size
    }

    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_client(&self) -> bool {
        self.inner.connector.is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancel.is_cancelled() && self.state() < State::Closing
    }

    pub(crate) fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`, failing when the session is elsewhere
    fn transition(&self, from: State, to: State) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the transport as connected and the Hello exchange as underway
    pub(crate) fn begin_handshake(&self) -> Result<()> {
        if self.transition(State::Connecting, State::Handshaking) {
            Ok(())
        } else {
            tracing::debug!("[Session] {} cannot handshake while {:?}", self.id(), self.state());
            Err(C2Error::SessionClosed)
        }
    }

    /// Queue a packet for the peer, waiting for queue space
    ///
    /// Payloads above `FRAGMENT_SIZE` are split into fragments sharing one job.
    pub async fn write(&self, packet: Packet) -> Result<()> {
        for part in self.prepare(packet)? {
            if !self.is_active() {
                return Err(C2Error::SessionClosed);
            }
            tokio::select! {
                sent = self.inner.send_tx.send(part) => sent.map_err(|_| C2Error::SessionClosed)?,
                _ = self.inner.cancel.cancelled() => return Err(C2Error::SessionClosed),
            }
        }
        Ok(())
    }

    /// Queue a packet without waiting; fails with `QueueFull` when it does not fit
    pub fn try_write(&self, packet: Packet) -> Result<()> {
        if !self.is_active() {
            return Err(C2Error::SessionClosed);
        }
        let parts = self.prepare(packet)?;
        if self.inner.send_tx.capacity() < parts.len() {
            return Err(C2Error::QueueFull);
        }
        for part in parts {
            self.inner.send_tx.try_send(part).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => C2Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => C2Error::SessionClosed,
            })?;
        }
        Ok(())
    }

    fn prepare(&self, mut packet: Packet) -> Result<Vec<Packet>> {
        packet.device = self.id();
        if packet.job == 0 && packet.payload.len() > FRAGMENT_SIZE {
            packet.job = new_job();
        }
        fragment(packet, FRAGMENT_SIZE)
    }

    /// Number of outbound packets waiting for the next exchange
    pub fn queued(&self) -> usize {
        self.inner.size - self.inner.send_tx.capacity()
    }

    fn next_outbound(&self) -> Option<Packet> {
        self.inner.send_rx.lock().ok()?.try_recv().ok()
    }

    /// Hand one inbound packet to the session and collect the reply
    ///
    /// Used by listeners for every packet a known device sends. A `Shutdown`
    /// closes the session; anything else is queued for reassembly and answered
    /// with the next outbound packet, or a `Nop` when nothing is waiting.
    pub(crate) async fn exchange(&self, packet: Packet) -> Result<Packet> {
        if !self.is_active() {
            return Err(C2Error::SessionClosed);
        }
        if packet.id == message::SHUTDOWN {
            tracing::info!("[Session] {} requested shutdown", self.id());
            self.inner.cancel.cancel();
            return Ok(Packet::new(message::SHUTDOWN).from_device(self.id()));
        }
        if !packet.is_nop() {
            self.deliver(packet).await?;
        }
        Ok(self
            .next_outbound()
            .unwrap_or_else(|| Packet::nop(self.id())))
    }

    /// Queue an inbound packet for reassembly and dispatch
    pub(crate) async fn deliver(&self, packet: Packet) -> Result<()> {
        self.inner
            .recv_tx
            .send(packet)
            .await
            .map_err(|_| C2Error::SessionClosed)
    }

    /// Spawn the session loop; `owner` receives the close acknowledgement
    ///
    /// Only a session that is handshaking can be established.
    pub(crate) fn start(&self, owner: Option<mpsc::Sender<Uuid>>) {
        if !self.transition(State::Handshaking, State::Established) {
            tracing::warn!("[Session] {} cannot start while {:?}", self.id(), self.state());
            return;
        }
        let Some(recv_rx) = self.inner.recv_rx.lock().ok().and_then(|mut r| r.take()) else {
            tracing::warn!("[Session] {} already started", self.id());
            return;
        };
        let span = info_span!(
            "c2link.session",
            session_id = %self.id(),
            host = %self.inner.host
        );
        let session = self.clone();
        tokio::spawn(session.run(recv_rx, owner).instrument(span));
    }

    async fn run(self, mut recv_rx: mpsc::Receiver<Packet>, owner: Option<mpsc::Sender<Uuid>>) {
        let mut table = FragmentTable::new();
        let client = self.is_client();
        let mut pending: Option<Packet> = None;
        let mut errors = 0u32;
        let mut deadline = next_poll(self.inner.sleep, self.inner.jitter);

        tracing::debug!("[Session] {} established", self.id());
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break Exit::Cancelled,
                Some(packet) = recv_rx.recv() => self.receive(&mut table, packet),
                _ = tokio::time::sleep_until(deadline), if client => {
                    let outcome = tokio::select! {
                        outcome = self.cycle(&mut pending, &mut table) => outcome,
                        _ = self.inner.cancel.cancelled() => break Exit::Cancelled,
                    };
                    match outcome {
                        Ok(true) => {
                            tracing::info!("[Session] {} closed by server", self.id());
                            break Exit::Remote;
                        }
                        Ok(false) => errors = 0,
                        Err(e) => {
                            errors += 1;
                            tracing::warn!(
                                "[Session] Poll of {} failed ({}/{}): {}",
                                self.inner.host,
                                errors,
                                MAX_ERRORS,
                                e
                            );
                            if errors >= MAX_ERRORS {
                                tracing::error!("[Session] {} giving up after {} errors", self.id(), errors);
                                break Exit::Failed;
                            }
                        }
                    }
                    deadline = next_poll(self.inner.sleep, self.inner.jitter);
                }
            }
        };

        self.set_state(State::Closing);
        self.inner.cancel.cancel();
        if client && matches!(exit, Exit::Cancelled) {
            self.notify_shutdown().await;
        }

        // Drain what already arrived, then drop partial clusters
        while let Ok(packet) = recv_rx.try_recv() {
            self.receive(&mut table, packet);
        }
        table.clear();
        drop(recv_rx);

        self.inner.dispatch.detach(self.id());
        self.set_state(State::Closed);
        if let Some(owner) = owner {
            let _ = owner.send(self.id()).await;
        }
        self.inner.done.send_replace(true);
        tracing::debug!("[Session] {} closed", self.id());
    }

    fn receive(&self, table: &mut FragmentTable, packet: Packet) {
        if let Some(packet) = table.insert(packet) {
            self.inner.dispatch.dispatch(packet, Some(self));
        }
    }

    /// One client poll: send the next packet, read the reply
    ///
    /// Returns `Ok(true)` when the server asked the session to shut down.
    async fn cycle(&self, pending: &mut Option<Packet>, table: &mut FragmentTable) -> Result<bool> {
        let packet = pending
            .take()
            .or_else(|| self.next_outbound())
            .unwrap_or_else(|| Packet::nop(self.id()));

        let reply = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.round_trip(&packet)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                if !packet.is_nop() {
                    *pending = Some(packet);
                }
                return Err(e);
            }
            Err(_) => {
                if !packet.is_nop() {
                    *pending = Some(packet);
                }
                return Err(C2Error::Protocol(format!(
                    "no reply from {} within {:?}",
                    self.inner.host, HANDSHAKE_TIMEOUT
                )));
            }
        };

        match reply.id {
            message::SHUTDOWN => Ok(true),
            _ if reply.is_nop() => Ok(false),
            _ => {
                self.receive(table, reply);
                Ok(false)
            }
        }
    }

    async fn round_trip(&self, packet: &Packet) -> Result<Packet> {
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or(C2Error::NoConnector)?;
        let host = &self.inner.host;
        let mut conn = connector
            .connect(host)
            .await
            .map_err(|e| C2Error::transport(format!("unable to connect to {}", host), e))?;

        let result = async {
            self.inner.pipeline.write_packet(&mut conn, packet).await?;
            self.inner
                .pipeline
                .read_packet(&mut conn)
                .await?
                .ok_or(C2Error::InvalidResponse)
        }
        .await;
        let _ = conn.shutdown().await;
        result
    }

    /// Best-effort `Shutdown` to the listener when closing locally
    async fn notify_shutdown(&self) {
        let Some(connector) = self.inner.connector.as_ref() else {
            return;
        };
        let mut packet = Packet::new(message::SHUTDOWN).from_device(self.id());
        packet.job = new_job();
        let host = self.inner.host.clone();
        let pipeline = &self.inner.pipeline;

        let notice = async {
            let mut conn = connector.connect(&host).await?;
            pipeline.write_packet(&mut conn, &packet).await?;
            let _ = pipeline.read_packet(&mut conn).await;
            let _ = conn.shutdown().await;
            Ok::<_, C2Error>(())
        };
        match tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, notice).await {
            Ok(Ok(())) => tracing::debug!("[Session] Shutdown delivered to {}", host),
            Ok(Err(e)) => tracing::debug!("[Session] Shutdown notice to {} failed: {}", host, e),
            Err(_) => tracing::debug!("[Session] Shutdown notice to {} timed out", host),
        }
    }

    /// Signal the session to close without waiting
    pub fn signal(&self) {
        self.inner.cancel.cancel();
    }

    /// Close the session and wait until its loop has finished
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        // A session that never started has no loop to wait for
        if let Some(rx) = self.inner.recv_rx.lock().ok().and_then(|mut r| r.take()) {
            drop(rx);
            self.set_state(State::Closed);
            self.inner.done.send_replace(true);
            return;
        }
        self.wait().await;
    }

    /// Wait until the session has closed
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id(),
            host: self.inner.host.clone(),
            hostname: self.inner.device.hostname.clone(),
            os: self.inner.device.os.clone(),
            pid: self.inner.device.pid,
            state: self.state(),
            sleep_ms: u64::try_from(self.inner.sleep.as_millis()).unwrap_or(u64::MAX),
            jitter: self.inner.jitter,
            queued: self.queued(),
            created: self.inner.created,
        }
    }
}

/// Random non-zero job ID
pub fn new_job() -> u16 {
    rand::random_range(1..=u16::MAX)
}

/// `sleep` adjusted by up to `jitter` percent in either direction
///
/// Saturates at `u64::MAX` milliseconds instead of wrapping.
pub fn jittered(sleep: Duration, jitter: u8) -> Duration {
    let base = sleep.as_millis().min(u128::from(u64::MAX));
    let spread = base * u128::from(jitter.min(100)) / 100;
    if spread == 0 {
        return sleep;
    }
    let offset = rand::random_range(0..=spread * 2);
    let millis = (base + offset - spread).max(1);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Far-off deadline used when a jittered sleep overflows `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn next_poll(sleep: Duration, jitter: u8) -> Instant {
    let now = Instant::now();
    now.checked_add(jittered(sleep, jitter))
        .unwrap_or_else(|| now + FAR_FUTURE)
}
