//! Dispatch targets for reassembled packets

use crate::protocol::Packet;
use crate::session::Session;
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Receiver of packets that completed reassembly
///
/// `session` is `None` for oneshot packets, which arrive without a session.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, packet: Packet, session: Option<&Session>);

    /// Called once a client session finishes its handshake
    fn attach(&self, _session: &Session) {}

    /// Called when a session closes
    fn detach(&self, _id: Uuid) {}

    /// Introspection snapshot
    fn status(&self) -> serde_json::Value;
}

/// A dispatched packet waiting for the application
#[derive(Debug)]
pub struct Job {
    pub packet: Packet,
    pub session: Option<Session>,
}

/// Queues dispatched packets for the application to consume
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    received: AtomicU64,
    oneshots: AtomicU64,
    pending: AtomicUsize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("received", &self.received.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            received: AtomicU64::new(0),
            oneshots: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    /// Wait for the next dispatched packet
    pub async fn next(&self) -> Option<Job> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    /// Take a dispatched packet if one is already queued
    pub fn try_next(&self) -> Option<Job> {
        let job = self.rx.try_lock().ok()?.try_recv().ok();
        if job.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl Dispatch for Scheduler {
    fn dispatch(&self, packet: Packet, session: Option<&Session>) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if session.is_none() {
            self.oneshots.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            "[Scheduler] Job {} id={:#04x} from {} ({} bytes)",
            packet.job,
            packet.id,
            packet.device,
            packet.payload.len()
        );
        self.pending.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            packet,
            session: session.cloned(),
        };
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "received": self.received.load(Ordering::Relaxed),
            "oneshots": self.oneshots.load(Ordering::Relaxed),
            "pending": self.pending(),
        })
    }
}
