//! Fragment splitting and reassembly
//!
//! Large payloads travel as several packets sharing one job ID, each tagged
//! with its position and the total count. A [`Cluster`] collects the pieces
//! of one job; the [`FragmentTable`] holds the clusters of one session.

use crate::protocol::Packet;
use crate::util::limits::{CLUSTER_TTL, MAX_CLUSTERS, MAX_REASSEMBLY_BYTES};
use crate::util::{C2Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Split `packet` into fragments of at most `max` payload bytes
///
/// Packets that already fit are returned unchanged.
pub fn fragment(packet: Packet, max: usize) -> Result<Vec<Packet>> {
    if max == 0 || packet.payload.len() <= max {
        return Ok(vec![packet]);
    }
    let count = packet.payload.len().div_ceil(max);
    let count = u16::try_from(count).map_err(|_| {
        C2Error::InvalidPacket(format!(
            "payload of {} bytes needs too many fragments",
            packet.payload.len()
        ))
    })?;

    let mut out = Vec::with_capacity(count as usize);
    for (position, chunk) in packet.payload.chunks(max).enumerate() {
        let mut flags = packet.flags;
        flags.set_fragment(position as u16, count);
        out.push(Packet {
            id: packet.id,
            device: packet.device,
            job: packet.job,
            flags,
            payload: packet.payload.slice_ref(chunk),
        });
    }
    Ok(out)
}

/// Fragments of one job awaiting the rest of their siblings
///
/// Pieces are stored as they arrive, so memory follows what the peer has
/// actually sent rather than the count it claims.
#[derive(Debug)]
pub struct Cluster {
    head: Packet,
    count: u16,
    parts: BTreeMap<u16, Bytes>,
    size: usize,
    created: Instant,
}

impl Cluster {
    fn new(first: &Packet, now: Instant) -> Self {
        let mut head = first.clone();
        head.payload = Bytes::new();
        Self {
            head,
            count: first.flags.fragment_count(),
            parts: BTreeMap::new(),
            size: 0,
            created: now,
        }
    }

    /// Store one fragment; duplicates overwrite silently
    ///
    /// Returns the previous size of the slot.
    fn add(&mut self, packet: Packet) -> Result<usize> {
        let position = packet.flags.fragment_position();
        if packet.flags.fragment_count() != self.count {
            return Err(C2Error::InvalidPacket(format!(
                "fragment count changed for job {}",
                packet.job
            )));
        }
        if position >= self.count {
            return Err(C2Error::InvalidPacket(format!(
                "fragment position {} out of range",
                position
            )));
        }
        self.size += packet.payload.len();
        let previous = self.parts.insert(position, packet.payload).map_or(0, |b| b.len());
        self.size -= previous;
        Ok(previous)
    }

    pub fn is_complete(&self) -> bool {
        self.parts.len() == self.count as usize
    }

    /// Payload bytes buffered so far
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Rebuild the original packet, `None` while pieces are missing
    fn assemble(self) -> Option<Packet> {
        if !self.is_complete() {
            return None;
        }
        let mut payload = BytesMut::with_capacity(self.size);
        for part in self.parts.into_values() {
            payload.extend_from_slice(&part);
        }
        let mut packet = self.head;
        packet.flags.clear_fragment();
        packet.payload = payload.freeze();
        Some(packet)
    }
}

/// Reassembly table keyed by job ID
///
/// Bounded three ways: cluster count, cluster age and total buffered bytes.
/// Hitting either size bound evicts the oldest cluster first.
#[derive(Debug)]
pub struct FragmentTable {
    clusters: HashMap<u16, Cluster>,
    max: usize,
    ttl: Duration,
    budget: usize,
    bytes: usize,
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::with_limits(MAX_CLUSTERS, CLUSTER_TTL)
    }

    pub fn with_limits(max: usize, ttl: Duration) -> Self {
        Self {
            clusters: HashMap::new(),
            max: max.max(1),
            ttl,
            budget: MAX_REASSEMBLY_BYTES,
            bytes: 0,
        }
    }

    /// Cap the payload bytes buffered across all clusters
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Payload bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.bytes
    }

    /// Drop every pending cluster
    pub fn clear(&mut self) {
        self.clusters.clear();
        self.bytes = 0;
    }

    /// Feed one inbound packet
    ///
    /// Returns the packet to dispatch: non-fragments pass straight through,
    /// fragments yield the rebuilt packet once their job is complete.
    pub fn insert(&mut self, packet: Packet) -> Option<Packet> {
        self.insert_at(packet, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, packet: Packet, now: Instant) -> Option<Packet> {
        if !packet.is_fragment() {
            return Some(packet);
        }
        let count = packet.flags.fragment_count();
        if count == 0 || packet.flags.fragment_position() >= count {
            tracing::warn!(
                "[Cluster] Dropping fragment of job {} with position {}/{}",
                packet.job,
                packet.flags.fragment_position(),
                count
            );
            return None;
        }
        if count == 1 {
            let mut packet = packet;
            packet.flags.clear_fragment();
            return Some(packet);
        }
        let size = packet.payload.len();
        if size > self.budget {
            tracing::warn!(
                "[Cluster] Dropping {} byte fragment of job {} over the reassembly budget",
                size,
                packet.job
            );
            return None;
        }

        self.evict_expired(now);
        while self.bytes + size > self.budget && self.evict_oldest() {}

        let job = packet.job;
        if !self.clusters.contains_key(&job) {
            if self.clusters.len() >= self.max {
                self.evict_oldest();
            }
            self.clusters.insert(job, Cluster::new(&packet, now));
        }

        let cluster = self.clusters.get_mut(&job)?;
        match cluster.add(packet) {
            Ok(previous) => self.bytes = self.bytes + size - previous,
            Err(e) => {
                tracing::warn!("[Cluster] {}", e);
                return None;
            }
        }
        if !cluster.is_complete() {
            return None;
        }
        self.remove(job).and_then(Cluster::assemble)
    }

    /// Remove clusters older than the table's TTL, returning how many went
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let expired: Vec<u16> = self
            .clusters
            .iter()
            .filter(|(_, c)| c.age(now) >= ttl)
            .map(|(job, _)| *job)
            .collect();
        for job in &expired {
            self.remove(*job);
        }
        if !expired.is_empty() {
            tracing::debug!("[Cluster] Evicted {} expired clusters", expired.len());
        }
        expired.len()
    }

    fn remove(&mut self, job: u16) -> Option<Cluster> {
        let cluster = self.clusters.remove(&job)?;
        self.bytes -= cluster.size;
        Some(cluster)
    }

    /// Evict the oldest cluster, returning false when the table is empty
    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .clusters
            .iter()
            .min_by_key(|(_, c)| c.created)
            .map(|(job, _)| *job);
        match oldest {
            Some(job) => {
                tracing::debug!("[Cluster] Table full, evicting job {}", job);
                self.remove(job);
                true
            }
            None => false,
        }
    }
}
