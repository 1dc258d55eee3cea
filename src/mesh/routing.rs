//! On-demand route discovery bookkeeping and partition detection.
//!
//! The engine owns the tables; this module owns the discovery protocol
//! state: which `(origin, request_id)` floods we have already relayed, which
//! discoveries we originated and are still waiting on, the packets buffered
//! behind them, and the topology-divergence streak that detects partitions.

use super::codec::Frame;
use crate::types::{NodeAddr, PARTITION_DETECT_THRESHOLD, SEEN_PACKET_TIMEOUT_SECS};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// A discovery that produced no reply by this deadline has failed.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Packets buffered per destination while its discovery runs.
pub const PENDING_FORWARD_BUFFER: usize = 4;

/// Relayed `(origin, request_id)` pairs remembered for loop suppression.
const SEEN_REQUESTS: usize = 32;

/// Counters surfaced via status.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutingStats {
    pub requests_sent: u64,
    pub requests_relayed: u64,
    pub replies_sent: u64,
    pub errors_sent: u64,
    pub forwarded: u64,
    pub ttl_drops: u64,
    pub no_route_drops: u64,
    pub partition_events: u64,
}

struct PendingDiscovery {
    request_id: u16,
    deadline: Instant,
    buffered: Vec<Frame>,
}

/// Discovery and partition state. Owned by the engine loop.
pub struct Routing {
    next_request_id: u16,
    /// Ring of relayed request pairs, for flood suppression.
    seen_requests: Vec<(NodeAddr, u16, Instant)>,
    seen_cursor: usize,
    pending: HashMap<NodeAddr, PendingDiscovery>,
    /// Consecutive broadcast periods with divergent topology hashes.
    divergence_streak: u8,
    /// Set by a topology change (ours or an announced one); divergence only
    /// counts while armed, so a stable disagreement between vantage points
    /// cannot fire forever.
    divergence_armed: bool,
    pub stats: RoutingStats,
}

impl Routing {
    pub fn new() -> Self {
        Self {
            next_request_id: 1,
            seen_requests: Vec::with_capacity(SEEN_REQUESTS),
            seen_cursor: 0,
            pending: HashMap::new(),
            divergence_streak: 0,
            divergence_armed: false,
            stats: RoutingStats::default(),
        }
    }

    // =========================================================================
    // DISCOVERY ORIGINATION
    // =========================================================================

    /// Begin (or join) a discovery toward `target`. Returns the request id
    /// to broadcast, or `None` when one is already in flight — the caller
    /// just buffers behind it.
    pub fn start_discovery(&mut self, target: NodeAddr, now: Instant) -> Option<u16> {
        if self.pending.contains_key(&target) {
            return None;
        }
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        self.pending.insert(
            target,
            PendingDiscovery {
                request_id,
                deadline: now + DISCOVERY_TIMEOUT,
                buffered: Vec::with_capacity(PENDING_FORWARD_BUFFER),
            },
        );
        self.stats.requests_sent += 1;
        debug!(target = %target, request_id, "route discovery started");
        Some(request_id)
    }

    pub fn discovery_in_flight(&self, target: NodeAddr) -> bool {
        self.pending.contains_key(&target)
    }

    /// Park a frame behind a running discovery. Full buffer is backpressure:
    /// the frame is dropped and the caller reports it.
    pub fn buffer_frame(&mut self, target: NodeAddr, frame: Frame) -> bool {
        match self.pending.get_mut(&target) {
            Some(discovery) if discovery.buffered.len() < PENDING_FORWARD_BUFFER => {
                discovery.buffered.push(frame);
                true
            }
            _ => false,
        }
    }

    /// A route to `target` was installed: finish the discovery and drain
    /// whatever was parked behind it.
    pub fn complete_discovery(&mut self, target: NodeAddr) -> Vec<Frame> {
        match self.pending.remove(&target) {
            Some(discovery) => {
                trace!(target = %target, drained = discovery.buffered.len(), "discovery complete");
                discovery.buffered
            }
            None => Vec::new(),
        }
    }

    /// Expire overdue discoveries. Returns each failed target with its
    /// stranded frames so the engine can surface NoRoute.
    pub fn expire_discoveries(&mut self, now: Instant) -> Vec<(NodeAddr, Vec<Frame>)> {
        let overdue: Vec<NodeAddr> = self
            .pending
            .iter()
            .filter(|(_, d)| now >= d.deadline)
            .map(|(t, _)| *t)
            .collect();
        overdue
            .into_iter()
            .filter_map(|target| {
                let discovery = self.pending.remove(&target)?;
                self.stats.no_route_drops += discovery.buffered.len() as u64;
                debug!(target = %target, "route discovery timed out");
                Some((target, discovery.buffered))
            })
            .collect()
    }

    /// Next discovery deadline, for the engine's timer heap.
    pub fn next_discovery_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|d| d.deadline).min()
    }

    // =========================================================================
    // FLOOD SUPPRESSION
    // =========================================================================

    /// Returns `true` the first time a `(origin, request_id)` flood reaches
    /// us within the suppression window; relays and repeat deliveries get
    /// `false`.
    pub fn first_sighting(&mut self, origin: NodeAddr, request_id: u16, now: Instant) -> bool {
        let ttl = Duration::from_secs(SEEN_PACKET_TIMEOUT_SECS);
        if self
            .seen_requests
            .iter()
            .any(|(o, id, at)| {
                *o == origin && *id == request_id && now.saturating_duration_since(*at) < ttl
            })
        {
            return false;
        }
        if self.seen_requests.len() < SEEN_REQUESTS {
            self.seen_requests.push((origin, request_id, now));
        } else {
            self.seen_requests[self.seen_cursor] = (origin, request_id, now);
            self.seen_cursor = (self.seen_cursor + 1) % SEEN_REQUESTS;
        }
        true
    }

    // =========================================================================
    // PARTITION DETECTION
    // =========================================================================

    /// Note that the topology is in motion: our own hash changed, or a peer
    /// announced a hash different from its previous one. Arms the detector.
    pub fn note_topology_change(&mut self) {
        if !self.divergence_armed {
            trace!("topology change observed, divergence detector armed");
        }
        self.divergence_armed = true;
    }

    /// Evaluate once per topology-broadcast period. `divergent` is whether
    /// any peer's announced hash disagrees with ours. Three consecutive
    /// divergent periods after a topology change mean the network changed
    /// shape around us — a partition formed or healed — and aggressive
    /// rediscovery is warranted. The detector then disarms until the next
    /// change, so two nodes with stably different vantage points do not
    /// re-fire forever.
    pub fn evaluate_partition(&mut self, divergent: bool) -> bool {
        if !divergent {
            self.divergence_streak = 0;
            self.divergence_armed = false;
            return false;
        }
        if !self.divergence_armed {
            return false;
        }
        self.divergence_streak = self.divergence_streak.saturating_add(1);
        trace!(streak = self.divergence_streak, "topology hash divergence");
        if self.divergence_streak >= PARTITION_DETECT_THRESHOLD {
            self.divergence_streak = 0;
            self.divergence_armed = false;
            self.stats.partition_events += 1;
            info!(
                events = self.stats.partition_events,
                "partition detected, entering aggressive discovery"
            );
            return true;
        }
        false
    }

    pub fn partition_events(&self) -> u64 {
        self.stats.partition_events
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new()
    }
}
