//! Direct-neighbor tracking: liveness, link quality, topology hash.
//!
//! Every correctly authenticated frame counts as evidence that its
//! transmitter is alive one hop away. Entries expire after
//! [`NEIGHBOR_TIMEOUT_SECS`] of silence; eviction is reported to the caller
//! so routing can tear down paths through the lost neighbor.

use crate::types::{MAX_NEIGHBORS, NEIGHBOR_TIMEOUT_SECS, NodeAddr};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// EWMA smoothing for link quality: new = old + (sample - old) / 4.
const QUALITY_EWMA_SHIFT: u32 = 2;

/// One directly heard peer.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub addr: NodeAddr,
    pub last_heard: Instant,
    pub packet_count: u32,
    pub rssi_dbm: i16,
    pub snr_db: f32,
    /// Smoothed 0-255 link score derived from SNR and RSSI.
    pub link_quality: u8,
    /// Topology hash most recently claimed by this peer in a HELLO.
    pub observed_topology: Option<u32>,
    /// Set when the peer's hash has been compared since its last HELLO.
    pub topology_compared: bool,
}

/// Map an instantaneous RSSI/SNR measurement to a 0-255 link score.
///
/// SNR dominates (piecewise linear, -20 dB -> 0, +10 dB -> 200); RSSI adds
/// up to 55 points between -120 and -40 dBm.
pub fn link_score(rssi_dbm: i16, snr_db: f32) -> u8 {
    let snr_part = ((snr_db + 20.0) / 30.0 * 200.0).clamp(0.0, 200.0);
    let rssi_part = ((rssi_dbm as f32 + 120.0) / 80.0 * 55.0).clamp(0.0, 55.0);
    (snr_part + rssi_part).min(255.0) as u8
}

/// The neighbor table. Fixed capacity; owned by the engine loop.
pub struct NeighborTable {
    self_addr: NodeAddr,
    entries: HashMap<NodeAddr, NeighborEntry>,
}

impl NeighborTable {
    pub fn new(self_addr: NodeAddr) -> Self {
        Self { self_addr, entries: HashMap::with_capacity(MAX_NEIGHBORS) }
    }

    /// Fold a received frame's measurements into the table. Returns `true`
    /// when the transmitter is a new neighbor.
    pub fn observe(&mut self, addr: NodeAddr, rssi_dbm: i16, snr_db: f32, now: Instant) -> bool {
        if !addr.is_valid_source() {
            return false;
        }
        let sample = link_score(rssi_dbm, snr_db);

        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.last_heard = now;
            entry.packet_count = entry.packet_count.saturating_add(1);
            entry.rssi_dbm = rssi_dbm;
            entry.snr_db = snr_db;
            let old = entry.link_quality as i16;
            entry.link_quality =
                (old + ((sample as i16 - old) >> QUALITY_EWMA_SHIFT)) as u8;
            return false;
        }

        if self.entries.len() >= MAX_NEIGHBORS {
            // Full table: a newcomer only displaces the weakest link, and
            // only when it actually sounds better.
            let weakest = self
                .entries
                .values()
                .min_by_key(|e| e.link_quality)
                .map(|e| (e.addr, e.link_quality));
            match weakest {
                Some((victim, quality)) if sample > quality => {
                    debug!(evicted = %victim, newcomer = %addr, "neighbor table full, replacing weakest");
                    self.entries.remove(&victim);
                }
                _ => return false,
            }
        }

        trace!(neighbor = %addr, quality = sample, "new neighbor");
        self.entries.insert(
            addr,
            NeighborEntry {
                addr,
                last_heard: now,
                packet_count: 1,
                rssi_dbm,
                snr_db,
                link_quality: sample,
                observed_topology: None,
                topology_compared: false,
            },
        );
        true
    }

    /// Record the topology hash a peer announced in a HELLO. Returns `true`
    /// when the announced value differs from the peer's previous one — the
    /// signal that the network around us is actually changing shape.
    pub fn record_topology(&mut self, addr: NodeAddr, hash: u32) -> bool {
        match self.entries.get_mut(&addr) {
            Some(entry) => {
                let changed = entry.observed_topology != Some(hash);
                entry.observed_topology = Some(hash);
                entry.topology_compared = false;
                changed
            }
            None => false,
        }
    }

    /// True when any peer's last announced hash disagrees with `local`.
    /// Marks every compared entry, satisfying the "compared recently" bit.
    pub fn any_topology_divergence(&mut self, local: u32) -> bool {
        let mut divergent = false;
        for entry in self.entries.values_mut() {
            if let Some(observed) = entry.observed_topology {
                entry.topology_compared = true;
                if observed != local {
                    divergent = true;
                }
            }
        }
        divergent
    }

    /// Remove every neighbor silent past the timeout; returns the evicted
    /// addresses so routing can invalidate paths through them.
    pub fn scavenge(&mut self, now: Instant) -> Vec<NodeAddr> {
        let timeout = Duration::from_secs(NEIGHBOR_TIMEOUT_SECS);
        let dead: Vec<NodeAddr> = self
            .entries
            .values()
            .filter(|e| now.saturating_duration_since(e.last_heard) > timeout)
            .map(|e| e.addr)
            .collect();
        for addr in &dead {
            debug!(neighbor = %addr, "neighbor timed out");
            self.entries.remove(addr);
        }
        dead
    }

    pub fn get(&self, addr: NodeAddr) -> Option<&NeighborEntry> {
        self.entries.get(&addr)
    }

    pub fn contains(&self, addr: NodeAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    /// Link quality toward a direct neighbor, 0 if unknown.
    pub fn quality_of(&self, addr: NodeAddr) -> u8 {
        self.entries.get(&addr).map(|e| e.link_quality).unwrap_or(0)
    }

    /// FNV-1a over the sorted local roster (our address plus every current
    /// neighbor, little-endian bytes). Including ourselves makes the digest
    /// converge across a fully connected component, so two nodes with the
    /// same view agree on the hash.
    pub fn topology_hash(&self) -> u32 {
        let mut addrs: Vec<u32> = self.entries.keys().map(|a| a.to_u32()).collect();
        addrs.push(self.self_addr.to_u32());
        addrs.sort_unstable();

        let mut hash: u32 = 0x811C_9DC5;
        for addr in addrs {
            for byte in addr.to_le_bytes() {
                hash ^= byte as u32;
                hash = hash.wrapping_mul(0x0100_0193);
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF: NodeAddr = NodeAddr(0xAA);

    #[test]
    fn test_link_score_mapping() {
        // Strong link: high SNR, hot RSSI.
        assert!(link_score(-40, 10.0) >= 250);
        // Floor.
        assert_eq!(link_score(-120, -20.0), 0);
        // Mid-range link lands mid-range.
        let mid = link_score(-90, 0.0);
        assert!((100..=180).contains(&mid), "mid score {mid}");
    }

    #[test]
    fn test_observe_tracks_liveness_and_count() {
        let mut table = NeighborTable::new(SELF);
        let now = Instant::now();
        assert!(table.observe(NodeAddr(5), -80, 5.0, now));
        assert!(!table.observe(NodeAddr(5), -80, 5.0, now));

        let entry = table.get(NodeAddr(5)).unwrap();
        assert_eq!(entry.packet_count, 2);
    }

    #[test]
    fn test_invalid_sources_ignored() {
        let mut table = NeighborTable::new(SELF);
        let now = Instant::now();
        assert!(!table.observe(NodeAddr::BROADCAST, -80, 5.0, now));
        assert!(!table.observe(NodeAddr::UNSET, -80, 5.0, now));
        assert!(table.is_empty());
    }

    #[test]
    fn test_quality_ewma_converges() {
        let mut table = NeighborTable::new(SELF);
        let now = Instant::now();
        table.observe(NodeAddr(5), -120, -20.0, now); // score 0
        let q0 = table.quality_of(NodeAddr(5));
        for _ in 0..32 {
            table.observe(NodeAddr(5), -40, 10.0, now); // score 255
        }
        let q = table.quality_of(NodeAddr(5));
        assert!(q > q0);
        assert!(q > 220, "EWMA should converge upward, got {q}");
    }

    #[test]
    fn test_scavenge_evicts_silent_neighbors() {
        let mut table = NeighborTable::new(SELF);
        let now = Instant::now();
        table.observe(NodeAddr(1), -80, 5.0, now);
        table.observe(NodeAddr(2), -80, 5.0, now + Duration::from_secs(45));

        let later = now + Duration::from_secs(NEIGHBOR_TIMEOUT_SECS + 1);
        let evicted = table.scavenge(later);
        assert_eq!(evicted, vec![NodeAddr(1)]);
        assert!(table.contains(NodeAddr(2)));
        assert!(!table.contains(NodeAddr(1)));
    }

    #[test]
    fn test_full_table_replaces_only_weaker() {
        let mut table = NeighborTable::new(SELF);
        let now = Instant::now();
        for i in 0..MAX_NEIGHBORS as u32 {
            table.observe(NodeAddr(100 + i), -90, 2.0, now);
        }
        assert_eq!(table.len(), MAX_NEIGHBORS);

        // A weaker newcomer bounces.
        assert!(!table.observe(NodeAddr(999), -120, -18.0, now));
        assert!(!table.contains(NodeAddr(999)));

        // A stronger one displaces the weakest.
        assert!(table.observe(NodeAddr(1000), -50, 9.0, now));
        assert!(table.contains(NodeAddr(1000)));
        assert_eq!(table.len(), MAX_NEIGHBORS);
    }

    #[test]
    fn test_topology_hash_order_independent() {
        let now = Instant::now();
        let mut a = NeighborTable::new(SELF);
        a.observe(NodeAddr(1), -80, 5.0, now);
        a.observe(NodeAddr(2), -80, 5.0, now);

        let mut b = NeighborTable::new(SELF);
        b.observe(NodeAddr(2), -80, 5.0, now);
        b.observe(NodeAddr(1), -80, 5.0, now);

        assert_eq!(a.topology_hash(), b.topology_hash());

        b.observe(NodeAddr(3), -80, 5.0, now);
        assert_ne!(a.topology_hash(), b.topology_hash());
    }
}
