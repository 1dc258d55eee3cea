//! Reliable delivery: per-destination ARQ with adaptive retransmission.
//!
//! Every ACK-required DATA packet occupies one pending slot until the
//! matching ACK arrives or retries are exhausted. Timeouts start at the
//! destination's estimated RTO and double per attempt, capped at
//! [`RETRY_TIMEOUT_CAP_SECS`], each with up to 500 ms of decorrelating
//! jitter. RTT estimation follows RFC 6298 with Karn's rule: packets that
//! were ever retransmitted contribute no samples.

use super::SendError;
use super::codec::Frame;
use crate::types::{
    MAX_RETRIES, NodeAddr, RETRY_JITTER_MAX_MS, RETRY_TIMEOUT_CAP_SECS, SEEN_PACKET_CACHE,
    SEEN_PACKET_TIMEOUT_SECS, TX_WINDOW_SIZE,
};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// RFC 6298 smoothing gains.
const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;

/// Destinations with RTT state tracked at once.
const MAX_RTT_PEERS: usize = 64;

/// Smoothed round-trip state for one destination.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto: Duration,
    samples: u32,
}

impl RttEstimator {
    fn new(default_rto: Duration) -> Self {
        Self { srtt_ms: 0.0, rttvar_ms: 0.0, rto: default_rto, samples: 0 }
    }

    /// Fold in one sample from a never-retransmitted packet.
    fn update(&mut self, sample: Duration, default_rto: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        if self.samples == 0 {
            self.srtt_ms = sample_ms;
            self.rttvar_ms = sample_ms / 2.0;
        } else {
            self.rttvar_ms =
                (1.0 - RTT_BETA) * self.rttvar_ms + RTT_BETA * (sample_ms - self.srtt_ms).abs();
            self.srtt_ms = (1.0 - RTT_ALPHA) * self.srtt_ms + RTT_ALPHA * sample_ms;
        }
        self.samples += 1;

        let rto_ms = (self.srtt_ms + 4.0 * self.rttvar_ms)
            .clamp(default_rto.as_secs_f64() * 1000.0, RETRY_TIMEOUT_CAP_SECS as f64 * 1000.0);
        self.rto = Duration::from_millis(rto_ms as u64);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        (self.samples > 0).then(|| Duration::from_secs_f64(self.srtt_ms / 1000.0))
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// One outstanding ACK-required packet, with everything needed to resend it.
#[derive(Debug, Clone)]
struct PendingSlot {
    dest: NodeAddr,
    packet_id: u16,
    frame: Frame,
    first_sent: Instant,
    retries: u8,
    timeout: Duration,
    deadline: Instant,
    retransmitted: bool,
}

/// What to do when a pending slot's deadline fires.
#[derive(Debug)]
pub enum TimeoutAction {
    /// Resend this frame (IS_RETRY set) and re-arm at the new deadline.
    Retransmit { frame: Frame, deadline: Instant },
    /// Retries exhausted: release the slot and report the failure. The
    /// next hop the frame was using identifies the failed link.
    Failed { dest: NodeAddr, packet_id: u16, next_hop: NodeAddr },
    /// The slot was already released (late timer); nothing to do.
    Released,
}

/// Duplicate-suppression verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenStatus {
    New,
    Duplicate,
}

/// Fixed ring of recently seen `(source, packet_id)` pairs.
struct SeenCache {
    entries: Vec<(NodeAddr, u16, Instant)>,
    cursor: usize,
}

impl SeenCache {
    fn new() -> Self {
        Self { entries: Vec::with_capacity(SEEN_PACKET_CACHE), cursor: 0 }
    }

    fn check_and_record(&mut self, source: NodeAddr, packet_id: u16, now: Instant) -> SeenStatus {
        let ttl = Duration::from_secs(SEEN_PACKET_TIMEOUT_SECS);
        if self
            .entries
            .iter()
            .any(|(s, id, at)| {
                *s == source && *id == packet_id && now.saturating_duration_since(*at) < ttl
            })
        {
            return SeenStatus::Duplicate;
        }
        if self.entries.len() < SEEN_PACKET_CACHE {
            self.entries.push((source, packet_id, now));
        } else {
            self.entries[self.cursor] = (source, packet_id, now);
            self.cursor = (self.cursor + 1) % SEEN_PACKET_CACHE;
        }
        SeenStatus::New
    }
}

/// Transport counters surfaced via status.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub sent: u64,
    pub acked: u64,
    pub retransmits: u64,
    pub failed: u64,
    pub duplicates_dropped: u64,
    pub reacks: u64,
}

/// ARQ state. Owned by the engine loop.
pub struct Transport {
    slots: Vec<PendingSlot>,
    rtt: HashMap<NodeAddr, RttEstimator>,
    seen: SeenCache,
    next_packet_id: u16,
    default_rto: Duration,
    stats: TransportStats,
}

impl Transport {
    pub fn new(default_rto: Duration) -> Self {
        Self {
            slots: Vec::with_capacity(TX_WINDOW_SIZE),
            rtt: HashMap::new(),
            seen: SeenCache::new(),
            next_packet_id: 1,
            default_rto,
            stats: TransportStats::default(),
        }
    }

    /// Allocate the next packet id (never 0).
    pub fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    pub fn window_available(&self) -> bool {
        self.slots.len() < TX_WINDOW_SIZE
    }

    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Current retransmission timeout toward `dest`.
    pub fn rto_for(&self, dest: NodeAddr) -> Duration {
        self.rtt.get(&dest).map(|e| e.rto()).unwrap_or(self.default_rto)
    }

    pub fn estimator_for(&self, dest: NodeAddr) -> Option<&RttEstimator> {
        self.rtt.get(&dest)
    }

    /// Claim a pending slot for an ACK-required frame just handed to the
    /// MAC. Returns the retransmission deadline to arm, or the backpressure
    /// error when the window is full.
    pub fn register(&mut self, frame: Frame, now: Instant) -> Result<Instant, SendError> {
        if self.slots.len() >= TX_WINDOW_SIZE {
            return Err(SendError::WindowFull(self.slots.len()));
        }
        let timeout = self.rto_for(frame.header.dest);
        let deadline = now + timeout;
        trace!(
            dest = %frame.header.dest,
            packet_id = frame.header.packet_id,
            timeout_ms = timeout.as_millis() as u64,
            "pending slot armed"
        );
        self.slots.push(PendingSlot {
            dest: frame.header.dest,
            packet_id: frame.header.packet_id,
            frame,
            first_sent: now,
            retries: 0,
            timeout,
            deadline,
            retransmitted: false,
        });
        self.stats.sent += 1;
        Ok(deadline)
    }

    /// Process an ACK from `from` for `acked_id`. Returns `true` when it
    /// cleared a pending slot.
    pub fn on_ack(&mut self, from: NodeAddr, acked_id: u16, now: Instant) -> bool {
        let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.packet_id == acked_id && s.dest == from)
        else {
            return false;
        };
        let slot = self.slots.swap_remove(idx);
        self.stats.acked += 1;

        // Karn's rule: a retransmitted packet's ACK cannot be attributed to
        // a specific attempt, so it contributes no RTT sample.
        if !slot.retransmitted {
            let sample = now.saturating_duration_since(slot.first_sent);
            if self.rtt.len() >= MAX_RTT_PEERS && !self.rtt.contains_key(&slot.dest) {
                self.drop_stalest_estimator();
            }
            let default_rto = self.default_rto;
            self.rtt
                .entry(slot.dest)
                .or_insert_with(|| RttEstimator::new(default_rto))
                .update(sample, default_rto);
        }
        debug!(dest = %slot.dest, packet_id = acked_id, retries = slot.retries, "acked");
        true
    }

    /// Handle a retransmission timer for `packet_id`. The caller re-sends
    /// the returned frame (already flagged IS_RETRY) and re-arms the timer,
    /// or releases the destination on failure.
    pub fn on_timeout<R: Rng>(
        &mut self,
        packet_id: u16,
        now: Instant,
        rng: &mut R,
    ) -> TimeoutAction {
        let Some(idx) = self.slots.iter().position(|s| s.packet_id == packet_id) else {
            return TimeoutAction::Released;
        };
        // A timer can fire early relative to a slot re-armed by a prior
        // retransmission; ignore it until the real deadline.
        if self.slots[idx].deadline > now + Duration::from_millis(1) {
            return TimeoutAction::Released;
        }

        if self.slots[idx].retries >= MAX_RETRIES {
            let slot = self.slots.swap_remove(idx);
            self.stats.failed += 1;
            warn!(dest = %slot.dest, packet_id, "delivery failed after {MAX_RETRIES} retries");
            return TimeoutAction::Failed {
                dest: slot.dest,
                packet_id,
                next_hop: slot.frame.header.next_hop,
            };
        }

        let slot = &mut self.slots[idx];
        slot.retries += 1;
        slot.retransmitted = true;
        slot.timeout = (slot.timeout * 2).min(Duration::from_secs(RETRY_TIMEOUT_CAP_SECS));
        let jitter = Duration::from_millis(rng.gen_range(0..=RETRY_JITTER_MAX_MS));
        slot.deadline = now + slot.timeout + jitter;
        slot.frame.header.flags.set_is_retry(true);
        self.stats.retransmits += 1;
        debug!(
            dest = %slot.dest,
            packet_id,
            attempt = slot.retries,
            next_timeout_ms = slot.timeout.as_millis() as u64,
            "retransmitting"
        );
        TimeoutAction::Retransmit { frame: slot.frame.clone(), deadline: slot.deadline }
    }

    /// Point an outstanding frame at a different next hop (route failover
    /// between retries). Later retransmissions use the new relay.
    pub fn update_next_hop(&mut self, packet_id: u16, next_hop: NodeAddr) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.packet_id == packet_id) {
            slot.frame.header.next_hop = next_hop;
        }
    }

    /// Release every slot toward a destination (its route died). Returns the
    /// packet ids that were abandoned.
    pub fn abort_dest(&mut self, dest: NodeAddr) -> Vec<u16> {
        let mut dropped = Vec::new();
        self.slots.retain(|s| {
            if s.dest == dest {
                dropped.push(s.packet_id);
                false
            } else {
                true
            }
        });
        self.stats.failed += dropped.len() as u64;
        dropped
    }

    /// Duplicate suppression for a received DATA packet.
    pub fn check_seen(&mut self, source: NodeAddr, packet_id: u16, now: Instant) -> SeenStatus {
        let status = self.seen.check_and_record(source, packet_id, now);
        if status == SeenStatus::Duplicate {
            self.stats.duplicates_dropped += 1;
        }
        status
    }

    pub fn note_reack(&mut self) {
        self.stats.reacks += 1;
    }

    /// Pending-slot invariants, asserted by tests and the status command:
    /// retries and timeouts never exceed their caps.
    pub fn slots_within_bounds(&self) -> bool {
        self.slots.iter().all(|s| {
            s.retries <= MAX_RETRIES && s.timeout <= Duration::from_secs(RETRY_TIMEOUT_CAP_SECS)
        })
    }

    fn drop_stalest_estimator(&mut self) {
        let victim = self
            .rtt
            .iter()
            .min_by_key(|(_, e)| e.samples)
            .map(|(addr, _)| *addr);
        if let Some(addr) = victim {
            self.rtt.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::codec::{PacketHeader, PacketType};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const B: NodeAddr = NodeAddr(2);

    fn data_frame(dest: NodeAddr, packet_id: u16) -> Frame {
        let mut header = PacketHeader::new(PacketType::Data, NodeAddr(1), dest);
        header.packet_id = packet_id;
        header.flags.set_ack_req(true);
        Frame::new(header, b"payload".to_vec()).unwrap()
    }

    fn transport() -> Transport {
        Transport::new(Duration::from_secs(3))
    }

    #[test]
    fn test_window_backpressure() {
        let mut t = transport();
        let now = Instant::now();
        for i in 0..TX_WINDOW_SIZE as u16 {
            t.register(data_frame(B, i + 1), now).unwrap();
        }
        assert!(matches!(
            t.register(data_frame(B, 99), now),
            Err(SendError::WindowFull(n)) if n == TX_WINDOW_SIZE
        ));
    }

    #[test]
    fn test_ack_clears_slot_and_samples_rtt() {
        let mut t = transport();
        let now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();

        assert!(t.on_ack(B, 7, now + Duration::from_millis(800)));
        assert_eq!(t.outstanding(), 0);

        let est = t.estimator_for(B).unwrap();
        assert_eq!(est.samples(), 1);
        let srtt = est.srtt().unwrap();
        assert!((srtt.as_millis() as i64 - 800).abs() < 5);
        // First sample: rto = srtt + 4 * (srtt/2) = 3 * srtt = 2.4s, below
        // the 3s floor, so the default still applies.
        assert_eq!(t.rto_for(B), Duration::from_secs(3));
    }

    #[test]
    fn test_ack_from_wrong_node_ignored() {
        let mut t = transport();
        let now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();
        assert!(!t.on_ack(NodeAddr(9), 7, now));
        assert_eq!(t.outstanding(), 1);
    }

    #[test]
    fn test_timeout_doubles_and_flags_retry() {
        let mut t = transport();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();

        let fire = now + Duration::from_secs(3);
        let TimeoutAction::Retransmit { frame, deadline } = t.on_timeout(7, fire, &mut rng) else {
            panic!("expected retransmit");
        };
        assert!(frame.header.flags.is_retry());
        // Doubled timeout (6s) plus at most 500ms jitter.
        let wait = deadline - fire;
        assert!(wait >= Duration::from_secs(6));
        assert!(wait <= Duration::from_secs(6) + Duration::from_millis(RETRY_JITTER_MAX_MS));
        assert!(t.slots_within_bounds());
    }

    #[test]
    fn test_retries_exhaust_to_failure() {
        let mut t = transport();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();

        let mut failed = false;
        for _ in 0..=MAX_RETRIES {
            now += Duration::from_secs(RETRY_TIMEOUT_CAP_SECS + 1);
            match t.on_timeout(7, now, &mut rng) {
                TimeoutAction::Retransmit { .. } => {}
                TimeoutAction::Failed { dest, packet_id, .. } => {
                    assert_eq!(dest, B);
                    assert_eq!(packet_id, 7);
                    failed = true;
                    break;
                }
                TimeoutAction::Released => panic!("slot vanished"),
            }
        }
        assert!(failed);
        assert_eq!(t.outstanding(), 0);
        assert_eq!(t.stats().retransmits, MAX_RETRIES as u64);
        assert_eq!(t.stats().failed, 1);
    }

    #[test]
    fn test_karn_rule_skips_retransmitted_samples() {
        let mut t = transport();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();

        let fire = now + Duration::from_secs(3);
        assert!(matches!(t.on_timeout(7, fire, &mut rng), TimeoutAction::Retransmit { .. }));

        // The late ACK clears the slot but contributes no sample.
        assert!(t.on_ack(B, 7, fire + Duration::from_secs(1)));
        assert!(t.estimator_for(B).is_none());
    }

    #[test]
    fn test_late_timer_after_ack_is_noop() {
        let mut t = transport();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let now = Instant::now();
        t.register(data_frame(B, 7), now).unwrap();
        t.on_ack(B, 7, now + Duration::from_millis(100));

        assert!(matches!(
            t.on_timeout(7, now + Duration::from_secs(3), &mut rng),
            TimeoutAction::Released
        ));
    }

    #[test]
    fn test_seen_cache_dedupes_within_timeout() {
        let mut t = transport();
        let now = Instant::now();
        assert_eq!(t.check_seen(B, 42, now), SeenStatus::New);
        assert_eq!(t.check_seen(B, 42, now + Duration::from_secs(5)), SeenStatus::Duplicate);

        // Same id from a different source is distinct.
        assert_eq!(t.check_seen(NodeAddr(9), 42, now), SeenStatus::New);

        // Past the timeout the pair counts as new again.
        assert_eq!(
            t.check_seen(B, 42, now + Duration::from_secs(SEEN_PACKET_TIMEOUT_SECS + 6)),
            SeenStatus::New
        );
    }

    #[test]
    fn test_seen_cache_ring_bounded() {
        let mut t = transport();
        let now = Instant::now();
        for id in 0..(SEEN_PACKET_CACHE as u16 + 8) {
            t.check_seen(B, id, now);
        }
        // The first entries were overwritten by the ring.
        assert_eq!(t.check_seen(B, 0, now), SeenStatus::New);
    }

    #[test]
    fn test_abort_dest_releases_slots() {
        let mut t = transport();
        let now = Instant::now();
        t.register(data_frame(B, 1), now).unwrap();
        t.register(data_frame(B, 2), now).unwrap();
        t.register(data_frame(NodeAddr(9), 3), now).unwrap();

        let mut dropped = t.abort_dest(B);
        dropped.sort_unstable();
        assert_eq!(dropped, vec![1, 2]);
        assert_eq!(t.outstanding(), 1);
    }

    #[test]
    fn test_rtt_estimator_tracks_variance() {
        let default_rto = Duration::from_millis(100);
        let mut est = RttEstimator::new(default_rto);
        for ms in [200u64, 220, 180, 210, 190] {
            est.update(Duration::from_millis(ms), default_rto);
        }
        let srtt = est.srtt().unwrap().as_millis() as u64;
        assert!((150..=250).contains(&srtt), "srtt {srtt}");
        assert!(est.rto() >= Duration::from_millis(srtt as u64));
        assert!(est.rto() <= Duration::from_secs(RETRY_TIMEOUT_CAP_SECS));
    }
}
