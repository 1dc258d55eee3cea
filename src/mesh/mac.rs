//! Medium access: hybrid time-slotted / carrier-sense arbitration.
//!
//! Time is divided into 1-second frames of ten 100 ms slots. Slot 0 is the
//! beacon slot; slots 1..9 are deterministically assigned by address. A node
//! only runs slotted when it holds a time source good enough to keep its
//! within-frame error under 10 ms; otherwise it falls back to carrier-sense
//! with random backoff. Losing time sync is not an error — the MAC degrades
//! and keeps arbitrating.
//!
//! The MAC never blocks: it hands the engine the next permitted transmit
//! instant and the engine schedules a deferred-transmit timer.

use crate::types::{NodeAddr, TIME_SYNC_INTERVAL_SECS};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Frame length.
pub const FRAME_MS: u64 = 1000;

/// Slot length; ten slots per frame.
pub const SLOT_MS: u64 = 100;

/// Number of slots per frame.
pub const SLOTS_PER_FRAME: u64 = 10;

/// Slot 0 is reserved for beacons.
pub const BEACON_SLOT: u8 = 0;

/// Data slots available for deterministic assignment.
pub const DATA_SLOTS: u32 = 9;

/// Slotted mode requires the estimated within-frame clock error below this.
pub const MAX_CLOCK_ERROR_MS: u64 = 10;

/// Upper bound of the uniform carrier-sense backoff.
pub const CS_BACKOFF_MAX_MS: u64 = 255;

/// Carrier-sense rechecks before transmitting regardless.
pub const CS_MAX_ATTEMPTS: u8 = 5;

/// Frames of history considered for slot-collision fallback.
pub const COLLISION_WINDOW_FRAMES: u32 = 8;

/// Collisions within the window that force carrier-sense for the frame.
pub const COLLISION_FALLBACK_THRESHOLD: u32 = 3;

/// Stratum of a free-running crystal: no sync, slotted mode disabled.
pub const STRATUM_CRYSTAL: u8 = 15;

/// Where a time source came from. Lower stratum wins the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSourceKind {
    /// GPS fix, stratum 0.
    Gps,
    /// Host-side NTP, stratum 1.
    Ntp,
    /// Time set over the serial console, stratum 2.
    Serial,
    /// Derived from a synchronized peer: peer stratum + 1, 3..=14.
    Peer,
    /// Free-running crystal, stratum 15.
    Crystal,
}

impl TimeSourceKind {
    pub fn name(self) -> &'static str {
        match self {
            TimeSourceKind::Gps => "gps",
            TimeSourceKind::Ntp => "ntp",
            TimeSourceKind::Serial => "serial",
            TimeSourceKind::Peer => "synced",
            TimeSourceKind::Crystal => "crystal",
        }
    }
}

/// Transmit arbitration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacMode {
    Slotted,
    CarrierSense,
}

/// Scheduling class for an outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxClass {
    /// Beacons go out in slot 0.
    Beacon,
    /// ACKs and routing control jump the data queue.
    Control,
    Data,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSource {
    kind: TimeSourceKind,
    stratum: u8,
    quality: u8,
    refreshed_at: Instant,
    /// Instant aligned with the start of a frame (whole unix second).
    frame_anchor: Instant,
    unix_at_anchor: u64,
}

/// Counters surfaced by the `mac` console command.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacStats {
    pub slotted_tx: u64,
    pub carrier_sense_tx: u64,
    pub backoffs: u64,
    pub forced_tx: u64,
    pub slot_collisions: u64,
    pub slot_repicks: u64,
}

/// MAC state machine. Owned by the engine; all mutation happens on the
/// engine thread.
pub struct MacState {
    node_addr: NodeAddr,
    source: Option<ActiveSource>,
    /// Deterministic slot: `addr mod 9 + 1`.
    home_slot: u8,
    /// Slot in use (may differ from home after a collision re-pick).
    active_slot: u8,
    /// Last instant each slot was observed busy with foreign traffic.
    slot_busy: [Option<Instant>; SLOTS_PER_FRAME as usize],
    /// Collision timestamps within the observation window.
    recent_collisions: Vec<Instant>,
    /// Forced carrier-sense until this instant after persistent collisions.
    cs_fallback_until: Option<Instant>,
    cs_attempts: u8,
    stats: MacStats,
}

impl MacState {
    pub fn new(node_addr: NodeAddr) -> Self {
        let home_slot = Self::slot_for(node_addr);
        Self {
            node_addr,
            source: None,
            home_slot,
            active_slot: home_slot,
            slot_busy: [None; SLOTS_PER_FRAME as usize],
            recent_collisions: Vec::new(),
            cs_fallback_until: None,
            cs_attempts: 0,
            stats: MacStats::default(),
        }
    }

    /// Deterministic slot assignment.
    pub fn slot_for(addr: NodeAddr) -> u8 {
        (addr.to_u32() % DATA_SLOTS) as u8 + 1
    }

    pub fn active_slot(&self) -> u8 {
        self.active_slot
    }

    pub fn stats(&self) -> MacStats {
        self.stats
    }

    // =========================================================================
    // TIME-SOURCE ELECTION
    // =========================================================================

    /// Feed a local (non-peer) time source: GPS fix, host NTP, or a console
    /// `time` command.
    pub fn adopt_local_source(
        &mut self,
        kind: TimeSourceKind,
        quality: u8,
        unix_secs: u64,
        now: Instant,
    ) {
        let stratum = match kind {
            TimeSourceKind::Gps => 0,
            TimeSourceKind::Ntp => 1,
            TimeSourceKind::Serial => 2,
            TimeSourceKind::Peer | TimeSourceKind::Crystal => return,
        };
        self.consider(kind, stratum, quality, unix_secs, now);
    }

    /// Feed a TIME_SYNC heard from a peer. The derived stratum is the peer's
    /// plus one; peers at 14 or worse cannot seed us.
    pub fn observe_peer_sync(&mut self, peer_stratum: u8, quality: u8, unix_secs: u64, now: Instant) {
        let derived = peer_stratum.saturating_add(1);
        if derived >= STRATUM_CRYSTAL {
            return;
        }
        self.consider(TimeSourceKind::Peer, derived, quality, unix_secs, now);
    }

    fn consider(
        &mut self,
        kind: TimeSourceKind,
        stratum: u8,
        quality: u8,
        unix_secs: u64,
        now: Instant,
    ) {
        // Same origin refreshes in place, keeping its original arrival for
        // tie-breaking.
        if let Some(current) = &mut self.source {
            if current.kind == kind && current.stratum == stratum {
                current.quality = quality;
                current.refreshed_at = now;
                current.frame_anchor = now;
                current.unix_at_anchor = unix_secs;
                return;
            }
        }

        let better = match &self.source {
            None => true,
            Some(current) => {
                let effective = self.effective_stratum(now);
                (stratum, u8::MAX - quality) < (effective, u8::MAX - current.quality)
            }
        };
        if better {
            info!(
                source = kind.name(),
                stratum,
                quality,
                "time source adopted"
            );
            self.source = Some(ActiveSource {
                kind,
                stratum,
                quality,
                refreshed_at: now,
                frame_anchor: now,
                unix_at_anchor: unix_secs,
            });
        }
    }

    /// Current stratum including decay: each full sync interval without a
    /// refresh degrades one step toward the free-running crystal.
    pub fn effective_stratum(&self, now: Instant) -> u8 {
        match &self.source {
            None => STRATUM_CRYSTAL,
            Some(source) => {
                let silent = now.saturating_duration_since(source.refreshed_at).as_secs();
                let missed = silent / TIME_SYNC_INTERVAL_SECS;
                source.stratum.saturating_add(missed as u8).min(STRATUM_CRYSTAL)
            }
        }
    }

    pub fn source_kind(&self) -> TimeSourceKind {
        self.source.map(|s| s.kind).unwrap_or(TimeSourceKind::Crystal)
    }

    pub fn source_quality(&self) -> u8 {
        self.source.map(|s| s.quality).unwrap_or(0)
    }

    /// Estimated within-frame clock error: one millisecond of drift per
    /// stratum step above GPS, plus one baseline.
    fn estimated_clock_error_ms(&self, now: Instant) -> u64 {
        1 + self.effective_stratum(now) as u64
    }

    /// Unix time as tracked by the adopted source, if any.
    pub fn unix_time(&self, now: Instant) -> Option<u64> {
        let source = self.source.as_ref()?;
        let elapsed = now.saturating_duration_since(source.frame_anchor).as_secs();
        Some(source.unix_at_anchor + elapsed)
    }

    pub fn mode(&self, now: Instant) -> MacMode {
        if let Some(until) = self.cs_fallback_until {
            if now < until {
                return MacMode::CarrierSense;
            }
        }
        let stratum = self.effective_stratum(now);
        if stratum < STRATUM_CRYSTAL && self.estimated_clock_error_ms(now) < MAX_CLOCK_ERROR_MS {
            MacMode::Slotted
        } else {
            MacMode::CarrierSense
        }
    }

    // =========================================================================
    // TRANSMIT SCHEDULING
    // =========================================================================

    /// Earliest instant this node may begin the given transmission. In
    /// slotted mode that is the next occurrence of the proper slot; in
    /// carrier-sense mode it is immediately (the CAD check happens at fire
    /// time via [`MacState::clear_to_send`]).
    pub fn next_tx_instant(&mut self, now: Instant, class: TxClass) -> Instant {
        match self.mode(now) {
            MacMode::CarrierSense => now,
            MacMode::Slotted => {
                let slot = match class {
                    TxClass::Beacon => BEACON_SLOT,
                    TxClass::Control | TxClass::Data => self.active_slot,
                };
                self.next_slot_start(now, slot)
            }
        }
    }

    /// Final gate before handing bytes to the radio. Returns `Ok(())` when
    /// the channel is ours, or the instant to retry at.
    pub fn clear_to_send<R: Rng>(
        &mut self,
        now: Instant,
        channel_busy: bool,
        rng: &mut R,
    ) -> Result<(), Instant> {
        match self.mode(now) {
            MacMode::Slotted => {
                // Slot ownership is the arbitration; no CAD inside our slot.
                self.cs_attempts = 0;
                self.stats.slotted_tx += 1;
                Ok(())
            }
            MacMode::CarrierSense => {
                if !channel_busy {
                    self.cs_attempts = 0;
                    self.stats.carrier_sense_tx += 1;
                    return Ok(());
                }
                self.cs_attempts += 1;
                if self.cs_attempts > CS_MAX_ATTEMPTS {
                    // The channel never cleared; transmit anyway rather than
                    // stall the queue behind a noisy neighbor.
                    self.cs_attempts = 0;
                    self.stats.forced_tx += 1;
                    return Ok(());
                }
                self.stats.backoffs += 1;
                let backoff = Duration::from_millis(rng.gen_range(0..=CS_BACKOFF_MAX_MS));
                Err(now + backoff)
            }
        }
    }

    fn next_slot_start(&self, now: Instant, slot: u8) -> Instant {
        let Some(source) = &self.source else {
            return now;
        };
        let since_anchor = now.saturating_duration_since(source.frame_anchor).as_millis() as u64;
        let in_frame = since_anchor % FRAME_MS;
        let slot_start = slot as u64 * SLOT_MS;
        let wait = if in_frame < slot_start {
            slot_start - in_frame
        } else if in_frame < slot_start + SLOT_MS {
            // Already inside the slot.
            0
        } else {
            FRAME_MS - in_frame + slot_start
        };
        now + Duration::from_millis(wait)
    }

    /// Slot index at an instant, when a frame anchor exists.
    pub fn slot_at(&self, at: Instant) -> Option<u8> {
        let source = self.source.as_ref()?;
        let since = at.saturating_duration_since(source.frame_anchor).as_millis() as u64;
        Some(((since % FRAME_MS) / SLOT_MS) as u8)
    }

    // =========================================================================
    // COLLISION HANDLING
    // =========================================================================

    /// Record a foreign transmission heard at `at`. If it landed in our
    /// active slot from a node that maps to the same slot, that is a
    /// collision: the lower address keeps the slot, the higher re-picks the
    /// next slot observed free over the past two frames.
    pub fn observe_rx(&mut self, from: NodeAddr, at: Instant) {
        let Some(slot) = self.slot_at(at) else {
            return;
        };
        self.slot_busy[slot as usize] = Some(at);

        if slot != self.active_slot || Self::slot_for(from) != self.active_slot {
            return;
        }
        self.stats.slot_collisions += 1;
        self.recent_collisions.push(at);
        let window = Duration::from_millis(FRAME_MS * COLLISION_WINDOW_FRAMES as u64);
        self.recent_collisions.retain(|t| at.saturating_duration_since(*t) < window);

        if self.node_addr.to_u32() < from.to_u32() {
            // We are the lower address: the peer yields.
            return;
        }

        if let Some(slot) = self.pick_free_slot(at) {
            debug!(from = %from, old_slot = self.active_slot, new_slot = slot, "slot collision, yielding");
            self.active_slot = slot;
            self.stats.slot_repicks += 1;
        } else if self.recent_collisions.len() as u32 >= COLLISION_FALLBACK_THRESHOLD {
            // No free slot and the collisions keep coming: sit out this
            // frame on carrier-sense.
            self.cs_fallback_until = Some(at + Duration::from_millis(FRAME_MS));
        }
    }

    /// Next data slot with no traffic observed over the past two frames.
    fn pick_free_slot(&self, now: Instant) -> Option<u8> {
        let two_frames = Duration::from_millis(2 * FRAME_MS);
        (1..SLOTS_PER_FRAME as u8)
            .filter(|slot| *slot != self.active_slot)
            .find(|slot| {
                match self.slot_busy[*slot as usize] {
                    None => true,
                    Some(last) => now.saturating_duration_since(last) > two_frames,
                }
            })
    }

    /// Restore the deterministic slot (after topology churn clears).
    pub fn reset_slot(&mut self) {
        self.active_slot = self.home_slot;
        self.recent_collisions.clear();
        self.cs_fallback_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mac(addr: u32) -> MacState {
        MacState::new(NodeAddr(addr))
    }

    #[test]
    fn test_slot_assignment_deterministic() {
        assert_eq!(MacState::slot_for(NodeAddr(0)), 1);
        assert_eq!(MacState::slot_for(NodeAddr(8)), 9);
        assert_eq!(MacState::slot_for(NodeAddr(9)), 1);
        assert_eq!(MacState::slot_for(NodeAddr(0x1234_5678)), (0x1234_5678u32 % 9) as u8 + 1);
    }

    #[test]
    fn test_unsynced_node_is_carrier_sense() {
        let mac = mac(7);
        let now = Instant::now();
        assert_eq!(mac.effective_stratum(now), STRATUM_CRYSTAL);
        assert_eq!(mac.mode(now), MacMode::CarrierSense);
    }

    #[test]
    fn test_gps_source_enables_slotted() {
        let mut mac = mac(7);
        let now = Instant::now();
        mac.adopt_local_source(TimeSourceKind::Gps, 100, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), 0);
        assert_eq!(mac.mode(now), MacMode::Slotted);
    }

    #[test]
    fn test_election_prefers_lower_stratum() {
        let mut mac = mac(7);
        let now = Instant::now();
        mac.adopt_local_source(TimeSourceKind::Serial, 50, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), 2);

        // A peer one hop off GPS beats a serial clock.
        mac.observe_peer_sync(0, 90, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), 1);
        assert_eq!(mac.source_kind(), TimeSourceKind::Peer);

        // A worse peer does not displace it.
        mac.observe_peer_sync(5, 100, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), 1);
    }

    #[test]
    fn test_high_stratum_peer_cannot_seed() {
        let mut mac = mac(7);
        let now = Instant::now();
        mac.observe_peer_sync(14, 100, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), STRATUM_CRYSTAL);
    }

    #[test]
    fn test_stratum_decays_without_refresh() {
        let mut mac = mac(7);
        let now = Instant::now();
        mac.adopt_local_source(TimeSourceKind::Gps, 100, 1_700_000_000, now);

        let later = now + Duration::from_secs(TIME_SYNC_INTERVAL_SECS * 2 + 1);
        assert_eq!(mac.effective_stratum(later), 2);

        let much_later = now + Duration::from_secs(TIME_SYNC_INTERVAL_SECS * 40);
        assert_eq!(mac.effective_stratum(much_later), STRATUM_CRYSTAL);
        assert_eq!(mac.mode(much_later), MacMode::CarrierSense);
    }

    #[test]
    fn test_deep_peer_chain_too_loose_for_slots() {
        let mut mac = mac(7);
        let now = Instant::now();
        // Stratum 9 -> estimated error 10ms, at the slotted threshold.
        mac.observe_peer_sync(8, 80, 1_700_000_000, now);
        assert_eq!(mac.effective_stratum(now), 9);
        assert_eq!(mac.mode(now), MacMode::CarrierSense);
    }

    #[test]
    fn test_slotted_tx_lands_in_own_slot() {
        let mut mac = mac(3); // slot 4
        let now = Instant::now();
        mac.adopt_local_source(TimeSourceKind::Gps, 100, 1_700_000_000, now);
        assert_eq!(mac.active_slot(), 4);

        let at = mac.next_tx_instant(now, TxClass::Data);
        assert_eq!(mac.slot_at(at), Some(4));

        let beacon_at = mac.next_tx_instant(now, TxClass::Beacon);
        assert_eq!(mac.slot_at(beacon_at), Some(BEACON_SLOT));
    }

    #[test]
    fn test_carrier_sense_backoff_bounded() {
        let mut mac = mac(7);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::now();

        let retry_at = mac.clear_to_send(now, true, &mut rng).unwrap_err();
        let delay = retry_at - now;
        assert!(delay <= Duration::from_millis(CS_BACKOFF_MAX_MS));
        assert_eq!(mac.stats().backoffs, 1);

        assert!(mac.clear_to_send(now, false, &mut rng).is_ok());
        assert_eq!(mac.stats().carrier_sense_tx, 1);
    }

    #[test]
    fn test_carrier_sense_gives_up_after_retries() {
        let mut mac = mac(7);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut now = Instant::now();

        let mut forced = false;
        for _ in 0..=CS_MAX_ATTEMPTS {
            match mac.clear_to_send(now, true, &mut rng) {
                Ok(()) => {
                    forced = true;
                    break;
                }
                Err(at) => now = at,
            }
        }
        assert!(forced);
        assert_eq!(mac.stats().forced_tx, 1);
    }

    #[test]
    fn test_collision_yields_to_lower_address() {
        // Addresses 10 and 19 share slot (10 % 9) + 1 == 2.
        let mut high = mac(19);
        let now = Instant::now();
        high.adopt_local_source(TimeSourceKind::Gps, 100, 1_700_000_000, now);
        assert_eq!(high.active_slot(), 2);

        // Hear the lower-addressed node inside our slot.
        let in_slot = now + Duration::from_millis(2 * SLOT_MS + 10);
        high.observe_rx(NodeAddr(10), in_slot);
        assert_ne!(high.active_slot(), 2);
        assert_eq!(high.stats().slot_repicks, 1);

        // The lower address keeps its slot.
        let mut low = mac(10);
        low.adopt_local_source(TimeSourceKind::Gps, 100, 1_700_000_000, now);
        low.observe_rx(NodeAddr(19), in_slot);
        assert_eq!(low.active_slot(), 2);
        assert_eq!(low.stats().slot_collisions, 1);
    }
}
