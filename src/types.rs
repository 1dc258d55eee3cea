// ChirpNet Mesh Protocol — Constants and Types
// Copyright (c) 2024-2026 The ChirpNet developers
// Distributed under the MIT software license.

//! Protocol constants and shared types.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every table is allocated with a fixed
//!    capacity at start and lives for the process lifetime. A flooded channel
//!    cannot grow any collection past its cap.
//!
//! 2. **Single ownership** — the engine loop is the sole mutator of the
//!    neighbor table, route table, pending-ACK slots and seen-packet cache.
//!    The radio interrupt path only enqueues raw frames.
//!
//! 3. **Fail-fast backpressure** — exhausting the TX window or the pending
//!    slots is reported synchronously to the caller, never queued unbounded.
//!
//! # Memory Budget
//!
//! | Component          | Max Size | Calculation                         |
//! |--------------------|----------|-------------------------------------|
//! | Neighbor table     | ~2.5 KB  | MAX_NEIGHBORS(64) × ~40 bytes       |
//! | Route table        | ~6 KB    | 64 dests × 3 routes × ~32 bytes     |
//! | Pending ACK slots  | ~1.2 KB  | TX_WINDOW_SIZE(4) × ~300 bytes      |
//! | Seen-packet cache  | ~0.5 KB  | SEEN_PACKET_CACHE(32) × 16 bytes    |
//! | Radio RX queue     | ~4.5 KB  | RADIO_QUEUE_DEPTH(16) × ~280 bytes  |
//!
//! Total worst-case: well under 16 KB of table state, suitable for an MCU
//! port even though this build targets hosted environments.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Wire format version carried in the header's high nibble.
/// Frames with any other version are dropped at the codec.
pub const PROTOCOL_VERSION: u8 = 1;

// =============================================================================
// SIZE AND CAPACITY LIMITS
// =============================================================================

/// Maximum application payload per packet, before the AEAD envelope.
/// Chosen so the length field fits one byte and a max-size encrypted frame
/// (23 header + 24 nonce + 255 payload + 16 tag + 2 CRC) stays inside a
/// single SF10/BW125 LoRa transmission.
pub const MAX_PAYLOAD: usize = 255;

/// Directly observed neighbors tracked per node. Past the cap a newcomer
/// displaces the lowest-quality neighbor, and only when it sounds better.
pub const MAX_NEIGHBORS: usize = 64;

/// Alternative routes retained per destination (primary + backups).
pub const MAX_ROUTES_PER_DEST: usize = 3;

/// Outstanding ACK-required packets per sender. `send()` fails with a
/// backpressure error once the window is full; broadcasts bypass it.
pub const TX_WINDOW_SIZE: usize = 4;

/// Ring capacity of the duplicate-suppression cache.
pub const SEEN_PACKET_CACHE: usize = 32;

/// Raw frames buffered between the radio interrupt and the engine loop.
pub const RADIO_QUEUE_DEPTH: usize = 16;

// =============================================================================
// TIMING
// =============================================================================

/// A neighbor is evicted when nothing has been heard from it for this long.
pub const NEIGHBOR_TIMEOUT_SECS: u64 = 60;

/// Interval between HELLO broadcasts carrying the topology hash.
pub const TOPOLOGY_BROADCAST_INTERVAL_SECS: u64 = 60;

/// Seen-packet cache entries expire after this long.
pub const SEEN_PACKET_TIMEOUT_SECS: u64 = 30;

/// Retransmission attempts per ACK-required packet before the send fails.
pub const MAX_RETRIES: u8 = 3;

/// Hard ceiling on any retransmission timeout, doubling included.
pub const RETRY_TIMEOUT_CAP_SECS: u64 = 60;

/// Uniform random jitter added to every retransmission, in milliseconds.
/// Decorrelates retries of nodes that lost the same ACK.
pub const RETRY_JITTER_MAX_MS: u64 = 500;

/// Consecutive divergent topology observations before a partition event.
pub const PARTITION_DETECT_THRESHOLD: u8 = 3;

/// Periodic identity broadcast interval.
pub const BEACON_INTERVAL_SECS: u64 = 300;

/// A time source not refreshed within this interval expires and the
/// stratum decays toward unsynchronized.
pub const TIME_SYNC_INTERVAL_SECS: u64 = 300;

// =============================================================================
// NODE ADDRESSING
// =============================================================================

/// 32-bit node address, derived deterministically from the hardware serial.
///
/// The all-ones address is broadcast; zero is reserved and never valid as a
/// source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr(pub u32);

impl NodeAddr {
    /// Broadcast address (all ones).
    pub const BROADCAST: NodeAddr = NodeAddr(0xFFFF_FFFF);

    /// Reserved invalid address.
    pub const UNSET: NodeAddr = NodeAddr(0);

    /// Derive an address from a permanent hardware serial: the first four
    /// bytes (little-endian) of SHA3-256 over the serial. Degenerate digests
    /// that collide with the reserved addresses are perturbed.
    pub fn from_serial(serial: &[u8]) -> Self {
        use sha3::{Digest, Sha3_256};
        let digest = Sha3_256::digest(serial);
        let raw = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        match raw {
            0 => NodeAddr(u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]) | 1),
            0xFFFF_FFFF => NodeAddr(raw ^ 1),
            _ => NodeAddr(raw),
        }
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_valid_source(self) -> bool {
        self != Self::UNSET && self != Self::BROADCAST
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({:08x})", self.0)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for NodeAddr {
    fn from(value: u32) -> Self {
        NodeAddr(value)
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current unix time in seconds. Wall-clock time is only used for display and
/// for TIME_SYNC payloads; all protocol deadlines run on monotonic instants.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
