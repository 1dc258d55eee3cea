//! Engine configuration.

use super::radio::RadioParams;
use std::time::Duration;

/// Tunables for one mesh node. `..Default::default()` is the normal way to
/// build one; every field has a conservative default that interoperates.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Friendly node name (<=16 bytes), carried in beacons.
    pub node_name: String,

    /// Application channel tag (0-7). A pure delivery-side filter: packets
    /// tagged for another channel are still forwarded, just not delivered
    /// locally.
    pub channel: u8,

    /// TTL stamped on locally originated packets.
    pub default_ttl: u8,

    /// Seal outgoing payloads. Turning this off is a test-harness hook;
    /// incoming sealed traffic still decrypts.
    pub encrypt: bool,

    /// Drop frames whose network id differs from ours before decryption.
    pub netid_filter: bool,

    /// Baseline retransmission timeout before an RTT estimate exists.
    pub ack_timeout: Duration,

    /// Frames drained from the radio queue per engine iteration. Bounds the
    /// work done in one tick so timers and commands stay responsive.
    pub max_frames_per_tick: usize,

    /// How long a packet awaiting route discovery may sit in the forward
    /// buffer.
    pub forward_buffer_timeout: Duration,

    /// Cadence of HELLO broadcasts carrying the topology hash. Partition
    /// detection counts in units of this period.
    pub hello_interval: Duration,

    /// Cadence of identity beacons (and TIME_SYNC when synchronized).
    pub beacon_interval: Duration,

    /// Physical-layer parameter block.
    pub radio: RadioParams,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            channel: 0,
            default_ttl: 3,
            encrypt: true,
            netid_filter: true,
            ack_timeout: Duration::from_secs(3),
            max_frames_per_tick: 8,
            forward_buffer_timeout: Duration::from_secs(5),
            hello_interval: Duration::from_secs(
                crate::types::TOPOLOGY_BROADCAST_INTERVAL_SECS,
            ),
            beacon_interval: Duration::from_secs(crate::types::BEACON_INTERVAL_SECS),
            radio: RadioParams::default(),
        }
    }
}
