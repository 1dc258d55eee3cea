//! The mesh protocol engine.
//!
//! Layered leaves-first: codec and radio boundary at the bottom, MAC and the
//! tables above them, the routing protocol and reliable transport above
//! those, and the single-owner engine loop on top.

pub mod codec;
pub mod config;
pub mod engine;
pub mod mac;
pub mod neighbors;
pub mod radio;
pub mod routes;
pub mod routing;
pub mod transport;

use crate::types::NodeAddr;
use thiserror::Error;

// Re-exports
pub use codec::{CodecError, Flags, Frame, PacketHeader, PacketType, Payload, crc16_ccitt};
pub use config::MeshConfig;
pub use engine::{Engine, EngineStats, MeshEvent, MeshHandle, NodeStatus};
pub use mac::{MacMode, MacState, MacStats, TimeSourceKind, TxClass};
pub use neighbors::{NeighborEntry, NeighborTable, link_score};
pub use radio::{
    RadioDriver, RadioError, RadioParams, RadioRxQueue, RadioRxSender, ReceivedFrame,
    radio_rx_queue,
};
pub use routes::{RouteEntry, RouteFreshness, RouteSnapshot, RouteTable, route_score};
pub use routing::{Routing, RoutingStats};
pub use transport::{RttEstimator, SeenStatus, TimeoutAction, Transport, TransportStats};

/// Why a `send` could not be completed. Resource exhaustion surfaces here
/// synchronously; routing failures surface after retries are exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transmit window full ({0} outstanding)")]
    WindowFull(usize),

    #[error("no route to {0}")]
    NoRoute(NodeAddr),

    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid destination {0}")]
    BadDestination(NodeAddr),

    #[error("nonce counter exhausted; re-key required")]
    CounterExhausted,

    #[error("engine is shut down")]
    EngineDown,
}
