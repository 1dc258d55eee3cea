pub mod console;
pub mod crypto;
pub mod mesh;
pub mod storage;
pub mod types;

pub use crypto::{CryptoContext, CryptoError, CryptoStats, NET_KEY_SIZE};
pub use mesh::{
    Engine, MeshConfig, MeshEvent, MeshHandle, NodeStatus, RadioDriver, RadioError,
    RadioParams, ReceivedFrame, SendError, radio_rx_queue,
};
pub use storage::{KeyValueStore, MemoryStore, SledStore, StorageError};
pub use types::NodeAddr;
