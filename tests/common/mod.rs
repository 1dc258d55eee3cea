#![allow(dead_code)] // each test binary uses a different slice of the harness

//! Multi-node in-memory radio simulator.
//!
//! Every node's driver broadcasts into a shared connection matrix: a frame
//! transmitted by node `i` is delivered to every node `j` with a live
//! `(i, j)` link, carrying that link's RSSI/SNR. Links can be cut, told to
//! drop the next N frames (lossy-channel tests), or tapped to capture raw
//! bytes for replay-attack tests.

use chirpnet::mesh::radio::RadioRxSender;
use chirpnet::storage::{KEY_NET_KEY, KeyValueStore, MemoryStore};
use chirpnet::{
    Engine, MeshConfig, MeshEvent, MeshHandle, NodeAddr, RadioDriver, RadioError, RadioParams,
    ReceivedFrame, radio_rx_queue,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared network key pre-seeded into every node's store.
pub const TEST_KEY: [u8; 32] = [7u8; 32];

#[derive(Clone, Copy)]
struct LinkQuality {
    rssi_dbm: i16,
    snr_db: f32,
}

struct NetInner {
    taps: Vec<RadioRxSender>,
    links: HashMap<(usize, usize), LinkQuality>,
    /// Directed frame-drop budgets for loss injection.
    drops: HashMap<(usize, usize), u32>,
    /// Raw-byte capture buffers, per receiving node.
    captures: Vec<Option<Vec<Vec<u8>>>>,
}

/// The simulated shared channel.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<NetInner>>,
}

struct SimRadio {
    idx: usize,
    inner: Arc<Mutex<NetInner>>,
}

impl RadioDriver for SimRadio {
    fn tx(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        let mut inner = self.inner.lock().unwrap();
        let receivers = inner.taps.len();
        for to in 0..receivers {
            if to == self.idx {
                continue;
            }
            let Some(quality) = inner.links.get(&(self.idx, to)).copied() else {
                continue;
            };
            if let Some(budget) = inner.drops.get_mut(&(self.idx, to)) {
                if *budget > 0 {
                    *budget -= 1;
                    continue;
                }
            }
            if let Some(capture) = &mut inner.captures[to] {
                capture.push(bytes.to_vec());
            }
            let frame = ReceivedFrame {
                bytes: bytes.to_vec(),
                rssi_dbm: quality.rssi_dbm,
                snr_db: quality.snr_db,
            };
            let _ = inner.taps[to].try_send(frame);
        }
        Ok(())
    }

    fn rx_poll(&mut self) -> Option<ReceivedFrame> {
        None
    }

    fn set_params(&mut self, _params: RadioParams) -> Result<(), RadioError> {
        Ok(())
    }
}

/// One simulated node: its engine runs on a spawned task.
pub struct TestNode {
    pub addr: NodeAddr,
    pub idx: usize,
    pub handle: MeshHandle,
    pub events: mpsc::Receiver<MeshEvent>,
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetInner {
                taps: Vec::new(),
                links: HashMap::new(),
                drops: HashMap::new(),
                captures: Vec::new(),
            })),
        }
    }

    /// Engine tuning that keeps test wall-clock short without changing any
    /// protocol semantics.
    pub fn fast_config() -> MeshConfig {
        MeshConfig {
            ack_timeout: Duration::from_millis(200),
            hello_interval: Duration::from_millis(300),
            beacon_interval: Duration::from_millis(400),
            ..Default::default()
        }
    }

    pub async fn add_node(&self, serial: &str) -> TestNode {
        self.add_node_with(serial, Self::fast_config()).await
    }

    pub async fn add_node_with(&self, serial: &str, config: MeshConfig) -> TestNode {
        let (tap, radio_rx) = radio_rx_queue();
        let idx = {
            let mut inner = self.inner.lock().unwrap();
            inner.taps.push(tap);
            inner.captures.push(None);
            inner.taps.len() - 1
        };

        let store = MemoryStore::new();
        store.store(KEY_NET_KEY, &TEST_KEY).unwrap();

        let radio = SimRadio { idx, inner: Arc::clone(&self.inner) };
        let (engine, handle, events) = Engine::new(
            serial.as_bytes(),
            config,
            Box::new(store),
            Box::new(radio),
            radio_rx,
        )
        .expect("engine init");
        tokio::spawn(engine.run());

        TestNode { addr: NodeAddr::from_serial(serial.as_bytes()), idx, handle, events }
    }

    /// Symmetric link with default (good) quality.
    pub fn link(&self, a: &TestNode, b: &TestNode) {
        self.link_quality(a, b, -70, 8.0);
    }

    pub fn link_quality(&self, a: &TestNode, b: &TestNode, rssi_dbm: i16, snr_db: f32) {
        let mut inner = self.inner.lock().unwrap();
        let quality = LinkQuality { rssi_dbm, snr_db };
        inner.links.insert((a.idx, b.idx), quality);
        inner.links.insert((b.idx, a.idx), quality);
    }

    pub fn unlink(&self, a: &TestNode, b: &TestNode) {
        let mut inner = self.inner.lock().unwrap();
        inner.links.remove(&(a.idx, b.idx));
        inner.links.remove(&(b.idx, a.idx));
    }

    /// Silently discard the next `count` frames traveling `from` -> `to`.
    pub fn drop_next(&self, from: &TestNode, to: &TestNode, count: u32) {
        self.inner
            .lock()
            .unwrap()
            .drops
            .insert((from.idx, to.idx), count);
    }

    /// Begin capturing every raw frame delivered to `node`.
    pub fn capture(&self, node: &TestNode) {
        self.inner.lock().unwrap().captures[node.idx] = Some(Vec::new());
    }

    /// Take the frames captured so far for `node`.
    pub fn captured(&self, node: &TestNode) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().captures[node.idx]
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Deliver raw bytes straight into a node's radio queue, as an attacker
    /// replaying a recorded transmission would.
    pub fn inject(&self, to: &TestNode, bytes: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        let _ = inner.taps[to.idx].try_send(ReceivedFrame {
            bytes,
            rssi_dbm: -70,
            snr_db: 8.0,
        });
    }
}

/// Wait up to `within` for the next Delivered event on `node`.
pub async fn wait_delivered(node: &mut TestNode, within: Duration) -> Option<(NodeAddr, Vec<u8>)> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, node.events.recv()).await {
            Ok(Some(MeshEvent::Delivered { source, payload, .. })) => {
                return Some((source, payload));
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Wait up to `within` for an event matching `pred`.
pub async fn wait_event<F>(node: &mut TestNode, within: Duration, pred: F) -> Option<MeshEvent>
where
    F: Fn(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, node.events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Drain every queued event without waiting.
pub fn drain_events(node: &mut TestNode) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        events.push(event);
    }
    events
}

/// Count how many queued Delivered events carry `payload`.
pub fn count_deliveries(events: &[MeshEvent], payload: &[u8]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MeshEvent::Delivered { payload: p, .. } if p == payload))
        .count()
}
