//! The protocol engine: a single task that owns every mutable table.
//!
//! Four event sources are multiplexed: the bounded radio RX queue, the timer
//! heap, application commands, and console lines (which arrive as commands).
//! Each iteration does a bounded amount of work — drain at most
//! `max_frames_per_tick` frames, fire one due timer, honor one command — so
//! no source can starve the others and no lock ever guards the tables.
//!
//! The radio interrupt path never touches this state: it pushes a raw
//! [`ReceivedFrame`] into the RX queue and wakes the loop.

use super::codec::{Frame, PacketHeader, PacketType, Payload};
use super::config::MeshConfig;
use super::mac::{MacMode, MacState, MacStats, TimeSourceKind, TxClass};
use super::neighbors::{NeighborEntry, NeighborTable};
use super::radio::{RadioDriver, RadioRxQueue, ReceivedFrame};
use super::routes::{RouteEntry, RouteTable, RouteSnapshot};
use super::routing::Routing;
use super::transport::{SeenStatus, TimeoutAction, Transport, TransportStats};
use super::SendError;
use crate::crypto::{CryptoContext, CryptoError, CryptoStats, CRYPTO_OVERHEAD};
use crate::storage::{
    KEY_NODE_NAME, KEY_NODE_NAMES_TABLE, KEY_ROUTE_CACHE, KeyValueStore,
};
use crate::types::{MAX_PAYLOAD, NodeAddr};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Application command channel depth.
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Event channel depth toward the application; overflow drops with a counter.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Neighbor scavenging cadence.
const NEIGHBOR_SCAVENGE_INTERVAL: Duration = Duration::from_secs(10);

/// Route scavenging and proactive-refresh cadence.
const ROUTE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic nonce high-water-mark flush.
const NONCE_STROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Frames handed to the radio per transmit opportunity.
const MAX_TX_PER_TICK: usize = 2;

// =============================================================================
// EVENTS AND COMMANDS
// =============================================================================

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A DATA payload reached us and passed the channel filter.
    Delivered { source: NodeAddr, channel: u8, payload: Vec<u8> },
    /// An outstanding ACK-required send was confirmed.
    Acked { dest: NodeAddr, packet_id: u16, rtt: Option<Duration> },
    /// An outstanding send was abandoned.
    SendFailed { dest: NodeAddr, packet_id: u16, error: SendError },
    /// A destination lost its last route.
    RouteLost { dest: NodeAddr },
    /// The topology-divergence detector fired.
    PartitionDetected { events: u64 },
    NeighborUp { addr: NodeAddr },
    NeighborDown { addr: NodeAddr },
    /// Telemetry heard from a peer.
    Telemetry { source: NodeAddr, uptime_secs: u32, battery_mv: u16 },
}

pub(crate) enum Command {
    Send {
        dest: NodeAddr,
        payload: Vec<u8>,
        ack: bool,
        reply: oneshot::Sender<Result<u16, SendError>>,
    },
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<u16, SendError>>,
    },
    Status { reply: oneshot::Sender<NodeStatus> },
    Neighbors { reply: oneshot::Sender<Vec<NeighborEntry>> },
    Routes { reply: oneshot::Sender<Vec<RouteEntry>> },
    Console { line: String, reply: oneshot::Sender<String> },
    Shutdown,
}

/// Snapshot answered by the `status` command and the application API.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub addr: NodeAddr,
    pub name: String,
    pub network_id: u16,
    pub uptime: Duration,
    pub neighbor_count: usize,
    pub route_count: usize,
    pub window_in_use: usize,
    pub mac_mode: MacMode,
    pub stratum: u8,
    pub time_source: TimeSourceKind,
    pub channel: u8,
    pub encrypt: bool,
    pub partition_events: u64,
    pub tx_disabled_reason: Option<String>,
    pub stats: EngineStats,
    pub crypto: CryptoStats,
    pub transport: TransportStats,
    pub mac: MacStats,
}

/// Frame-level counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub rx_frames: u64,
    pub rx_codec_drops: u64,
    pub rx_netid_drops: u64,
    pub rx_overheard: u64,
    pub tx_frames: u64,
    pub tx_errors: u64,
    pub events_dropped: u64,
}

// =============================================================================
// TIMERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    TxDue,
    Retransmit(u16),
    Beacon,
    TopologyHello,
    NeighborScavenge,
    RouteMaintenance,
    DiscoveryExpiry,
    NonceStrobe,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueuedTx {
    frame: Frame,
    due: Instant,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable application-side handle to a running engine.
#[derive(Clone)]
pub struct MeshHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl MeshHandle {
    /// Send an application payload. Resolves to the packet id once the send
    /// is accepted; delivery confirmation (for `ack`) arrives as an event.
    pub async fn send(
        &self,
        dest: NodeAddr,
        payload: Vec<u8>,
        ack: bool,
    ) -> Result<u16, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { dest, payload, ack, reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)?
    }

    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<u16, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Broadcast { payload, reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)?
    }

    pub async fn status(&self) -> Result<NodeStatus, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)
    }

    pub async fn neighbors(&self) -> Result<Vec<NeighborEntry>, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Neighbors { reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)
    }

    pub async fn routes(&self) -> Result<Vec<RouteEntry>, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Routes { reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)
    }

    /// Run one console line and return its printable reply.
    pub async fn console(&self, line: &str) -> Result<String, SendError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Console { line: line.to_string(), reply })
            .await
            .map_err(|_| SendError::EngineDown)?;
        rx.await.map_err(|_| SendError::EngineDown)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// The protocol engine. Construct with [`Engine::new`], then drive with
/// [`Engine::run`] on its own task.
pub struct Engine {
    pub(crate) addr: NodeAddr,
    pub(crate) config: MeshConfig,
    pub(crate) store: Box<dyn KeyValueStore>,
    pub(crate) radio: Box<dyn RadioDriver>,
    radio_rx: Option<RadioRxQueue>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    event_tx: mpsc::Sender<MeshEvent>,

    pub(crate) crypto: CryptoContext,
    pub(crate) mac: MacState,
    pub(crate) neighbors: NeighborTable,
    pub(crate) routes: RouteTable,
    pub(crate) routing: Routing,
    pub(crate) transport: Transport,
    pub(crate) names: HashMap<NodeAddr, String>,

    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    control_q: VecDeque<QueuedTx>,
    data_q: VecDeque<QueuedTx>,

    pub(crate) rng: ChaCha20Rng,
    sequence: u8,
    started: Instant,
    pub(crate) stats: EngineStats,
    /// Set when sending is refused (nonce exhaustion, key load failure).
    pub(crate) tx_disabled_reason: Option<String>,
    running: bool,
    pub(crate) reboot_requested: bool,
}

impl Engine {
    /// Build an engine from its external collaborators. The node address is
    /// derived from the hardware serial; crypto state loads from (or
    /// initializes) storage.
    pub fn new(
        serial: &[u8],
        config: MeshConfig,
        store: Box<dyn KeyValueStore>,
        mut radio: Box<dyn RadioDriver>,
        radio_rx: RadioRxQueue,
    ) -> Result<(Self, MeshHandle, mpsc::Receiver<MeshEvent>), CryptoError> {
        let addr = NodeAddr::from_serial(serial);
        let crypto = CryptoContext::load_or_generate(addr, store.as_ref())?;
        if let Err(e) = radio.set_params(config.radio) {
            warn!(error = %e, "radio rejected parameter block, continuing with driver defaults");
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let mut engine = Self {
            addr,
            mac: MacState::new(addr),
            neighbors: NeighborTable::new(addr),
            routes: RouteTable::new(),
            routing: Routing::new(),
            transport: Transport::new(config.ack_timeout),
            names: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            control_q: VecDeque::new(),
            data_q: VecDeque::new(),
            rng: ChaCha20Rng::from_entropy(),
            sequence: 0,
            started: Instant::now(),
            stats: EngineStats::default(),
            tx_disabled_reason: None,
            running: true,
            reboot_requested: false,
            crypto,
            config,
            store,
            radio,
            radio_rx: Some(radio_rx),
            cmd_rx: Some(cmd_rx),
            event_tx,
        };
        engine.load_persisted_state();

        info!(
            addr = %engine.addr,
            network_id = engine.crypto.network_id(),
            slot = engine.mac.active_slot(),
            "mesh engine initialized"
        );
        Ok((engine, MeshHandle { cmd_tx }, event_rx))
    }

    fn load_persisted_state(&mut self) {
        let now = Instant::now();
        match self.store.load(KEY_NODE_NAME) {
            Ok(Some(bytes)) => {
                if let Ok(name) = String::from_utf8(bytes) {
                    self.config.node_name = name;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load node name"),
        }
        match self.store.load(KEY_NODE_NAMES_TABLE) {
            Ok(Some(bytes)) => {
                if let Ok(entries) = bincode::deserialize::<Vec<(u32, String)>>(&bytes) {
                    self.names = entries
                        .into_iter()
                        .map(|(addr, name)| (NodeAddr(addr), name))
                        .collect();
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load name table"),
        }
        match self.store.load(KEY_ROUTE_CACHE) {
            Ok(Some(bytes)) => {
                if let Ok(snapshot) = bincode::deserialize::<RouteSnapshot>(&bytes) {
                    let count = snapshot.routes.len();
                    self.routes.restore(snapshot, now);
                    debug!(count, "route cache warm-started (stale)");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load route cache"),
        }
    }

    pub(crate) fn persist_state(&mut self) {
        if let Err(e) = self.crypto.persist_on_shutdown(self.store.as_ref()) {
            error!(error = %e, "failed to persist nonce counter");
        }
        let names: Vec<(u32, String)> = self
            .names
            .iter()
            .map(|(addr, name)| (addr.to_u32(), name.clone()))
            .collect();
        if let Ok(bytes) = bincode::serialize(&names) {
            let _ = self.store.store(KEY_NODE_NAMES_TABLE, &bytes);
        }
        let _ = self
            .store
            .store(KEY_NODE_NAME, self.config.node_name.as_bytes());
        if let Ok(bytes) = bincode::serialize(&self.routes.snapshot()) {
            let _ = self.store.store(KEY_ROUTE_CACHE, &bytes);
        }
        if let Err(e) = self.store.flush() {
            error!(error = %e, "failed to flush persisted state");
        }
    }

    /// Drive the engine until shutdown. Consumes the engine; all state dies
    /// with the task except what `persist_state` wrote.
    pub async fn run(mut self) {
        let (Some(mut radio_rx), Some(mut cmd_rx)) = (self.radio_rx.take(), self.cmd_rx.take())
        else {
            error!("engine started twice");
            return;
        };

        // Seed the periodic timers with phase offsets so they do not all
        // fire in the same tick.
        let now = Instant::now();
        let beacon_phase = self.config.beacon_interval.min(Duration::from_secs(1));
        let hello_phase = self.config.hello_interval.min(Duration::from_secs(2));
        self.arm(now + beacon_phase, TimerKind::Beacon);
        self.arm(now + hello_phase, TimerKind::TopologyHello);
        self.arm(now + NEIGHBOR_SCAVENGE_INTERVAL, TimerKind::NeighborScavenge);
        self.arm(now + ROUTE_MAINTENANCE_INTERVAL, TimerKind::RouteMaintenance);
        self.arm(now + NONCE_STROBE_INTERVAL, TimerKind::NonceStrobe);

        while self.running {
            let deadline = self
                .timers
                .peek()
                .map(|Reverse(entry)| entry.at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                maybe_frame = radio_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    self.handle_rx(frame);
                    // Bounded drain: keep latency fair against timers.
                    for _ in 1..self.config.max_frames_per_tick {
                        match radio_rx.try_recv() {
                            Ok(frame) => self.handle_rx(frame),
                            Err(_) => break,
                        }
                    }
                }

                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    self.handle_command(cmd);
                }

                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.fire_due_timer();
                }
            }

            if self.reboot_requested {
                self.reboot();
            }
        }

        self.persist_state();
        info!(addr = %self.addr, "mesh engine stopped");
    }

    /// Drop all volatile protocol state and reload from storage, as a power
    /// cycle would.
    fn reboot(&mut self) {
        info!(addr = %self.addr, "engine reboot");
        self.reboot_requested = false;
        self.persist_state();
        self.neighbors = NeighborTable::new(self.addr);
        self.routes = RouteTable::new();
        self.routing = Routing::new();
        self.transport = Transport::new(self.config.ack_timeout);
        self.mac = MacState::new(self.addr);
        self.control_q.clear();
        self.data_q.clear();
        match CryptoContext::load_or_generate(self.addr, self.store.as_ref()) {
            Ok(crypto) => {
                self.crypto = crypto;
                self.tx_disabled_reason = None;
            }
            Err(e) => {
                self.tx_disabled_reason = Some(format!("key load failed: {e}"));
            }
        }
        self.load_persisted_state();
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    fn arm(&mut self, at: Instant, kind: TimerKind) {
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry { at, seq: self.timer_seq, kind }));
    }

    /// Fire at most one due timer per iteration.
    fn fire_due_timer(&mut self) {
        let now = Instant::now();
        let due = match self.timers.peek() {
            Some(Reverse(entry)) if entry.at <= now => self.timers.pop().map(|Reverse(e)| e),
            _ => None,
        };
        let Some(entry) = due else { return };
        trace!(kind = ?entry.kind, "timer fired");

        match entry.kind {
            TimerKind::TxDue => self.pump_tx_queues(now),
            TimerKind::Retransmit(packet_id) => self.handle_retransmit_timer(packet_id, now),
            TimerKind::Beacon => {
                self.send_beacon(now);
                self.arm(now + self.config.beacon_interval, TimerKind::Beacon);
            }
            TimerKind::TopologyHello => {
                // One divergence evaluation per broadcast period.
                let local = self.neighbors.topology_hash();
                let divergent = self.neighbors.any_topology_divergence(local);
                if self.routing.evaluate_partition(divergent) {
                    self.emit(MeshEvent::PartitionDetected {
                        events: self.routing.partition_events(),
                    });
                    self.aggressive_discovery(now);
                }
                self.send_topology_hello(now);
                self.arm(now + self.config.hello_interval, TimerKind::TopologyHello);
            }
            TimerKind::NeighborScavenge => {
                self.scavenge_neighbors(now);
                self.arm(now + NEIGHBOR_SCAVENGE_INTERVAL, TimerKind::NeighborScavenge);
            }
            TimerKind::RouteMaintenance => {
                self.maintain_routes(now);
                self.arm(now + ROUTE_MAINTENANCE_INTERVAL, TimerKind::RouteMaintenance);
            }
            TimerKind::DiscoveryExpiry => {
                for (target, stranded) in self.routing.expire_discoveries(now) {
                    self.emit(MeshEvent::RouteLost { dest: target });
                    for frame in stranded {
                        if frame.header.source == self.addr {
                            self.emit(MeshEvent::SendFailed {
                                dest: target,
                                packet_id: frame.header.packet_id,
                                error: SendError::NoRoute(target),
                            });
                        }
                    }
                }
                if let Some(at) = self.routing.next_discovery_deadline() {
                    self.arm(at, TimerKind::DiscoveryExpiry);
                }
            }
            TimerKind::NonceStrobe => {
                if let Err(e) = self.crypto.persist_on_shutdown(self.store.as_ref()) {
                    error!(error = %e, "nonce strobe persist failed");
                }
                self.arm(now + NONCE_STROBE_INTERVAL, TimerKind::NonceStrobe);
            }
        }
    }

    // =========================================================================
    // TRANSMIT PATH
    // =========================================================================

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Seal (when enabled) and stage a locally built packet for the MAC.
    fn build_frame(
        &mut self,
        mut header: PacketHeader,
        payload: &Payload,
    ) -> Result<Frame, SendError> {
        header.network_id = self.crypto.network_id();
        header.sequence = self.next_sequence();
        let body = payload.encode();
        if body.len() > self.max_plaintext() {
            return Err(SendError::PayloadTooLarge {
                len: body.len(),
                max: self.max_plaintext(),
            });
        }
        let bytes = if self.config.encrypt {
            header.flags.set_encrypted(true);
            // payload_len covers the sealed bytes; fix it before AAD.
            header.payload_len = (body.len() + CRYPTO_OVERHEAD) as u8;
            match self
                .crypto
                .seal(self.store.as_ref(), &header.aad_bytes(), &body)
            {
                Ok(sealed) => sealed,
                Err(CryptoError::CounterExhausted) => {
                    self.tx_disabled_reason =
                        Some("nonce counter exhausted; re-key required".into());
                    return Err(SendError::CounterExhausted);
                }
                Err(e) => {
                    error!(error = %e, "seal failed");
                    return Err(SendError::CounterExhausted);
                }
            }
        } else {
            header.payload_len = body.len() as u8;
            body
        };
        Frame::new(header, bytes).map_err(|_| SendError::PayloadTooLarge {
            len: payload.encode().len(),
            max: self.max_plaintext(),
        })
    }

    pub(crate) fn max_plaintext(&self) -> usize {
        if self.config.encrypt {
            MAX_PAYLOAD - CRYPTO_OVERHEAD
        } else {
            MAX_PAYLOAD
        }
    }

    /// Queue a ready frame behind the MAC and arm the transmit timer.
    fn queue_tx(&mut self, frame: Frame, class: TxClass) {
        if self.tx_disabled_reason.is_some() {
            warn!("transmit refused: {}", self.tx_disabled_reason.as_deref().unwrap_or(""));
            return;
        }
        let now = Instant::now();
        let due = self.mac.next_tx_instant(now, class);
        let entry = QueuedTx { frame, due };
        match class {
            TxClass::Beacon | TxClass::Control => self.control_q.push_back(entry),
            TxClass::Data => self.data_q.push_back(entry),
        }
        self.arm(due, TimerKind::TxDue);
    }

    /// Transmit queue head(s) whose time has come, re-arming on carrier
    /// backoff. FIFO within each queue; control drains ahead of data.
    fn pump_tx_queues(&mut self, now: Instant) {
        let mut sent = 0;
        while sent < MAX_TX_PER_TICK {
            let from_control = match (self.control_q.front(), self.data_q.front()) {
                (Some(c), _) if c.due <= now => true,
                (_, Some(d)) if d.due <= now => false,
                _ => break,
            };
            let queue = if from_control { &mut self.control_q } else { &mut self.data_q };
            let busy = self.radio.channel_activity();
            match self.mac.clear_to_send(now, busy, &mut self.rng) {
                Ok(()) => {
                    let Some(entry) = queue.pop_front() else { break };
                    let bytes = entry.frame.encode();
                    match self.radio.tx(&bytes) {
                        Ok(()) => {
                            self.stats.tx_frames += 1;
                            trace!(
                                ptype = entry.frame.header.ptype.name(),
                                dest = %entry.frame.header.dest,
                                len = bytes.len(),
                                "frame transmitted"
                            );
                        }
                        Err(e) => {
                            self.stats.tx_errors += 1;
                            warn!(error = %e, "radio tx failed, frame dropped");
                        }
                    }
                    sent += 1;
                }
                Err(retry_at) => {
                    if let Some(head) = queue.front_mut() {
                        head.due = retry_at;
                    }
                    self.arm(retry_at, TimerKind::TxDue);
                    break;
                }
            }
        }
        // More queued work: make sure a timer exists for the earliest head.
        let next_due = [self.control_q.front(), self.data_q.front()]
            .into_iter()
            .flatten()
            .map(|e| e.due)
            .min();
        if let Some(at) = next_due {
            self.arm(at.max(now), TimerKind::TxDue);
        }
    }

    /// Application unicast entry point.
    fn do_send(&mut self, dest: NodeAddr, payload: Vec<u8>, ack: bool) -> Result<u16, SendError> {
        if !dest.is_valid_source() {
            return Err(SendError::BadDestination(dest));
        }
        if payload.len() > self.max_plaintext() {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_plaintext(),
            });
        }
        if ack && !self.transport.window_available() {
            return Err(SendError::WindowFull(self.transport.outstanding()));
        }

        let mut header = PacketHeader::new(PacketType::Data, self.addr, dest);
        header.ttl = self.config.default_ttl;
        header.channel = self.config.channel;
        header.packet_id = self.transport.next_packet_id();
        header.flags.set_ack_req(ack);

        let frame = self.build_frame(header, &Payload::Data(payload))?;
        let packet_id = frame.header.packet_id;
        self.dispatch_unicast(frame)?;
        Ok(packet_id)
    }

    /// Route (or start discovery for) a locally originated unicast frame.
    fn dispatch_unicast(&mut self, mut frame: Frame) -> Result<(), SendError> {
        let dest = frame.header.dest;
        let now = Instant::now();
        match self.routes.find_route(dest).map(|r| r.next_hop) {
            Some(next_hop) => {
                frame.header.next_hop = next_hop;
                self.commit_unicast(frame, now)
            }
            None if self.neighbors.contains(dest) => {
                // One hop away: no discovery required.
                frame.header.next_hop = dest;
                self.commit_unicast(frame, now)
            }
            None => {
                if let Some(request_id) = self.routing.start_discovery(dest, now) {
                    self.broadcast_route_request(dest, request_id);
                    if let Some(at) = self.routing.next_discovery_deadline() {
                        self.arm(at, TimerKind::DiscoveryExpiry);
                    }
                }
                if self.routing.buffer_frame(dest, frame) {
                    Ok(())
                } else {
                    self.routing.stats.no_route_drops += 1;
                    Err(SendError::NoRoute(dest))
                }
            }
        }
    }

    /// Hand a routed unicast frame to the MAC and, for ACK-required DATA,
    /// claim the pending slot and arm its retransmission timer.
    fn commit_unicast(&mut self, frame: Frame, now: Instant) -> Result<(), SendError> {
        let needs_slot =
            frame.header.ptype == PacketType::Data && frame.header.flags.ack_req();
        let class = if frame.header.ptype == PacketType::Data {
            TxClass::Data
        } else {
            TxClass::Control
        };
        if needs_slot {
            let deadline = self.transport.register(frame.clone(), now)?;
            self.arm(deadline, TimerKind::Retransmit(frame.header.packet_id));
        }
        self.queue_tx(frame, class);
        Ok(())
    }

    fn handle_retransmit_timer(&mut self, packet_id: u16, now: Instant) {
        // Keep retransmissions pointed at the current primary route.
        match self.transport.on_timeout(packet_id, now, &mut self.rng) {
            TimeoutAction::Retransmit { mut frame, deadline } => {
                if let Some(route) = self.routes.find_route(frame.header.dest) {
                    if route.next_hop != frame.header.next_hop {
                        frame.header.next_hop = route.next_hop;
                        self.transport.update_next_hop(packet_id, route.next_hop);
                    }
                }
                self.queue_tx(frame, TxClass::Data);
                self.arm(deadline, TimerKind::Retransmit(packet_id));
            }
            TimeoutAction::Failed { dest, packet_id, next_hop } => {
                self.handle_delivery_failure(dest, packet_id, next_hop);
            }
            TimeoutAction::Released => {}
        }
    }

    /// Retries exhausted: treat the link to `next_hop` as failed, fail over,
    /// and advertise what became unreachable.
    fn handle_delivery_failure(&mut self, dest: NodeAddr, packet_id: u16, next_hop: NodeAddr) {
        warn!(dest = %dest, via = %next_hop, packet_id, "link failure, promoting backups");
        let mut orphaned = self.routes.invalidate_via(next_hop);
        if self.routes.find_route(dest).is_none() && !orphaned.contains(&dest) {
            orphaned.push(dest);
        }
        self.emit(MeshEvent::SendFailed {
            dest,
            packet_id,
            error: SendError::NoRoute(dest),
        });
        for lost in &orphaned {
            self.emit(MeshEvent::RouteLost { dest: *lost });
        }
        self.broadcast_route_error(orphaned);
    }

    // =========================================================================
    // CONTROL PACKET EMISSION
    // =========================================================================

    fn control_header(&self, ptype: PacketType, dest: NodeAddr) -> PacketHeader {
        let mut header = PacketHeader::new(ptype, self.addr, dest);
        header.ttl = 1;
        header.channel = self.config.channel;
        header
    }

    pub(crate) fn send_beacon(&mut self, now: Instant) {
        let mut header = self.control_header(PacketType::Beacon, NodeAddr::BROADCAST);
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::Beacon { addr: self.addr, name: self.config.node_name.clone() };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.queue_tx(frame, TxClass::Beacon);
        }

        // Nodes holding a usable clock share it; a peer adopting it lands at
        // our stratum + 1, so anything at 14 or worse is not worth offering.
        let stratum = self.mac.effective_stratum(now);
        if stratum < 14 {
            if let Some(unix_secs) = self.mac.unix_time(now) {
                let mut header = self.control_header(PacketType::TimeSync, NodeAddr::BROADCAST);
                header.packet_id = self.transport.next_packet_id();
                let payload = Payload::TimeSync {
                    unix_secs,
                    stratum,
                    quality: self.mac.source_quality(),
                };
                if let Ok(frame) = self.build_frame(header, &payload) {
                    self.queue_tx(frame, TxClass::Beacon);
                }
            }
        }

        self.send_telemetry(now);
    }

    fn send_telemetry(&mut self, now: Instant) {
        let mut header = self.control_header(PacketType::Telemetry, NodeAddr::BROADCAST);
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::Telemetry {
            uptime_secs: now.saturating_duration_since(self.started).as_secs() as u32,
            // Hosted builds have no battery gauge; embedded drivers report
            // through their own telemetry feed.
            battery_mv: 0,
            tx_count: self.stats.tx_frames as u32,
            rx_count: self.stats.rx_frames as u32,
            // SF10/125 kHz full-frame airtime estimate.
            airtime_ms: (self.stats.tx_frames as u32).saturating_mul(330),
        };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.queue_tx(frame, TxClass::Beacon);
        }
    }

    fn send_topology_hello(&mut self, _now: Instant) {
        let mut header = self.control_header(PacketType::Hello, NodeAddr::BROADCAST);
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::Hello {
            topology_hash: self.neighbors.topology_hash(),
            neighbor_count: self.neighbors.len().min(255) as u8,
            reply_requested: false,
        };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.queue_tx(frame, TxClass::Control);
        }
    }

    fn send_hello_to(&mut self, neighbor: NodeAddr, reply_requested: bool) {
        let mut header = self.control_header(PacketType::Hello, neighbor);
        header.next_hop = neighbor;
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::Hello {
            topology_hash: self.neighbors.topology_hash(),
            neighbor_count: self.neighbors.len().min(255) as u8,
            reply_requested,
        };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.queue_tx(frame, TxClass::Control);
        }
    }

    fn send_ack_for(&mut self, origin: NodeAddr, acked_id: u16, channel: u8) {
        let mut header = PacketHeader::new(PacketType::Ack, self.addr, origin);
        header.ttl = self.config.default_ttl;
        header.channel = channel;
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::Ack { acked_id, from: self.addr };
        match self.build_frame(header, &payload) {
            Ok(frame) => {
                if let Err(e) = self.dispatch_unicast(frame) {
                    debug!(dest = %origin, error = %e, "could not route ack");
                }
            }
            Err(e) => debug!(error = %e, "ack build failed"),
        }
    }

    fn broadcast_route_request(&mut self, target: NodeAddr, request_id: u16) {
        let mut header = self.control_header(PacketType::RouteReq, NodeAddr::BROADCAST);
        header.ttl = self.config.default_ttl.max(2);
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::RouteReq {
            origin: self.addr,
            target,
            request_id,
            path_quality: 255,
        };
        // Remember our own flood so relays bouncing it back are ignored.
        self.routing.first_sighting(self.addr, request_id, Instant::now());
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.queue_tx(frame, TxClass::Control);
        }
    }

    fn send_route_reply(
        &mut self,
        via: NodeAddr,
        origin: NodeAddr,
        target: NodeAddr,
        request_id: u16,
        hop_count: u8,
        path_quality: u8,
    ) {
        let mut header = self.control_header(PacketType::RouteRep, via);
        header.next_hop = via;
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::RouteRep { origin, target, request_id, hop_count, path_quality };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.routing.stats.replies_sent += 1;
            self.queue_tx(frame, TxClass::Control);
        }
    }

    pub(crate) fn broadcast_route_error(&mut self, unreachable: Vec<NodeAddr>) {
        if unreachable.is_empty() {
            return;
        }
        let mut header = self.control_header(PacketType::RouteErr, NodeAddr::BROADCAST);
        header.packet_id = self.transport.next_packet_id();
        let payload = Payload::RouteErr { unreachable };
        if let Ok(frame) = self.build_frame(header, &payload) {
            self.routing.stats.errors_sent += 1;
            self.queue_tx(frame, TxClass::Control);
        }
    }

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    fn handle_rx(&mut self, received: ReceivedFrame) {
        self.stats.rx_frames += 1;
        let now = Instant::now();

        // Network isolation before any crypto work.
        if self.config.netid_filter {
            match PacketHeader::peek_network_id(&received.bytes) {
                Some(id) if id == self.crypto.network_id() => {}
                _ => {
                    self.stats.rx_netid_drops += 1;
                    return;
                }
            }
        }

        let frame = match Frame::decode(&received.bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.rx_codec_drops += 1;
                trace!(error = %e, "frame rejected");
                return;
            }
        };
        let header = frame.header;
        if header.source == self.addr || !header.source.is_valid_source() {
            return;
        }

        // DATA and ACK travel end-to-end under the originator's seal; all
        // other types are re-originated hop by hop, so their header source
        // is the link-level transmitter.
        let end_to_end = matches!(header.ptype, PacketType::Data | PacketType::Ack);

        if !end_to_end || header.hop_count == 0 {
            // The transmitter is identifiable: feed liveness and the MAC's
            // collision observer.
            if self.neighbors.observe(header.source, received.rssi_dbm, received.snr_db, now) {
                self.routing.note_topology_change();
                self.emit(MeshEvent::NeighborUp { addr: header.source });
            }
            self.mac.observe_rx(header.source, now);
        }

        if end_to_end && header.dest != self.addr && !header.is_broadcast() {
            // Unicast in transit. Only the addressed relay forwards.
            if header.next_hop != self.addr {
                self.stats.rx_overheard += 1;
                return;
            }
            if self.transport.check_seen(header.source, header.packet_id, now)
                == SeenStatus::Duplicate
            {
                return;
            }
            self.forward_unicast(frame, now);
            return;
        }

        // Duplicate suppression and broadcast re-flooding run before any
        // decryption: a retransmission reuses its nonce, so it must be
        // recognized (and re-ACKed) here rather than bounce off the replay
        // window.
        if header.ptype == PacketType::Data {
            let for_us = header.dest == self.addr;
            match self.transport.check_seen(header.source, header.packet_id, now) {
                SeenStatus::Duplicate => {
                    // The sender lost our ACK: acknowledge again, deliver
                    // never.
                    if for_us && header.flags.ack_req() {
                        self.transport.note_reack();
                        self.send_ack_for(header.source, header.packet_id, header.channel);
                    }
                    return;
                }
                SeenStatus::New => {}
            }
            if header.is_broadcast() && header.ttl > 1 {
                // Re-flood once; the seen cache suppresses any echo.
                let mut relay = frame.clone();
                relay.header.ttl -= 1;
                relay.header.hop_count = relay.header.hop_count.saturating_add(1);
                self.routing.stats.forwarded += 1;
                self.queue_tx(relay, TxClass::Data);
            }
        }

        // Local delivery (or per-hop control): decrypt, parse, dispatch.
        let body = if header.flags.encrypted() {
            match self
                .crypto
                .open(header.source, &header.aad_bytes(), &frame.payload)
            {
                Ok(body) => body,
                Err(e) => {
                    trace!(source = %header.source, error = %e, "frame failed authentication");
                    return;
                }
            }
        } else {
            frame.payload.clone()
        };

        let payload = match Payload::parse(header.ptype, &body) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.rx_codec_drops += 1;
                trace!(error = %e, "payload rejected");
                return;
            }
        };

        match payload {
            Payload::Data(data) => self.handle_data(frame, data),
            Payload::Ack { acked_id, from } => self.handle_ack(acked_id, from, now),
            Payload::RouteReq { origin, target, request_id, path_quality } => {
                self.handle_route_request(header, origin, target, request_id, path_quality, now)
            }
            Payload::RouteRep { origin, target, request_id, hop_count, path_quality } => {
                self.handle_route_reply(header, origin, target, request_id, hop_count, path_quality, now)
            }
            Payload::RouteErr { unreachable } => self.handle_route_error(header, unreachable),
            Payload::Hello { topology_hash, reply_requested, .. } => {
                self.handle_hello(header, topology_hash, reply_requested, now)
            }
            Payload::Telemetry { uptime_secs, battery_mv, .. } => {
                self.emit(MeshEvent::Telemetry { source: header.source, uptime_secs, battery_mv });
            }
            Payload::Beacon { addr, name } => {
                if addr.is_valid_source() && !name.is_empty() {
                    self.names.entry(addr).or_insert(name);
                }
            }
            Payload::TimeSync { unix_secs, stratum, quality } => {
                self.mac.observe_peer_sync(stratum, quality, unix_secs, now);
            }
        }
    }

    /// First-time local delivery; dedup and re-flooding already ran in the
    /// pre-decryption stage of `handle_rx`.
    fn handle_data(&mut self, frame: Frame, data: Vec<u8>) {
        let header = frame.header;
        let for_us = header.dest == self.addr;

        if header.channel == self.config.channel {
            self.emit(MeshEvent::Delivered {
                source: header.source,
                channel: header.channel,
                payload: data,
            });
        } else {
            trace!(channel = header.channel, "data filtered by channel tag");
        }
        if for_us && header.flags.ack_req() {
            self.send_ack_for(header.source, header.packet_id, header.channel);
        }
    }

    fn handle_ack(&mut self, acked_id: u16, from: NodeAddr, now: Instant) {
        if self.transport.on_ack(from, acked_id, now) {
            let rtt = self.transport.estimator_for(from).and_then(|e| e.srtt());
            self.emit(MeshEvent::Acked { dest: from, packet_id: acked_id, rtt });
        }
    }

    /// Forward a unicast DATA/ACK frame addressed through us.
    fn forward_unicast(&mut self, mut frame: Frame, now: Instant) {
        // TTL 1 dies here: decrement, observe zero, drop.
        if frame.header.ttl == 0 {
            self.routing.stats.ttl_drops += 1;
            return;
        }
        frame.header.ttl -= 1;
        if frame.header.ttl == 0 {
            self.routing.stats.ttl_drops += 1;
            trace!(dest = %frame.header.dest, "ttl expired in transit");
            return;
        }
        frame.header.hop_count = frame.header.hop_count.saturating_add(1);

        let dest = frame.header.dest;
        match self.routes.find_route(dest).map(|r| r.next_hop) {
            Some(next_hop) => {
                frame.header.next_hop = next_hop;
                self.routing.stats.forwarded += 1;
                self.queue_tx(frame, TxClass::Data);
            }
            None if self.neighbors.contains(dest) => {
                frame.header.next_hop = dest;
                self.routing.stats.forwarded += 1;
                self.queue_tx(frame, TxClass::Data);
            }
            None => {
                // Buffer briefly behind an on-demand discovery.
                if let Some(request_id) = self.routing.start_discovery(dest, now) {
                    self.broadcast_route_request(dest, request_id);
                    if let Some(at) = self.routing.next_discovery_deadline() {
                        self.arm(at, TimerKind::DiscoveryExpiry);
                    }
                }
                if !self.routing.buffer_frame(dest, frame) {
                    self.routing.stats.no_route_drops += 1;
                }
            }
        }
    }

    fn handle_route_request(
        &mut self,
        header: PacketHeader,
        origin: NodeAddr,
        target: NodeAddr,
        request_id: u16,
        path_quality: u8,
        now: Instant,
    ) {
        if origin == self.addr {
            return; // our own flood reflected back
        }
        // Quality of the path so far is the bottleneck of the advertised
        // quality and our link to the relay that delivered it.
        let link = self.neighbors.quality_of(header.source);
        let folded = path_quality.min(link);
        let first = self.routing.first_sighting(origin, request_id, now);

        // Reverse route toward the origin through the delivering relay.
        // Every copy of the flood teaches a different reverse path.
        self.routes
            .add_route(origin, header.source, header.hop_count.saturating_add(1), folded, now);

        if target == self.addr {
            // The target answers every copy: each reply travels a distinct
            // relay chain and the origin keeps the best ones as backups.
            self.send_route_reply(header.source, origin, target, request_id, 0, link);
            return;
        }

        // Relays act on the first sighting only; later copies are loops.
        if !first {
            return;
        }

        // Answer from a fresh route so a stale cache cannot poison the
        // origin; otherwise keep flooding while TTL allows.
        if let Some(route) = self.routes.find_route(target) {
            if route.freshness(now) == super::routes::RouteFreshness::Fresh {
                let hops = route.hop_count;
                let quality = route.quality.min(link);
                self.send_route_reply(header.source, origin, target, request_id, hops, quality);
                return;
            }
        }

        if header.ttl >= 2 {
            let mut relay = self.control_header(PacketType::RouteReq, NodeAddr::BROADCAST);
            relay.ttl = header.ttl - 1;
            relay.hop_count = header.hop_count.saturating_add(1);
            relay.packet_id = self.transport.next_packet_id();
            let payload = Payload::RouteReq { origin, target, request_id, path_quality: folded };
            if let Ok(frame) = self.build_frame(relay, &payload) {
                self.routing.stats.requests_relayed += 1;
                self.queue_tx(frame, TxClass::Control);
            }
        }
    }

    fn handle_route_reply(
        &mut self,
        header: PacketHeader,
        origin: NodeAddr,
        target: NodeAddr,
        request_id: u16,
        hop_count: u8,
        path_quality: u8,
        now: Instant,
    ) {
        if header.dest != self.addr {
            return;
        }
        let link = self.neighbors.quality_of(header.source);
        let folded = path_quality.min(link);

        // Forward route toward the target through the relay that delivered
        // the reply.
        self.routes
            .add_route(target, header.source, hop_count.saturating_add(1), folded, now);

        if origin == self.addr {
            // Our discovery concluded: release everything parked behind it.
            let drained = self.routing.complete_discovery(target);
            for frame in drained {
                let packet_id = frame.header.packet_id;
                if let Err(e) = self.dispatch_unicast(frame) {
                    self.emit(MeshEvent::SendFailed { dest: target, packet_id, error: e });
                }
            }
            return;
        }

        // Relay the reply one hop closer to the origin along the reverse
        // route installed while the request flooded through.
        match self.routes.find_route(origin).map(|r| r.next_hop) {
            Some(via) => {
                self.send_route_reply(
                    via,
                    origin,
                    target,
                    request_id,
                    hop_count.saturating_add(1),
                    folded,
                );
            }
            None => {
                debug!(origin = %origin, "reverse route gone, dropping route reply");
            }
        }
    }

    fn handle_route_error(&mut self, header: PacketHeader, unreachable: Vec<NodeAddr>) {
        let mut orphaned = Vec::new();
        for dest in unreachable {
            if dest == self.addr {
                continue;
            }
            if self.routes.invalidate_dest_via(dest, header.source) {
                orphaned.push(dest);
                self.emit(MeshEvent::RouteLost { dest });
            }
        }
        // Propagate only what we ourselves just lost; convergence is
        // guaranteed because each hop removes routes before re-advertising.
        self.broadcast_route_error(orphaned);
    }

    fn handle_hello(
        &mut self,
        header: PacketHeader,
        topology_hash: u32,
        reply_requested: bool,
        now: Instant,
    ) {
        // A peer announcing a different hash than before means the topology
        // is in motion; the per-period divergence evaluation happens on our
        // own broadcast timer.
        if self.neighbors.record_topology(header.source, topology_hash) {
            self.routing.note_topology_change();
        }

        if header.dest == self.addr {
            if reply_requested {
                self.send_hello_to(header.source, false);
            } else {
                // A solicited reply: the link works, refresh what rides it.
                self.routes.touch_all_via(header.source, now);
            }
        }
    }

    /// Partition response: re-announce ourselves, re-resolve every known
    /// destination, and re-verify each neighbor.
    fn aggressive_discovery(&mut self, now: Instant) {
        self.send_beacon(now);
        self.send_topology_hello(now);

        for dest in self.routes.known_destinations() {
            if let Some(request_id) = self.routing.start_discovery(dest, now) {
                self.broadcast_route_request(dest, request_id);
            }
        }
        if let Some(at) = self.routing.next_discovery_deadline() {
            self.arm(at, TimerKind::DiscoveryExpiry);
        }

        let neighbors: Vec<NodeAddr> = self.neighbors.iter().map(|n| n.addr).collect();
        for addr in neighbors {
            self.send_hello_to(addr, true);
        }
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    fn scavenge_neighbors(&mut self, now: Instant) {
        for lost in self.neighbors.scavenge(now) {
            self.routing.note_topology_change();
            self.emit(MeshEvent::NeighborDown { addr: lost });
            let orphaned = self.routes.invalidate_via(lost);
            for dest in &orphaned {
                self.emit(MeshEvent::RouteLost { dest: *dest });
            }
            self.broadcast_route_error(orphaned);
        }
    }

    fn maintain_routes(&mut self, now: Instant) {
        for lost in self.routes.scavenge(now) {
            self.emit(MeshEvent::RouteLost { dest: lost });
        }
        // Aging primaries get a lightweight keep-alive instead of a full
        // rediscovery round.
        let mut pinged: Vec<NodeAddr> = Vec::new();
        for (_, next_hop) in self.routes.refresh_candidates(now) {
            if !pinged.contains(&next_hop) {
                pinged.push(next_hop);
                self.send_hello_to(next_hop, true);
            }
        }
    }

    // =========================================================================
    // COMMANDS AND STATUS
    // =========================================================================

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { dest, payload, ack, reply } => {
                let _ = reply.send(self.do_send(dest, payload, ack));
            }
            Command::Broadcast { payload, reply } => {
                let _ = reply.send(self.do_broadcast(payload));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Neighbors { reply } => {
                let _ = reply.send(self.neighbors.iter().cloned().collect());
            }
            Command::Routes { reply } => {
                let _ = reply.send(self.routes.iter().copied().collect());
            }
            Command::Console { line, reply } => {
                let response = crate::console::handle_line(self, &line);
                let _ = reply.send(response);
            }
            Command::Shutdown => {
                self.running = false;
            }
        }
    }

    fn do_broadcast(&mut self, payload: Vec<u8>) -> Result<u16, SendError> {
        if payload.len() > self.max_plaintext() {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_plaintext(),
            });
        }
        let mut header = PacketHeader::new(PacketType::Data, self.addr, NodeAddr::BROADCAST);
        header.ttl = self.config.default_ttl;
        header.channel = self.config.channel;
        header.packet_id = self.transport.next_packet_id();
        let frame = self.build_frame(header, &Payload::Data(payload))?;
        let packet_id = frame.header.packet_id;
        self.queue_tx(frame, TxClass::Data);
        Ok(packet_id)
    }

    pub(crate) fn status(&self) -> NodeStatus {
        let now = Instant::now();
        NodeStatus {
            addr: self.addr,
            name: self.config.node_name.clone(),
            network_id: self.crypto.network_id(),
            uptime: now.saturating_duration_since(self.started),
            neighbor_count: self.neighbors.len(),
            route_count: self.routes.len(),
            window_in_use: self.transport.outstanding(),
            mac_mode: self.mac.mode(now),
            stratum: self.mac.effective_stratum(now),
            time_source: self.mac.source_kind(),
            channel: self.config.channel,
            encrypt: self.config.encrypt,
            partition_events: self.routing.partition_events(),
            tx_disabled_reason: self.tx_disabled_reason.clone(),
            stats: self.stats,
            crypto: self.crypto.stats(),
            transport: self.transport.stats(),
            mac: self.mac.stats(),
        }
    }

    /// Console-facing send used by `send <addr|name> <msg>`.
    pub(crate) fn console_send(&mut self, dest: NodeAddr, message: &str) -> Result<u16, SendError> {
        self.do_send(dest, message.as_bytes().to_vec(), true)
    }

    pub(crate) fn console_broadcast(&mut self, message: &str) -> Result<u16, SendError> {
        self.do_broadcast(message.as_bytes().to_vec())
    }

    pub(crate) fn resolve_name(&self, who: &str) -> Option<NodeAddr> {
        if let Ok(raw) = u32::from_str_radix(who.trim_start_matches("0x"), 16) {
            return Some(NodeAddr(raw));
        }
        self.names
            .iter()
            .find(|(_, name)| name.as_str() == who)
            .map(|(addr, _)| *addr)
    }

    fn emit(&mut self, event: MeshEvent) {
        if self.event_tx.try_send(event).is_err() {
            self.stats.events_dropped += 1;
        }
    }
}
