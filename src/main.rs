//! ChirpNet node shell.
//!
//! Runs the protocol engine against a UDP-multicast radio shim so nodes can
//! mesh on a LAN without real hardware, and exposes the line console on
//! stdin. Embedded targets link the library and supply a real LoRa driver
//! instead.

use chirpnet::mesh::radio::RadioRxSender;
use chirpnet::{
    Engine, MeshConfig, MeshEvent, RadioDriver, RadioError, RadioParams, ReceivedFrame,
    SledStore, radio_rx_queue,
};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Multicast group standing in for the shared radio channel.
const RADIO_GROUP: Ipv4Addr = Ipv4Addr::new(239, 42, 9, 15);

#[derive(Parser)]
#[command(name = "chirpnet", version, about = "ChirpNet mesh node")]
struct Args {
    /// Data directory for persisted state
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Friendly node name (<=16 chars)
    #[arg(short, long, default_value = "")]
    name: String,

    /// Application channel tag (0-7)
    #[arg(short, long, default_value = "0")]
    channel: u8,

    /// Hardware serial override; the node address derives from this
    #[arg(short, long)]
    serial: Option<String>,

    /// UDP port standing in for the radio channel
    #[arg(short, long, default_value = "47915")]
    port: u16,

    /// Set the network key from a passphrase before starting
    #[arg(long)]
    psk: Option<String>,
}

/// UDP-multicast stand-in for the LoRa transceiver. Every node bound to the
/// same group and port hears every transmission, like a shared channel.
struct UdpRadio {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
}

impl UdpRadio {
    fn open(port: u16, rx_tx: RadioRxSender) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        socket.join_multicast_v4(&RADIO_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        // Loopback stays on; the engine drops frames carrying its own
        // source address.
        socket.set_multicast_loop_v4(true)?;
        let socket = Arc::new(socket);

        // Receive side: a blocking reader thread plays the interrupt
        // handler, doing nothing but pushing raw frames at the engine.
        let reader = Arc::clone(&socket);
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                match reader.recv_from(&mut buf) {
                    Ok((len, _peer)) => {
                        let frame = ReceivedFrame {
                            bytes: buf[..len].to_vec(),
                            // Wired transport: report a clean strong link.
                            rssi_dbm: -60,
                            snr_db: 10.0,
                        };
                        // Overflow is dropped here, exactly as a saturated
                        // receiver would lose the frame on air.
                        let _ = rx_tx.try_send(frame);
                    }
                    Err(e) => {
                        error!(error = %e, "radio socket receive failed");
                        return;
                    }
                }
            }
        });

        Ok(Self { socket, group: SocketAddrV4::new(RADIO_GROUP, port) })
    }
}

impl RadioDriver for UdpRadio {
    fn tx(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.socket
            .send_to(bytes, self.group)
            .map(|_| ())
            .map_err(|e| RadioError::TxFailed(e.to_string()))
    }

    fn rx_poll(&mut self) -> Option<ReceivedFrame> {
        // Reception is push-based through the RX queue.
        None
    }

    fn set_params(&mut self, _params: RadioParams) -> Result<(), RadioError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chirpnet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("════════════════════════════════════════════════════════════");
    info!("  ChirpNet v{VERSION} — mesh node");
    info!("════════════════════════════════════════════════════════════");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(error = %e, "cannot create data directory");
        return;
    }
    let store = match SledStore::open(args.data_dir.join("state")) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open storage");
            return;
        }
    };

    let (radio_tx, radio_rx) = radio_rx_queue();
    let radio = match UdpRadio::open(args.port, radio_tx) {
        Ok(radio) => radio,
        Err(e) => {
            error!(error = %e, "cannot open radio socket");
            return;
        }
    };

    let serial = args
        .serial
        .clone()
        .unwrap_or_else(|| args.data_dir.to_string_lossy().into_owned());

    let config = MeshConfig {
        node_name: args.name.clone(),
        channel: args.channel.min(7),
        ..Default::default()
    };

    let (engine, handle, mut events) = match Engine::new(
        serial.as_bytes(),
        config,
        Box::new(store),
        Box::new(radio),
        radio_rx,
    ) {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "engine initialization failed");
            return;
        }
    };

    let engine_task = tokio::spawn(engine.run());

    if let Some(phrase) = &args.psk {
        match handle.console(&format!("psk set {phrase}")).await {
            Ok(reply) if reply == "OK" => info!("network key set from passphrase"),
            Ok(reply) => warn!("psk set: {reply}"),
            Err(e) => warn!(error = %e, "psk set failed"),
        }
    }

    // Event printer.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MeshEvent::Delivered { source, channel, payload } => {
                    let text = String::from_utf8_lossy(&payload);
                    info!("[{source}] ch{channel}: {text}");
                }
                MeshEvent::Acked { dest, packet_id, rtt } => {
                    info!("delivered to {dest} (id {packet_id}, rtt {rtt:?})");
                }
                MeshEvent::SendFailed { dest, packet_id, error } => {
                    warn!("send to {dest} failed (id {packet_id}): {error}");
                }
                MeshEvent::RouteLost { dest } => info!("route lost: {dest}"),
                MeshEvent::PartitionDetected { events } => {
                    warn!("partition detected (event #{events})");
                }
                MeshEvent::NeighborUp { addr } => info!("neighbor up: {addr}"),
                MeshEvent::NeighborDown { addr } => info!("neighbor down: {addr}"),
                MeshEvent::Telemetry { source, uptime_secs, battery_mv } => {
                    info!("telemetry from {source}: up {uptime_secs}s, {battery_mv}mV");
                }
            }
        }
    });

    // Console REPL on stdin.
    let console_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match console_handle.console(&line).await {
                Ok(reply) if !reply.is_empty() => println!("{reply}"),
                Ok(_) => {}
                Err(e) => {
                    println!("error: {e}");
                    break;
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    handle.shutdown().await;
    let _ = engine_task.await;
}
