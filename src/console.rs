//! Line-oriented console command surface.
//!
//! Commands run on the engine thread (they arrive as engine commands), so
//! they may touch every table directly. Actions print `OK`; failures print a
//! one-line error. Keywords are stable — host tooling greps them.

use crate::crypto::{CryptoContext, NET_KEY_SIZE};
use crate::mesh::engine::Engine;
use crate::mesh::mac::TimeSourceKind;
use crate::types::NodeAddr;
use std::fmt::Write as _;
use std::time::Instant;

const HELP: &str = "commands:\n\
  status                      node summary\n\
  neighbors                   direct peers\n\
  routes                      route table\n\
  send <addr|name> <msg>      reliable unicast\n\
  broadcast <msg>             flood message\n\
  beacon                      transmit a beacon now\n\
  channel <0-7>               set application channel\n\
  psk set <phrase>            derive and install key from passphrase\n\
  psk show                    key fingerprint\n\
  psk export                  key as hex\n\
  psk import <hex>            install raw 32-byte key\n\
  netid [on|off]              network-id filtering\n\
  encrypt [on|off]            payload encryption\n\
  name [set|add|list] ...     friendly names\n\
  time <unix_seconds>         set clock (serial time source)\n\
  mac                         medium-access state\n\
  crypto                      crypto counters\n\
  reboot                      restart protocol state\n\
  factory_reset               wipe persisted state\n\
  help                        this text";

/// Execute one console line against the engine, returning the printable
/// response.
pub(crate) fn handle_line(engine: &mut Engine, line: &str) -> String {
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let keyword = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match keyword {
        "" => String::new(),
        "help" => HELP.to_string(),
        "status" => cmd_status(engine),
        "neighbors" => cmd_neighbors(engine),
        "routes" => cmd_routes(engine),
        "send" => cmd_send(engine, rest),
        "broadcast" => cmd_broadcast(engine, rest),
        "beacon" => {
            engine.send_beacon(Instant::now());
            "OK".into()
        }
        "channel" => cmd_channel(engine, rest),
        "psk" => cmd_psk(engine, rest),
        "netid" => cmd_toggle(rest, &mut engine.config.netid_filter, "netid"),
        "encrypt" => cmd_toggle(rest, &mut engine.config.encrypt, "encrypt"),
        "name" => cmd_name(engine, rest),
        "time" => cmd_time(engine, rest),
        "mac" => cmd_mac(engine),
        "crypto" => cmd_crypto(engine),
        "reboot" => {
            engine.reboot_requested = true;
            "OK".into()
        }
        "factory_reset" => cmd_factory_reset(engine),
        other => format!("error: unknown command '{other}' (try 'help')"),
    }
}

fn cmd_status(engine: &Engine) -> String {
    let s = engine.status();
    let mut out = String::new();
    let _ = writeln!(out, "node {} '{}'  net 0x{:04x}", s.addr, s.name, s.network_id);
    let _ = writeln!(
        out,
        "uptime {}s  neighbors {}  routes {}  window {}/{}",
        s.uptime.as_secs(),
        s.neighbor_count,
        s.route_count,
        s.window_in_use,
        crate::types::TX_WINDOW_SIZE
    );
    let _ = writeln!(
        out,
        "mac {:?}  stratum {} ({})  channel {}  encrypt {}",
        s.mac_mode,
        s.stratum,
        s.time_source.name(),
        s.channel,
        if s.encrypt { "on" } else { "off" }
    );
    let _ = write!(
        out,
        "rx {} (codec- {} netid- {})  tx {}  partitions {}",
        s.stats.rx_frames,
        s.stats.rx_codec_drops,
        s.stats.rx_netid_drops,
        s.stats.tx_frames,
        s.partition_events
    );
    if let Some(reason) = &s.tx_disabled_reason {
        let _ = write!(out, "\nTX DISABLED: {reason}");
    }
    out
}

fn cmd_neighbors(engine: &Engine) -> String {
    if engine.neighbors.is_empty() {
        return "no neighbors".into();
    }
    let now = Instant::now();
    let mut rows: Vec<String> = engine
        .neighbors
        .iter()
        .map(|n| {
            let name = engine
                .names
                .get(&n.addr)
                .map(String::as_str)
                .unwrap_or("-");
            format!(
                "{}  {:<16}  q {:>3}  rssi {:>4}  snr {:>5.1}  heard {:>3}s ago  pkts {}",
                n.addr,
                name,
                n.link_quality,
                n.rssi_dbm,
                n.snr_db,
                now.saturating_duration_since(n.last_heard).as_secs(),
                n.packet_count
            )
        })
        .collect();
    rows.sort();
    rows.join("\n")
}

fn cmd_routes(engine: &Engine) -> String {
    if engine.routes.is_empty() {
        return "no routes".into();
    }
    let now = Instant::now();
    let mut rows: Vec<String> = engine
        .routes
        .iter()
        .map(|r| {
            format!(
                "{} via {}  hops {}  q {:>3}  score {:>3}  {}{}",
                r.dest,
                r.next_hop,
                r.hop_count,
                r.quality,
                r.score,
                r.freshness(now).name(),
                if r.is_primary { "  *" } else { "" }
            )
        })
        .collect();
    rows.sort();
    rows.join("\n")
}

fn cmd_send(engine: &mut Engine, rest: &str) -> String {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let who = parts.next().unwrap_or("");
    let msg = parts.next().unwrap_or("").trim();
    if who.is_empty() || msg.is_empty() {
        return "error: usage: send <addr|name> <msg>".into();
    }
    let Some(dest) = engine.resolve_name(who) else {
        return format!("error: unknown destination '{who}'");
    };
    match engine.console_send(dest, msg) {
        Ok(packet_id) => format!("OK id {packet_id}"),
        Err(e) => format!("error: {e}"),
    }
}

fn cmd_broadcast(engine: &mut Engine, msg: &str) -> String {
    if msg.is_empty() {
        return "error: usage: broadcast <msg>".into();
    }
    match engine.console_broadcast(msg) {
        Ok(packet_id) => format!("OK id {packet_id}"),
        Err(e) => format!("error: {e}"),
    }
}

fn cmd_channel(engine: &mut Engine, rest: &str) -> String {
    match rest.parse::<u8>() {
        Ok(ch) if ch <= 7 => {
            engine.config.channel = ch;
            "OK".into()
        }
        _ => "error: usage: channel <0-7>".into(),
    }
}

fn cmd_psk(engine: &mut Engine, rest: &str) -> String {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();
    match sub {
        "set" => {
            if arg.is_empty() {
                return "error: usage: psk set <phrase>".into();
            }
            let key = CryptoContext::derive_key(arg);
            match engine.crypto.rotate_key(engine.store.as_ref(), key) {
                Ok(()) => {
                    engine.tx_disabled_reason = None;
                    "OK".into()
                }
                Err(e) => format!("error: {e}"),
            }
        }
        "show" => {
            let key = engine.crypto.key_bytes();
            format!(
                "psk {}..  net 0x{:04x}",
                hex::encode(&key[..4]),
                engine.crypto.network_id()
            )
        }
        "export" => hex::encode(engine.crypto.key_bytes()),
        "import" => {
            let Ok(bytes) = hex::decode(arg) else {
                return "error: invalid hex".into();
            };
            let Ok(key) = <[u8; NET_KEY_SIZE]>::try_from(bytes.as_slice()) else {
                return format!("error: key must be {NET_KEY_SIZE} bytes");
            };
            match engine.crypto.rotate_key(engine.store.as_ref(), key) {
                Ok(()) => {
                    engine.tx_disabled_reason = None;
                    "OK".into()
                }
                Err(e) => format!("error: {e}"),
            }
        }
        _ => "error: usage: psk set|show|export|import".into(),
    }
}

fn cmd_toggle(arg: &str, flag: &mut bool, label: &str) -> String {
    match arg {
        "" => format!("{label} {}", if *flag { "on" } else { "off" }),
        "on" => {
            *flag = true;
            "OK".into()
        }
        "off" => {
            *flag = false;
            "OK".into()
        }
        _ => format!("error: usage: {label} [on|off]"),
    }
}

fn cmd_name(engine: &mut Engine, rest: &str) -> String {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();
    match sub {
        "set" => {
            if arg.is_empty() || arg.len() > 16 {
                return "error: name must be 1-16 bytes".into();
            }
            engine.config.node_name = arg.to_string();
            "OK".into()
        }
        "add" => {
            let mut pieces = arg.splitn(2, char::is_whitespace);
            let addr = pieces.next().unwrap_or("");
            let name = pieces.next().unwrap_or("").trim();
            let Ok(raw) = u32::from_str_radix(addr.trim_start_matches("0x"), 16) else {
                return "error: usage: name add <addr> <name>".into();
            };
            if name.is_empty() || name.len() > 16 {
                return "error: name must be 1-16 bytes".into();
            }
            engine.names.insert(NodeAddr(raw), name.to_string());
            "OK".into()
        }
        "list" | "" => {
            let mut rows: Vec<String> = engine
                .names
                .iter()
                .map(|(addr, name)| format!("{addr}  {name}"))
                .collect();
            rows.push(format!("{}  {} (self)", engine.addr, engine.config.node_name));
            rows.sort();
            rows.join("\n")
        }
        _ => "error: usage: name set|add|list".into(),
    }
}

fn cmd_time(engine: &mut Engine, rest: &str) -> String {
    match rest.parse::<u64>() {
        Ok(unix_secs) if unix_secs > 0 => {
            engine
                .mac
                .adopt_local_source(TimeSourceKind::Serial, 50, unix_secs, Instant::now());
            "OK".into()
        }
        _ => "error: usage: time <unix_seconds>".into(),
    }
}

fn cmd_mac(engine: &Engine) -> String {
    let now = Instant::now();
    let stats = engine.mac.stats();
    format!(
        "mode {:?}  stratum {} ({} q{})  slot {}\n\
         tx slotted {} cs {} forced {}  backoffs {}  collisions {} repicks {}",
        engine.mac.mode(now),
        engine.mac.effective_stratum(now),
        engine.mac.source_kind().name(),
        engine.mac.source_quality(),
        engine.mac.active_slot(),
        stats.slotted_tx,
        stats.carrier_sense_tx,
        stats.forced_tx,
        stats.backoffs,
        stats.slot_collisions,
        stats.slot_repicks,
    )
}

fn cmd_crypto(engine: &Engine) -> String {
    let stats = engine.crypto.stats();
    format!(
        "net 0x{:04x}  sealed {}  opened {}  auth-fail {}  replay {}  nonces left {}",
        engine.crypto.network_id(),
        stats.sealed,
        stats.opened,
        stats.auth_failures,
        stats.replays_rejected,
        engine.crypto.nonces_remaining(),
    )
}

fn cmd_factory_reset(engine: &mut Engine) -> String {
    match engine.store.clear() {
        Ok(()) => {
            engine.names.clear();
            engine.config.node_name.clear();
            engine.reboot_requested = true;
            "OK".into()
        }
        Err(e) => format!("error: {e}"),
    }
}
