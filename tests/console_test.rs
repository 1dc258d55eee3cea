//! Console command surface: exact keywords, OK/error replies.

mod common;

use common::SimNet;
use std::time::Duration;

#[tokio::test]
async fn status_neighbors_routes_render() {
    let net = SimNet::new();
    let a = net.add_node("con-a").await;
    let b = net.add_node("con-b").await;
    net.link(&a, &b);

    let status = a.handle.console("status").await.unwrap();
    assert!(status.contains(&format!("node {}", a.addr)));
    assert!(status.contains("net 0x"));

    // Nothing heard yet: both tables render their empty form.
    assert_eq!(a.handle.console("neighbors").await.unwrap(), "no neighbors");
    assert_eq!(a.handle.console("routes").await.unwrap(), "no routes");

    // After a beacon round the peer shows up.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let neighbors = a.handle.console("neighbors").await.unwrap();
    assert!(neighbors.contains(&b.addr.to_string()), "neighbors: {neighbors}");
}

#[tokio::test]
async fn send_and_broadcast_keywords() {
    let net = SimNet::new();
    let a = net.add_node("con-send-a").await;
    let b = net.add_node("con-send-b").await;
    net.link(&a, &b);

    let reply = a
        .handle
        .console(&format!("send {} hello there", b.addr))
        .await
        .unwrap();
    assert!(reply.starts_with("OK id "), "got: {reply}");

    let reply = a.handle.console("broadcast hello everyone").await.unwrap();
    assert!(reply.starts_with("OK id "), "got: {reply}");

    assert!(a.handle.console("send").await.unwrap().starts_with("error:"));
    assert!(
        a.handle
            .console("send nosuchname hi")
            .await
            .unwrap()
            .starts_with("error:")
    );
    assert!(a.handle.console("broadcast").await.unwrap().starts_with("error:"));
}

#[tokio::test]
async fn name_table_commands() {
    let net = SimNet::new();
    let a = net.add_node("con-name").await;

    assert_eq!(a.handle.console("name set basecamp").await.unwrap(), "OK");
    assert_eq!(a.handle.console("name add 0x12345678 ridge").await.unwrap(), "OK");

    let listing = a.handle.console("name list").await.unwrap();
    assert!(listing.contains("basecamp"));
    assert!(listing.contains("12345678  ridge"));

    // A named destination resolves for send (no route yet, but accepted).
    let reply = a.handle.console("send ridge hi").await.unwrap();
    assert!(reply.starts_with("OK id "), "got: {reply}");

    assert!(
        a.handle
            .console("name set this-name-is-way-too-long")
            .await
            .unwrap()
            .starts_with("error:")
    );
}

#[tokio::test]
async fn psk_roundtrip_and_toggles() {
    let net = SimNet::new();
    let a = net.add_node("con-psk").await;

    assert_eq!(a.handle.console("psk set winter ridge").await.unwrap(), "OK");
    let exported = a.handle.console("psk export").await.unwrap();
    assert_eq!(exported.len(), 64, "32-byte key as hex");

    let shown = a.handle.console("psk show").await.unwrap();
    assert!(shown.contains("net 0x"));

    assert_eq!(
        a.handle.console(&format!("psk import {exported}")).await.unwrap(),
        "OK"
    );
    assert!(a.handle.console("psk import zz").await.unwrap().starts_with("error:"));

    assert_eq!(a.handle.console("encrypt off").await.unwrap(), "OK");
    assert_eq!(a.handle.console("encrypt").await.unwrap(), "encrypt off");
    assert_eq!(a.handle.console("encrypt on").await.unwrap(), "OK");
    assert_eq!(a.handle.console("netid off").await.unwrap(), "OK");
    assert_eq!(a.handle.console("netid").await.unwrap(), "netid off");
}

#[tokio::test]
async fn misc_commands_and_errors() {
    let net = SimNet::new();
    let a = net.add_node("con-misc").await;

    assert_eq!(a.handle.console("channel 5").await.unwrap(), "OK");
    assert!(a.handle.console("status").await.unwrap().contains("channel 5"));
    assert!(a.handle.console("channel 9").await.unwrap().starts_with("error:"));

    assert_eq!(a.handle.console("time 1755000000").await.unwrap(), "OK");
    let mac = a.handle.console("mac").await.unwrap();
    assert!(mac.contains("stratum 2"), "serial time source adopted: {mac}");

    assert_eq!(a.handle.console("beacon").await.unwrap(), "OK");
    assert!(a.handle.console("crypto").await.unwrap().contains("sealed"));
    assert!(a.handle.console("help").await.unwrap().contains("factory_reset"));
    assert!(a.handle.console("frobnicate").await.unwrap().starts_with("error:"));
}

#[tokio::test]
async fn reboot_and_factory_reset_keep_engine_alive() {
    let net = SimNet::new();
    let a = net.add_node("con-reset").await;

    let key_before = a.handle.console("psk export").await.unwrap();
    assert_eq!(a.handle.console("reboot").await.unwrap(), "OK");
    // The engine comes back with the same persisted key.
    let key_after = a.handle.console("psk export").await.unwrap();
    assert_eq!(key_before, key_after);

    assert_eq!(a.handle.console("factory_reset").await.unwrap(), "OK");
    // A fresh key was generated after the wipe.
    let key_fresh = a.handle.console("psk export").await.unwrap();
    assert_eq!(key_fresh.len(), 64);
    assert_ne!(key_fresh, key_before);

    // Still responsive.
    assert!(a.handle.console("status").await.unwrap().contains("node "));
}
