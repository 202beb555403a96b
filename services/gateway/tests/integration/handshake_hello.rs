//! Handshake and Hello lifecycle.
//!
//! Covers: handshake + Hello exchange into READY, unknown-device
//! rejection, keepalive pings, GetTime, counter violations, and the
//! exactly-once disconnect signal.

mod harness;

use cl_protocol::{CoapCode, CoapType, Message};
use gateway::collaborators::attr;
use gateway::collaborators::AttributeStore;
use harness::{Harness, wait_until};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn handshake_and_hello_reach_ready() {
    let harness = Harness::new();

    // Server hello must come back within the 2-second budget.
    let (mut device, id) = tokio::time::timeout(Duration::from_secs(2), harness.connect_ready(1))
        .await
        .expect("handshake + hello within 2s");

    assert_eq!(harness.state.connected_count().await, 1);
    let attrs = harness.attributes.get_core_attributes(&id);
    assert_eq!(attrs.get(attr::PRODUCT_ID).map(String::as_str), Some("6"));

    // Session stays live: a keepalive probe round-trips.
    device.send_ping().await.expect("ping ack");
}

#[tokio::test]
async fn unknown_device_id_is_rejected_at_handshake() {
    let harness = Harness::new();
    let (client_io, server_io) = tokio::io::duplex(4096);
    tokio::spawn(gateway::handle_connection(server_io, harness.state.clone()));

    let (mut read, mut write) = tokio::io::split(client_io);
    write.write_all(&cl_crypto::random_nonce()).await.unwrap();
    // An id the keystore has never seen.
    write.write_all(&[0xBB; 12]).await.unwrap();

    // The gateway closes the socket without a challenge.
    let mut buf = [0u8; 1];
    let outcome = tokio::time::timeout(Duration::from_secs(2), read.read(&mut buf))
        .await
        .expect("gateway should close promptly");
    assert!(matches!(outcome, Ok(0) | Err(_)), "expected EOF, got {outcome:?}");
    assert_eq!(harness.state.connected_count().await, 0);
}

#[tokio::test]
async fn get_time_returns_a_unix_timestamp_with_the_token() {
    let harness = Harness::new();
    let (mut device, _id) = harness.connect_ready(2).await;

    let reply = device.send_get_time().await.expect("time reply");
    assert!(reply.is_ack());
    assert_eq!(reply.code, CoapCode::CONTENT);
    assert_eq!(reply.token.len(), 1, "token echoed");
    let stamp = u32::from_le_bytes(reply.payload.as_slice().try_into().expect("4-byte payload"));
    assert!(stamp > 1_700_000_000, "plausible UTC seconds, got {stamp}");
}

#[tokio::test]
async fn counter_violation_disconnects_the_session() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(3).await;
    let mut disconnects = harness.state.subscribe_disconnects();

    // A frame with a message id far from the expected counter.
    let mut rogue = Message::empty(CoapType::Confirmable, CoapCode::POST, 0x5555);
    rogue.uri_path = "E/temp".to_owned();
    device.send_message(&rogue).await.unwrap();

    let dropped = tokio::time::timeout(Duration::from_secs(2), disconnects.recv())
        .await
        .expect("disconnect within 2s")
        .expect("signal delivered");
    assert_eq!(dropped, id);
    wait_until(|| {
        let state = harness.state.clone();
        async move { state.session(&id).await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn dropped_socket_emits_exactly_one_disconnect_signal() {
    let harness = Harness::new();
    let (device, id) = harness.connect_ready(4).await;
    let mut disconnects = harness.state.subscribe_disconnects();

    drop(device);

    let dropped = tokio::time::timeout(Duration::from_secs(2), disconnects.recv())
        .await
        .expect("disconnect within 2s")
        .expect("signal delivered");
    assert_eq!(dropped, id);

    // No second signal arrives for the same teardown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        disconnects.try_recv().is_err(),
        "disconnect must fire exactly once"
    );
    assert_eq!(harness.state.connected_count().await, 0);
}

#[tokio::test]
async fn reconnect_replaces_the_session_index_entry() {
    let harness = Harness::new();
    let (_first, id) = harness.connect_ready(5).await;
    let first_handle = harness.state.session(&id).await.expect("indexed");

    // Same device id connects again; keys are re-registered by the harness.
    let (_second, _) = harness.connect_ready(5).await;
    let second_handle = harness.state.session(&id).await.expect("still indexed");
    assert_ne!(first_handle.serial, second_handle.serial);
    assert_eq!(harness.state.connected_count().await, 1);
}
