//! Device events, internal `spark/` handling, and subscriptions.

mod harness;

use cl_protocol::{CoapCode, MessageKind};
use gateway::collaborators::attr;
use gateway::collaborators::AttributeStore;
use harness::{Harness, wait_until};

#[tokio::test]
async fn confirmable_public_event_is_published_and_acked() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(1).await;

    let event_id = device.send_event(true, "temp", b"72", true).await.unwrap();

    // EventAck carries the original message id.
    let ack = device.read_message().await.unwrap();
    assert!(ack.is_ack());
    assert_eq!(ack.id, event_id);
    assert!(ack.code.is_empty());

    let records = harness.publisher.recorded_named("temp");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.is_public);
    assert_eq!(record.ttl, 60);
    assert_eq!(record.data.as_deref(), Some(&b"72"[..]));
    assert_eq!(record.device_id, id);
}

#[tokio::test]
async fn rate_limited_publish_answers_event_slowdown() {
    let harness = Harness::new();
    let (mut device, _id) = harness.connect_ready(2).await;

    harness.publisher.set_rate_limited(true);
    let event_id = device.send_event(true, "burst", b"x", true).await.unwrap();

    let reply = device.read_message().await.unwrap();
    assert!(reply.is_ack());
    assert_eq!(reply.id, event_id);
    assert_eq!(reply.code, CoapCode::TOO_MANY_REQUESTS);
    assert!(harness.publisher.recorded().is_empty());
}

#[tokio::test]
async fn claim_code_event_links_the_device_and_stays_internal() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(3).await;

    let event_id = device
        .send_event(false, "spark/device/claim/code", b"ABCDEF", true)
        .await
        .unwrap();
    let ack = device.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == event_id);

    let attrs = harness.attributes.get_core_attributes(&id);
    assert_eq!(attrs.get(attr::CLAIM_CODE).map(String::as_str), Some("ABCDEF"));
    let linked = harness.api.linked.lock().unwrap().clone();
    assert_eq!(linked, vec![(id, "ABCDEF".to_owned(), 6)]);
    assert!(
        harness.publisher.recorded().is_empty(),
        "internal events must not be republished"
    );

    // Resending the same code is acknowledged but links only once.
    let event_id = device
        .send_event(false, "spark/device/claim/code", b"ABCDEF", true)
        .await
        .unwrap();
    let ack = device.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == event_id);
    assert_eq!(harness.api.linked.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn system_version_event_records_the_attribute() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(4).await;

    let event_id = device
        .send_event(false, "spark/device/system/version", b"5.4.1", true)
        .await
        .unwrap();
    let ack = device.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == event_id);

    let attrs = harness.attributes.get_core_attributes(&id);
    assert_eq!(
        attrs.get(attr::SYSTEM_VERSION).map(String::as_str),
        Some("5.4.1")
    );
}

#[tokio::test]
async fn safemode_event_forwards_a_describe_to_the_api() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(5).await;

    device
        .send_event(false, "spark/device/safemode", &[], true)
        .await
        .unwrap();

    // The gateway asks for a describe document; answer it, and collect the
    // EventAck on the way (ordering between the two is not fixed).
    let doc = br#"{"v":{},"f":[]}"#;
    let mut answered = false;
    for _ in 0..2 {
        let message = device.read_message().await.unwrap();
        if message.is_ack() {
            continue;
        }
        assert_eq!(MessageKind::classify_request(&message), MessageKind::Describe);
        device.reply(&message, CoapCode::CONTENT, doc).await.unwrap();
        answered = true;
    }
    assert!(answered, "describe request must arrive");

    wait_until(|| {
        let api = harness.api.clone();
        async move { !api.safe_modes.lock().unwrap().is_empty() }
    })
    .await;
    let safe_modes = harness.api.safe_modes.lock().unwrap().clone();
    assert_eq!(safe_modes[0].0, id);
    assert_eq!(safe_modes[0].1, doc.to_vec());
}

#[tokio::test]
async fn other_internal_events_are_acked_and_dropped() {
    let harness = Harness::new();
    let (mut device, _id) = harness.connect_ready(6).await;

    let event_id = device
        .send_event(false, "spark/diagnostics/blob", b"...", true)
        .await
        .unwrap();
    let ack = device.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == event_id);
    assert!(harness.publisher.recorded().is_empty());
}

#[tokio::test]
async fn empty_subscribe_name_is_rejected() {
    let harness = Harness::new();
    let (mut device, _id) = harness.connect_ready(7).await;

    device.send_subscribe("", false, None).await.unwrap();
    let reply = device.read_message().await.unwrap();
    assert!(reply.is_ack());
    assert_eq!(reply.code, CoapCode::BAD_REQUEST);
}

#[tokio::test]
async fn subscription_fans_events_out_to_the_device() {
    let harness = Harness::new();
    let (mut subscriber, _sub_id) = harness.connect_ready(8).await;
    let (mut publisher_dev, pub_id) = harness.connect_ready(9).await;

    // Subscribe to the "temp" prefix.
    subscriber.send_subscribe("temp", false, None).await.unwrap();
    let ack = subscriber.read_message().await.unwrap();
    assert!(ack.is_ack());
    assert_eq!(ack.code, CoapCode::CONTENT);

    // Another device publishes a matching public event.
    let event_id = publisher_dev
        .send_event(true, "temperature", b"98.6", true)
        .await
        .unwrap();
    let ack = publisher_dev.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == event_id);

    // The subscriber receives it as a public event frame.
    let delivered = subscriber.read_message().await.unwrap();
    assert_eq!(
        MessageKind::classify_request(&delivered),
        MessageKind::PublicEvent
    );
    assert_eq!(delivered.uri_path, "E/temperature");
    assert_eq!(delivered.payload, b"98.6");
    assert_eq!(delivered.max_age, Some(60));
    assert!(delivered.timestamp.is_some());

    // Scoped delivery: the record kept the publisher's identity.
    let records = harness.publisher.recorded_named("temperature");
    assert_eq!(records[0].device_id, pub_id);
}

#[tokio::test]
async fn device_filtered_subscription_ignores_other_devices() {
    let harness = Harness::new();
    let (mut subscriber, _sub_id) = harness.connect_ready(10).await;
    let (mut wanted, wanted_id) = harness.connect_ready(11).await;
    let (mut unwanted, _unwanted_id) = harness.connect_ready(12).await;

    subscriber
        .send_subscribe("m", false, Some(wanted_id))
        .await
        .unwrap();
    let ack = subscriber.read_message().await.unwrap();
    assert_eq!(ack.code, CoapCode::CONTENT);

    let id = unwanted.send_event(true, "motion", b"no", true).await.unwrap();
    let ack = unwanted.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == id);

    let id = wanted.send_event(true, "motion", b"yes", true).await.unwrap();
    let ack = wanted.read_message().await.unwrap();
    assert!(ack.is_ack() && ack.id == id);

    // Only the filtered device's event arrives.
    let delivered = subscriber.read_message().await.unwrap();
    assert_eq!(delivered.payload, b"yes");
}
