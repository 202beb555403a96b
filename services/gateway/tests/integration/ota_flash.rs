//! OTA flashing: chunked transfer, CRC retransmits, exclusive ownership.

mod harness;

use cl_protocol::{CoapCode, MessageKind};
use gateway::api::ApiReply;
use gateway::error::GatewayError;
use gateway::flasher::FlashError;
use harness::Harness;

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[tokio::test]
async fn flash_retransmits_on_bad_crc_and_completes() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(1).await;
    let image = firmware(1500);

    let state = harness.state.clone();
    let payload = image.clone();
    let api = tokio::spawn(async move { state.flash(&id, payload).await });

    // UpdateBegin announces length and chunk size.
    let begin = device.read_message().await.unwrap();
    assert_eq!(MessageKind::classify_request(&begin), MessageKind::UpdateBegin);
    assert_eq!(&begin.payload[0..4], &1500u32.to_le_bytes());
    assert_eq!(&begin.payload[4..6], &512u16.to_le_bytes());
    device.reply(&begin, CoapCode::CHANGED, &[]).await.unwrap();

    // Three chunks; the second is first acked with a wrong CRC.
    let mut received: Vec<u8> = Vec::new();
    let mut chunk_frames = 0;
    let mut corrupted_once = false;
    loop {
        let message = device.read_message().await.unwrap();
        match MessageKind::classify_request(&message) {
            MessageKind::Chunk => {
                chunk_frames += 1;
                assert_eq!(message.payload.len(), 512);
                let is_second = received.len() == 512 && !corrupted_once;
                if is_second {
                    corrupted_once = true;
                    device
                        .reply_chunk_received(&message, 0xBAD0_C0DE)
                        .await
                        .unwrap();
                } else {
                    if corrupted_once && received.len() == 512 {
                        // Retransmit must carry the same bytes.
                        assert_eq!(message.payload, &image[512..1024]);
                    }
                    let crc = cl_crypto::crc32(&message.payload);
                    received.extend_from_slice(&message.payload);
                    device.reply_chunk_received(&message, crc).await.unwrap();
                }
            }
            MessageKind::UpdateDone => break,
            other => panic!("unexpected frame during flash: {other:?}"),
        }
    }

    // ceil(1500/512) chunks, plus one retransmit.
    assert_eq!(chunk_frames, 4);
    assert_eq!(received.len(), 3 * 512);
    assert_eq!(&received[..1500], &image[..]);
    assert!(received[1500..].iter().all(|&b| b == 0));

    let reply = api.await.unwrap().unwrap();
    assert_eq!(reply, ApiReply::FlashDone);

    let statuses = harness.publisher.recorded_named("spark/flash/status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].data.as_deref(), Some(&b"success"[..]));
}

#[tokio::test]
async fn exhausted_crc_retries_abort_the_flash() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(2).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.flash(&id, firmware(600)).await });

    let begin = device.read_message().await.unwrap();
    device.reply(&begin, CoapCode::CHANGED, &[]).await.unwrap();

    // Initial send plus three retries, all acked with a wrong CRC.
    for _ in 0..4 {
        let chunk = device.read_message().await.unwrap();
        assert_eq!(MessageKind::classify_request(&chunk), MessageKind::Chunk);
        device.reply_chunk_received(&chunk, 0).await.unwrap();
    }

    // The gateway calls the transfer off.
    let abort = device.read_message().await.unwrap();
    assert_eq!(abort.code, CoapCode::BAD_REQUEST);

    let err = api.await.unwrap().unwrap_err();
    match err {
        GatewayError::Flash(FlashError::CrcExhausted { index, retries }) => {
            assert_eq!(index, 0);
            assert_eq!(retries, 3);
        }
        other => panic!("expected CrcExhausted, got {other}"),
    }
    let statuses = harness.publisher.recorded_named("spark/flash/status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].data.as_deref(), Some(&b"failed"[..]));
}

#[tokio::test]
async fn flasher_ownership_locks_out_other_commands_but_not_ping() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(3).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.flash(&id, firmware(100)).await });
    let begin = device.read_message().await.unwrap();
    assert_eq!(MessageKind::classify_request(&begin), MessageKind::UpdateBegin);

    // Locked: commands are rejected synchronously, nothing hits the wire.
    let err = harness.state.describe(&id).await.unwrap_err();
    assert!(matches!(err, GatewayError::Ownership(_)), "got {err}");
    let status = harness.state.ping(&id).await.unwrap();
    assert!(status.online);

    // Resume the transfer: the very next frame is the chunk, proving no
    // describe leaked out while locked.
    device.reply(&begin, CoapCode::CHANGED, &[]).await.unwrap();
    let chunk = device.read_message().await.unwrap();
    assert_eq!(MessageKind::classify_request(&chunk), MessageKind::Chunk);
    let crc = cl_crypto::crc32(&chunk.payload);
    device.reply_chunk_received(&chunk, crc).await.unwrap();

    let done = device.read_message().await.unwrap();
    assert_eq!(MessageKind::classify_request(&done), MessageKind::UpdateDone);
    assert_eq!(api.await.unwrap().unwrap(), ApiReply::FlashDone);

    // Ownership released: commands flow again.
    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.describe(&id).await });
    let describe = device.read_message().await.unwrap();
    assert_eq!(
        MessageKind::classify_request(&describe),
        MessageKind::Describe
    );
    device
        .reply(&describe, CoapCode::CONTENT, br#"{"v":{},"f":[]}"#)
        .await
        .unwrap();
    assert!(api.await.unwrap().is_ok());
}

#[tokio::test]
async fn oversize_and_empty_images_are_rejected_before_the_wire() {
    let harness = Harness::new();
    let (_device, id) = harness.connect_ready(4).await;

    let err = harness.state.flash(&id, Vec::new()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Flash(FlashError::Empty)));

    let err = harness
        .state
        .flash(&id, firmware(108_001))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Flash(FlashError::Oversize { .. })
    ));
}

#[tokio::test]
async fn flash_known_resolves_the_firmware_store() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(5).await;

    // Unknown app: non-fatal failure, reported as an update-failed event.
    let err = harness.state.flash_known(&id, "missing").await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Flash(FlashError::UnknownApp(_))
    ));
    let statuses = harness.publisher.recorded_named("spark/flash/status");
    assert_eq!(statuses[0].data.as_deref(), Some(&b"failed"[..]));

    // Known app flashes like a direct image.
    harness.firmware.insert("blink", "dev", firmware(300));
    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.flash_known(&id, "blink").await });

    let begin = device.read_message().await.unwrap();
    device.reply(&begin, CoapCode::CHANGED, &[]).await.unwrap();
    let chunk = device.read_message().await.unwrap();
    let crc = cl_crypto::crc32(&chunk.payload);
    device.reply_chunk_received(&chunk, crc).await.unwrap();
    let done = device.read_message().await.unwrap();
    assert_eq!(MessageKind::classify_request(&done), MessageKind::UpdateDone);
    assert_eq!(api.await.unwrap().unwrap(), ApiReply::FlashDone);
}
