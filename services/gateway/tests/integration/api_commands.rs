//! The backend command surface: Describe, GetVar, SetVar, CallFn,
//! RaiseHand, Ping.

mod harness;

use cl_protocol::{CoapCode, PayloadValue};
use gateway::api::ApiReply;
use gateway::error::GatewayError;
use harness::Harness;

const DESCRIBE_DOC: &[u8] =
    br#"{"v":{"temperature":"int32"},"f":[{"name":"led","args":["string","string"]}]}"#;

#[tokio::test]
async fn get_variable_decodes_per_declared_type() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(1).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.get_variable(&id, "temperature", Some("int32")).await });

    let request = device.read_message().await.unwrap();
    assert_eq!(request.code, CoapCode::GET);
    assert_eq!(request.uri_path, "v/temperature");
    assert_eq!(request.token.len(), 1);
    device
        .reply(&request, CoapCode::CONTENT, &[0x2A, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    match api.await.unwrap().unwrap() {
        ApiReply::VarReturn { name, value, raw } => {
            assert_eq!(name, "temperature");
            assert_eq!(value, PayloadValue::Int32(42));
            assert_eq!(raw, vec![0x2A, 0, 0, 0]);
        }
        other => panic!("expected VarReturn, got {other:?}"),
    }
}

#[tokio::test]
async fn describe_caches_introspection_then_function_call_encodes_args() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(2).await;

    // Describe round-trip populates the function state.
    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.describe(&id).await });
    let request = device.read_message().await.unwrap();
    assert_eq!(request.code, CoapCode::GET);
    assert_eq!(request.uri_path, "d");
    device
        .reply(&request, CoapCode::CONTENT, DESCRIBE_DOC)
        .await
        .unwrap();
    match api.await.unwrap().unwrap() {
        ApiReply::Describe {
            product_id,
            firmware_version,
            state,
        } => {
            assert_eq!(product_id, Some(6));
            assert_eq!(firmware_version, Some(42));
            assert!(state.function("led").is_some());
        }
        other => panic!("expected Describe, got {other:?}"),
    }

    // A second Describe answers from the cache, no wire traffic.
    let cached = harness.state.describe(&id).await.unwrap();
    assert!(matches!(cached, ApiReply::Describe { .. }));

    // CallFn encodes the two string args into the URI query.
    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.call_function(&id, "led", "on,5").await });
    let request = device.read_message().await.unwrap();
    assert_eq!(request.code, CoapCode::POST);
    assert_eq!(request.uri_path, "f/led");
    assert_eq!(request.uri_query.as_deref(), Some("on&5"));
    device
        .reply(&request, CoapCode::CHANGED, &1i32.to_le_bytes())
        .await
        .unwrap();
    match api.await.unwrap().unwrap() {
        ApiReply::FnReturn { name, value } => {
            assert_eq!(name, "led");
            assert_eq!(value, 1);
        }
        other => panic!("expected FnReturn, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_requests_never_share_a_token() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(7).await;

    // Two reads in flight at once; answer neither until both are on the
    // wire.
    let state = harness.state.clone();
    let first = tokio::spawn(async move { state.get_variable(&id, "a", Some("uint8")).await });
    let state = harness.state.clone();
    let second = tokio::spawn(async move { state.get_variable(&id, "b", Some("uint8")).await });

    // Command order across two spawned callers is not fixed; tell the
    // requests apart by path.
    let request_one = device.read_message().await.unwrap();
    let request_two = device.read_message().await.unwrap();
    assert_ne!(
        request_one.token_byte().unwrap(),
        request_two.token_byte().unwrap(),
        "outstanding tokens must be unique"
    );

    // Replies resolve by token, regardless of arrival order.
    for request in [&request_two, &request_one] {
        let value = if request.uri_path == "v/a" { [1] } else { [2] };
        device.reply(request, CoapCode::CONTENT, &value).await.unwrap();
    }

    let by_name = |reply: ApiReply| match reply {
        ApiReply::VarReturn { name, value, .. } => (name, value),
        other => panic!("expected VarReturn, got {other:?}"),
    };
    let (name, value) = by_name(first.await.unwrap().unwrap());
    assert_eq!((name.as_str(), value), ("a", PayloadValue::Uint8(1)));
    let (name, value) = by_name(second.await.unwrap().unwrap());
    assert_eq!((name.as_str(), value), ("b", PayloadValue::Uint8(2)));
}

#[tokio::test]
async fn get_variable_uses_the_cached_type_when_none_is_given() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(8).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.describe(&id).await });
    let request = device.read_message().await.unwrap();
    device
        .reply(&request, CoapCode::CONTENT, DESCRIBE_DOC)
        .await
        .unwrap();
    api.await.unwrap().unwrap();

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.get_variable(&id, "temperature", None).await });
    let request = device.read_message().await.unwrap();
    device
        .reply(&request, CoapCode::CONTENT, &[7, 0, 0, 0])
        .await
        .unwrap();
    match api.await.unwrap().unwrap() {
        ApiReply::VarReturn { value, .. } => assert_eq!(value, PayloadValue::Int32(7)),
        other => panic!("expected VarReturn, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_function_fails_without_wire_traffic() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(3).await;

    // Seed introspection so the failure is about the function, not the cache.
    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.describe(&id).await });
    let request = device.read_message().await.unwrap();
    device
        .reply(&request, CoapCode::CONTENT, DESCRIBE_DOC)
        .await
        .unwrap();
    api.await.unwrap().unwrap();

    let err = harness
        .state
        .call_function(&id, "buzz", "1")
        .await
        .unwrap_err();
    match err {
        GatewayError::Introspection(message) => {
            assert_eq!(message, "Unknown Function: buzz");
        }
        other => panic!("expected Introspection, got {other}"),
    }

    // Wrong arity is rejected the same way.
    let err = harness
        .state
        .call_function(&id, "led", "on")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Introspection(_)));
}

#[tokio::test]
async fn set_variable_reuses_the_variable_request_shape() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(4).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move {
        state
            .set_variable(&id, "color", PayloadValue::String("red".to_owned()))
            .await
    });

    let request = device.read_message().await.unwrap();
    // Same wire shape as a read, with the value as payload.
    assert_eq!(request.code, CoapCode::GET);
    assert_eq!(request.uri_path, "v/color");
    assert_eq!(request.payload, b"red");
    device
        .reply(&request, CoapCode::CONTENT, b"red")
        .await
        .unwrap();

    match api.await.unwrap().unwrap() {
        ApiReply::VarReturn { value, .. } => {
            assert_eq!(value, PayloadValue::String("red".to_owned()));
        }
        other => panic!("expected VarReturn, got {other:?}"),
    }
}

#[tokio::test]
async fn raise_hand_reports_device_acknowledgement() {
    let harness = Harness::new();
    let (mut device, id) = harness.connect_ready(5).await;

    let state = harness.state.clone();
    let api = tokio::spawn(async move { state.raise_hand(&id, true).await });

    let request = device.read_message().await.unwrap();
    assert_eq!(request.code, CoapCode::PUT);
    assert_eq!(request.uri_path, "s/raise");
    assert_eq!(request.uri_query.as_deref(), Some("v=1"));
    device.reply(&request, CoapCode::CHANGED, &[]).await.unwrap();

    match api.await.unwrap().unwrap() {
        ApiReply::RaiseHand { accepted } => assert!(accepted),
        other => panic!("expected RaiseHand, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_reports_liveness_without_touching_the_socket() {
    let harness = Harness::new();
    let (_device, id) = harness.connect_ready(6).await;

    let status = harness.state.ping(&id).await.unwrap();
    assert!(status.online);
    assert!(status.last_heard.is_some());
}
