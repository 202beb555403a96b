//! Shared in-process harness for the gateway integration suites.
//!
//! Builds a `GatewayState` with recording collaborator doubles, runs
//! `handle_connection` over one end of a `tokio::io::duplex` pair, and
//! hands the other end to a `MockDevice`.

#![allow(dead_code)]

use cl_crypto::RsaPublicKey;
use cl_protocol::DeviceId;
use cl_test_utils::{MockDevice, device_id, test_keypair};
use gateway::collaborators::{
    ApiClient, FirmwareStore, MemoryAttributeStore, MemoryDeviceKeystore,
};
use gateway::config::GatewayConfig;
use gateway::publisher::{
    EventRecord, LocalPublisher, PublishOutcome, Publisher, Subscription,
};
use gateway::state::GatewayState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Recording doubles
// ---------------------------------------------------------------------------

/// Publisher that records every accepted event and can simulate the bus
/// shedding load.
#[derive(Default)]
pub struct RecordingPublisher {
    inner: LocalPublisher,
    pub events: Mutex<Vec<EventRecord>>,
    rate_limited: AtomicBool,
}

impl RecordingPublisher {
    pub fn set_rate_limited(&self, limited: bool) {
        self.rate_limited.store(limited, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<EventRecord> {
        self.events.lock().unwrap().clone()
    }

    pub fn recorded_named(&self, name: &str) -> Vec<EventRecord> {
        self.recorded()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: &EventRecord, user_id: &str) -> PublishOutcome {
        if self.rate_limited.load(Ordering::SeqCst) {
            return PublishOutcome::RateLimited;
        }
        self.events.lock().unwrap().push(event.clone());
        self.inner.publish(event, user_id)
    }

    fn subscribe(&self, subscription: Subscription) {
        self.inner.subscribe(subscription);
    }

    fn unsubscribe_all(&self, subscriber: &str) {
        self.inner.unsubscribe_all(subscriber);
    }
}

/// Backend API double recording link/safe-mode calls.
#[derive(Default)]
pub struct RecordingApi {
    pub linked: Mutex<Vec<(DeviceId, String, u16)>>,
    pub safe_modes: Mutex<Vec<(DeviceId, Vec<u8>)>>,
}

impl ApiClient for RecordingApi {
    fn link_device(&self, device_id: &DeviceId, claim_code: &str, product_id: u16) {
        self.linked
            .lock()
            .unwrap()
            .push((*device_id, claim_code.to_owned(), product_id));
    }

    fn safe_mode(&self, device_id: &DeviceId, payload: &[u8]) {
        self.safe_modes
            .lock()
            .unwrap()
            .push((*device_id, payload.to_vec()));
    }
}

/// Firmware store backed by a map keyed `<app>_<env>`.
#[derive(Default)]
pub struct MapFirmwareStore {
    pub images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapFirmwareStore {
    pub fn insert(&self, app: &str, environment: &str, bytes: Vec<u8>) {
        self.images
            .lock()
            .unwrap()
            .insert(format!("{app}_{environment}"), bytes);
    }
}

impl FirmwareStore for MapFirmwareStore {
    fn lookup(&self, app: &str, environment: &str) -> Option<Vec<u8>> {
        self.images
            .lock()
            .unwrap()
            .get(&format!("{app}_{environment}"))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub state: Arc<GatewayState>,
    pub publisher: Arc<RecordingPublisher>,
    pub api: Arc<RecordingApi>,
    pub attributes: Arc<MemoryAttributeStore>,
    pub firmware: Arc<MapFirmwareStore>,
    pub keystore: Arc<MemoryDeviceKeystore>,
    pub server_public: RsaPublicKey,
}

impl Harness {
    pub fn new() -> Harness {
        let (server_private, server_public) = test_keypair();
        let publisher = Arc::new(RecordingPublisher::default());
        let api = Arc::new(RecordingApi::default());
        let attributes = Arc::new(MemoryAttributeStore::new());
        let firmware = Arc::new(MapFirmwareStore::default());
        let keystore = Arc::new(MemoryDeviceKeystore::new());
        let state = GatewayState::new(
            GatewayConfig::for_tests(),
            server_private,
            publisher.clone(),
            attributes.clone(),
            api.clone(),
            firmware.clone(),
            keystore.clone(),
        );
        Harness {
            state,
            publisher,
            api,
            attributes,
            firmware,
            keystore,
            server_public,
        }
    }

    /// Register keys for device `fill`, run the handshake, and return the
    /// connected mock. The Hello exchange is left to the caller.
    pub async fn connect_device(&self, fill: u8) -> (MockDevice, DeviceId) {
        let (device_private, device_public) = test_keypair();
        let id = device_id(fill);
        self.keystore.insert(id, device_public);

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let state = self.state.clone();
        tokio::spawn(gateway::handle_connection(server_io, state));

        let device = MockDevice::connect(client_io, id, &device_private, &self.server_public)
            .await
            .expect("mock device handshake");
        (device, id)
    }

    /// Handshake plus the standard test Hello `(product 6, fw 42,
    /// platform 10)`; waits until the session is indexed.
    pub async fn connect_ready(&self, fill: u8) -> (MockDevice, DeviceId) {
        let (mut device, id) = self.connect_device(fill).await;
        device.send_hello(6, 42, 10).await.expect("hello exchange");
        wait_until(|| {
            let state = self.state.clone();
            async move { state.session(&id).await.is_some() }
        })
        .await;
        (device, id)
    }
}

/// Poll an async predicate for up to two seconds.
pub async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
