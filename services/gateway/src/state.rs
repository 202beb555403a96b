//! Shared gateway state: collaborator handles and the session index.

use crate::api::{ApiCommand, ApiReply, PingStatus};
use crate::collaborators::{ApiClient, AttributeStore, DeviceKeystore, FirmwareStore};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use cl_crypto::RsaPrivateKey;
use cl_protocol::{DeviceId, PayloadValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};

/// Index entry for one live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub commands: mpsc::Sender<ApiCommand>,
    pub connected_at: DateTime<Utc>,
    /// Monotonic per-process serial; a reconnect replaces the entry, and
    /// the stale session's teardown must not evict its successor.
    pub serial: u64,
}

pub struct GatewayState {
    pub config: GatewayConfig,
    pub server_key: RsaPrivateKey,
    pub publisher: Arc<dyn Publisher>,
    pub attributes: Arc<dyn AttributeStore>,
    pub api: Arc<dyn ApiClient>,
    pub firmware: Arc<dyn FirmwareStore>,
    pub keystore: Arc<dyn DeviceKeystore>,
    sessions: RwLock<HashMap<DeviceId, SessionHandle>>,
    next_serial: AtomicU64,
    disconnect_tx: broadcast::Sender<DeviceId>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        server_key: RsaPrivateKey,
        publisher: Arc<dyn Publisher>,
        attributes: Arc<dyn AttributeStore>,
        api: Arc<dyn ApiClient>,
        firmware: Arc<dyn FirmwareStore>,
        keystore: Arc<dyn DeviceKeystore>,
    ) -> Arc<Self> {
        let (disconnect_tx, _) = broadcast::channel(256);
        Arc::new(GatewayState {
            config,
            server_key,
            publisher,
            attributes,
            api,
            firmware,
            keystore,
            sessions: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            disconnect_tx,
        })
    }

    /// Index a new session, replacing any previous entry for the device.
    /// Returns the serial the session must present at unregister.
    pub async fn register_session(
        &self,
        device_id: DeviceId,
        commands: mpsc::Sender<ApiCommand>,
    ) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle {
            commands,
            connected_at: Utc::now(),
            serial,
        };
        self.sessions.write().await.insert(device_id, handle);
        serial
    }

    /// Drop a session from the index, unless a reconnect already replaced
    /// it. Returns whether the entry was removed.
    pub async fn unregister_session(&self, device_id: &DeviceId, serial: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(device_id) {
            Some(handle) if handle.serial == serial => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn session(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One `disconnect` signal is broadcast here per session teardown.
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<DeviceId> {
        self.disconnect_tx.subscribe()
    }

    pub(crate) fn signal_disconnect(&self, device_id: DeviceId) {
        let _ = self.disconnect_tx.send(device_id);
    }

    // -----------------------------------------------------------------------
    // Backend command surface
    // -----------------------------------------------------------------------

    async fn command(&self, device_id: &DeviceId, command: ApiCommand) -> Result<(), GatewayError> {
        let handle = self
            .session(device_id)
            .await
            .ok_or(GatewayError::Disconnected)?;
        handle
            .commands
            .send(command)
            .await
            .map_err(|_| GatewayError::Disconnected)
    }

    async fn roundtrip(
        &self,
        device_id: &DeviceId,
        build: impl FnOnce(crate::api::ApiResponder) -> ApiCommand,
    ) -> Result<ApiReply, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.command(device_id, build(tx)).await?;
        rx.await.map_err(|_| GatewayError::Disconnected)?
    }

    pub async fn describe(&self, device_id: &DeviceId) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::Describe { reply })
            .await
    }

    pub async fn get_variable(
        &self,
        device_id: &DeviceId,
        name: &str,
        var_type: Option<&str>,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::GetVar {
            name: name.to_owned(),
            var_type: var_type.map(ToOwned::to_owned),
            reply,
        })
        .await
    }

    pub async fn set_variable(
        &self,
        device_id: &DeviceId,
        name: &str,
        value: PayloadValue,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::SetVar {
            name: name.to_owned(),
            value,
            reply,
        })
        .await
    }

    pub async fn call_function(
        &self,
        device_id: &DeviceId,
        name: &str,
        args: &str,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::CallFn {
            name: name.to_owned(),
            args: args.to_owned(),
            reply,
        })
        .await
    }

    pub async fn flash(
        &self,
        device_id: &DeviceId,
        binary: Vec<u8>,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::Flash { binary, reply })
            .await
    }

    pub async fn flash_known(
        &self,
        device_id: &DeviceId,
        app: &str,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::FlashKnown {
            app: app.to_owned(),
            reply,
        })
        .await
    }

    pub async fn raise_hand(
        &self,
        device_id: &DeviceId,
        signal: bool,
    ) -> Result<ApiReply, GatewayError> {
        self.roundtrip(device_id, |reply| ApiCommand::RaiseHand { signal, reply })
            .await
    }

    pub async fn ping(&self, device_id: &DeviceId) -> Result<PingStatus, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.command(device_id, ApiCommand::Ping { reply: tx })
            .await?;
        rx.await.map_err(|_| GatewayError::Disconnected)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
