//! External collaborators the session talks to.
//!
//! The session never reaches for globals; each collaborator is a trait
//! object injected at construction. The implementations here are the ones
//! the binary wires up; tests substitute recording doubles.

use cl_protocol::DeviceId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

/// Well-known attribute keys.
pub mod attr {
    pub const CLAIM_CODE: &str = "claimCode";
    pub const SYSTEM_VERSION: &str = "spark_system_version";
    pub const NAME: &str = "name";
    pub const PRODUCT_ID: &str = "productId";
    pub const FIRMWARE_VERSION: &str = "firmwareVersion";
    pub const USER_ID: &str = "userId";
}

/// Per-device key/value attribute storage.
pub trait AttributeStore: Send + Sync {
    fn get_core_attributes(&self, device_id: &DeviceId) -> HashMap<String, String>;
    fn set_core_attribute(&self, device_id: &DeviceId, key: &str, value: &str);
}

/// The upstream backend API.
pub trait ApiClient: Send + Sync {
    fn link_device(&self, device_id: &DeviceId, claim_code: &str, product_id: u16);
    fn safe_mode(&self, device_id: &DeviceId, payload: &[u8]);
}

/// Read-only firmware image lookup.
pub trait FirmwareStore: Send + Sync {
    /// Bytes of `known_firmware/<app>_<env>.bin`, or `None` when absent.
    fn lookup(&self, app: &str, environment: &str) -> Option<Vec<u8>>;
}

/// Device public key lookup for the handshake.
pub trait DeviceKeystore: Send + Sync {
    fn public_key(&self, device_id: &DeviceId) -> Option<cl_crypto::RsaPublicKey>;
}

// ---------------------------------------------------------------------------
// In-memory attribute store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAttributeStore {
    attributes: RwLock<HashMap<DeviceId, HashMap<String, String>>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn get_core_attributes(&self, device_id: &DeviceId) -> HashMap<String, String> {
        self.attributes
            .read()
            .expect("attribute store lock")
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_core_attribute(&self, device_id: &DeviceId, key: &str, value: &str) {
        self.attributes
            .write()
            .expect("attribute store lock")
            .entry(*device_id)
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Logging API client
// ---------------------------------------------------------------------------

/// Stand-in backend client that records calls to the log. The production
/// deployment swaps in an HTTP-backed implementation.
#[derive(Default)]
pub struct LoggingApiClient;

impl ApiClient for LoggingApiClient {
    fn link_device(&self, device_id: &DeviceId, claim_code: &str, product_id: u16) {
        info!(device_id = %device_id, claim_code, product_id, "linking device to account");
    }

    fn safe_mode(&self, device_id: &DeviceId, payload: &[u8]) {
        info!(device_id = %device_id, bytes = payload.len(), "device entered safe mode");
    }
}

// ---------------------------------------------------------------------------
// Directory-backed firmware store
// ---------------------------------------------------------------------------

pub struct DirFirmwareStore {
    root: PathBuf,
}

impl DirFirmwareStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirFirmwareStore { root: root.into() }
    }
}

impl FirmwareStore for DirFirmwareStore {
    fn lookup(&self, app: &str, environment: &str) -> Option<Vec<u8>> {
        // Reject path separators smuggled into the app name.
        if app.contains(['/', '\\', '.']) || environment.contains(['/', '\\', '.']) {
            warn!(app, environment, "rejecting firmware lookup with path characters");
            return None;
        }
        let path = self
            .root
            .join("known_firmware")
            .join(format!("{app}_{environment}.bin"));
        std::fs::read(&path).ok()
    }
}

// ---------------------------------------------------------------------------
// Device keystores
// ---------------------------------------------------------------------------

/// Directory of `<device-id-hex>.pub.pem` files.
pub struct DirDeviceKeystore {
    dir: PathBuf,
}

impl DirDeviceKeystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirDeviceKeystore { dir: dir.into() }
    }
}

impl DeviceKeystore for DirDeviceKeystore {
    fn public_key(&self, device_id: &DeviceId) -> Option<cl_crypto::RsaPublicKey> {
        let path = self.dir.join(format!("{device_id}.pub.pem"));
        let pem = std::fs::read_to_string(&path).ok()?;
        match cl_crypto::public_key_from_pem(&pem) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "unreadable device key file");
                None
            }
        }
    }
}

/// In-memory keystore for tests and single-tenant deployments.
#[derive(Default)]
pub struct MemoryDeviceKeystore {
    keys: RwLock<HashMap<DeviceId, cl_crypto::RsaPublicKey>>,
}

impl MemoryDeviceKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: DeviceId, key: cl_crypto::RsaPublicKey) {
        self.keys
            .write()
            .expect("keystore lock")
            .insert(device_id, key);
    }
}

impl DeviceKeystore for MemoryDeviceKeystore {
    fn public_key(&self, device_id: &DeviceId) -> Option<cl_crypto::RsaPublicKey> {
        self.keys
            .read()
            .expect("keystore lock")
            .get(device_id)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
