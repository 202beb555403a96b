//! RSA key fixtures for protocol tests.

use cl_crypto::{RsaPrivateKey, RsaPublicKey};
use cl_protocol::DeviceId;
use rand::rngs::OsRng;

/// Generate a fresh RSA-1024 key pair. Slow enough to share per test, fast
/// enough not to need fixtures on disk.
pub fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
    let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("test keygen");
    let public = RsaPublicKey::from(&private);
    (private, public)
}

/// A recognizable device id filled with one byte.
pub fn device_id(fill: u8) -> DeviceId {
    DeviceId([fill; 12])
}
