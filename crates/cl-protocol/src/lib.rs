// cl-protocol: Wire protocol vocabulary for the corelink device gateway.
//
// CoAP 1.0 framing, the message-kind table shared by both ends of the
// device link, little-endian payload typing, and the device introspection
// document. Everything here is pure data transformation; sockets and
// ciphers live in the gateway service.

pub mod coap;
pub mod introspection;
pub mod kinds;
pub mod payload;

pub use coap::{CoapCode, CoapType, CodecError, Message};
pub use introspection::{DeviceFunctionState, FunctionSpec};
pub use kinds::{HelloPayload, KindSpec, MessageKind, TokenReq};
pub use payload::{PayloadValue, VarType};

/// Length of the opaque device identifier carried in the handshake.
pub const DEVICE_ID_SIZE: usize = 12;

/// An opaque 12-byte device identifier, rendered lowercase hex in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; DEVICE_ID_SIZE]);

impl DeviceId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut id = [0u8; DEVICE_ID_SIZE];
        if bytes.len() != DEVICE_ID_SIZE {
            return None;
        }
        id.copy_from_slice(bytes);
        Some(DeviceId(id))
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
