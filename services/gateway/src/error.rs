use crate::flasher::FlashError;

/// The gateway error taxonomy.
///
/// `Io`, `Crypto`, `Handshake`, `Frame`, and `Protocol` are fatal to a
/// session and trigger disconnect. `Introspection` and `Flash` are reported
/// to the API caller and leave the session up. `Ownership` is returned
/// synchronously while the flasher holds the session.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto: {0}")]
    Crypto(#[from] cl_crypto::CryptoError),
    #[error("Handshake: {0}")]
    Handshake(String),
    #[error("bad frame: {0}")]
    Frame(#[from] cl_protocol::CodecError),
    #[error("Protocol: {0}")]
    Protocol(String),
    #[error("Introspection: {0}")]
    Introspection(String),
    #[error("Flash: {0}")]
    Flash(#[from] FlashError),
    #[error("exclusive lock held: {0}")]
    Ownership(&'static str),
    #[error("request timed out")]
    Timeout,
    #[error("session disconnected")]
    Disconnected,
}

impl GatewayError {
    /// Errors that tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Io(_)
                | GatewayError::Crypto(_)
                | GatewayError::Handshake(_)
                | GatewayError::Frame(_)
                | GatewayError::Protocol(_)
        )
    }
}
