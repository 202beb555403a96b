//! The cipher session: length-prefixed ciphertext framing over the raw
//! socket.
//!
//! Once the handshake has produced a session key, each direction is an
//! independent CBC chain. Inbound: a 2-byte big-endian length read in the
//! clear, then exactly that many ciphertext bytes, decrypted as one
//! message. Outbound: one message encrypted, length-prefixed, and written
//! as a single unit.

use crate::error::GatewayError;
use cl_crypto::{MessageCipher, SessionKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Decrypting end of the session, wrapping the socket read half.
pub struct FrameReader<R> {
    inner: R,
    cipher: MessageCipher,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, session_key: &SessionKey) -> Self {
        FrameReader {
            inner,
            cipher: MessageCipher::new(session_key),
        }
    }

    /// Read and decrypt one frame.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, GatewayError> {
        let mut len_buf = [0u8; 2];
        self.inner.read_exact(&mut len_buf).await?;
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            return Err(GatewayError::Protocol(
                "zero-length ciphertext frame".to_owned(),
            ));
        }
        let mut cipher_buf = vec![0u8; len];
        self.inner.read_exact(&mut cipher_buf).await?;
        Ok(self.cipher.decrypt(&cipher_buf)?)
    }
}

/// Encrypting end of the session, wrapping the socket write half.
pub struct FrameWriter<W> {
    inner: W,
    cipher: MessageCipher,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, session_key: &SessionKey) -> Self {
        FrameWriter {
            inner,
            cipher: MessageCipher::new(session_key),
        }
    }

    /// Encrypt and write one frame as a single unit.
    pub async fn write_frame(&mut self, plain: &[u8]) -> Result<(), GatewayError> {
        let cipher = self.cipher.encrypt(plain);
        let mut buf = Vec::with_capacity(2 + cipher.len());
        buf.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
        buf.extend_from_slice(&cipher);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Best-effort stream shutdown at disconnect.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
