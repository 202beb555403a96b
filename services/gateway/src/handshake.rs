//! The four-step handshake producing the session key.
//!
//! All four messages are fixed length and run over the raw socket before
//! the cipher session starts:
//!
//! 1. Device → Server, in the clear: 40-byte nonce, then the 12-byte
//!    device id. The id selects the device public key.
//! 2. Server → Device: RSA-OAEP(device_pub, seed ‖ hmac_sha1(seed,
//!    device_pub_der)) where seed is a fresh 40-byte session seed.
//! 3. Device → Server: RSA-OAEP(server_pub, session key). The device
//!    picks the final 40-byte session key.
//! 4. The first ciphertext frame is the device Hello; that exchange
//!    belongs to the session and is handled there.
//!
//! Any decryption failure, length mismatch, or unknown device id fails the
//! handshake and the socket is closed.

use crate::collaborators::DeviceKeystore;
use crate::error::GatewayError;
use cl_crypto::{NONCE_SIZE, RSA_BLOCK_SIZE, RsaPrivateKey, SessionKey};
use cl_protocol::{DEVICE_ID_SIZE, DeviceId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Run the server side of the handshake.
///
/// Returns the authenticated device id and the device-chosen session key.
pub async fn perform<R, W>(
    read: &mut R,
    write: &mut W,
    keystore: &dyn DeviceKeystore,
    server_key: &RsaPrivateKey,
) -> Result<(DeviceId, SessionKey), GatewayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Step 1: nonce + device id in the clear.
    let mut nonce = [0u8; NONCE_SIZE];
    read.read_exact(&mut nonce).await?;
    let mut id_bytes = [0u8; DEVICE_ID_SIZE];
    read.read_exact(&mut id_bytes).await?;
    let device_id = DeviceId(id_bytes);

    let device_key = keystore.public_key(&device_id).ok_or_else(|| {
        GatewayError::Handshake(format!("unknown device {device_id}"))
    })?;
    debug!(device_id = %device_id, "handshake: device key found");

    // Step 2: only the holder of the device's private key can read the
    // seed, and the HMAC binds it to their key.
    let seed = cl_crypto::random_nonce();
    let device_key_der = cl_crypto::public_key_der(&device_key)?;
    let digest = cl_crypto::hmac_sha1(&seed, &device_key_der);
    let mut challenge = Vec::with_capacity(seed.len() + digest.len());
    challenge.extend_from_slice(&seed);
    challenge.extend_from_slice(&digest);
    let block = cl_crypto::encrypt_oaep(&device_key, &challenge)?;
    write.write_all(&block).await?;
    write.flush().await?;

    // Step 3: the device answers with the session key under our public key.
    let mut key_block = [0u8; RSA_BLOCK_SIZE];
    read.read_exact(&mut key_block).await?;
    let plain = cl_crypto::decrypt_oaep(server_key, &key_block)
        .map_err(|e| GatewayError::Handshake(format!("session key block: {e}")))?;
    let session_key = SessionKey::from_bytes(&plain)
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;

    debug!(device_id = %device_id, "handshake complete");
    Ok((device_id, session_key))
}
