// cl-crypto: Cryptographic primitives for the corelink device gateway.
//
// Wraps the RustCrypto stack behind the small surface the wire protocol
// needs: RSA-1024 OAEP blocks for the handshake, per-direction AES-128-CBC
// message ciphers, HMAC-SHA1 digests, CRC32 chunk receipts, and secure
// randoms.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, Pkcs1v15Sign};
use sha1::{Digest, Sha1};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// RSA-1024 ciphertext/signature block length.
pub const RSA_BLOCK_SIZE: usize = 128;
/// Handshake nonce length.
pub const NONCE_SIZE: usize = 40;
/// AES-128-CBC block length.
pub const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("RSA: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("ciphertext is not a whole number of cipher blocks ({len} bytes)")]
    Truncated { len: usize },
    #[error("bad CBC padding")]
    BadPadding,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("session key must be {expected} bytes, got {len}")]
    InvalidSessionKey { expected: usize, len: usize },
}

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// The 40-byte session key exchanged during the handshake.
///
/// Layout: AES-128 key (16) | initial IV (16) | salt (8). Both directions
/// start from the same IV and diverge as each side chains through its own
/// ciphertext.
#[derive(Clone)]
pub struct SessionKey([u8; SessionKey::SIZE]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

impl SessionKey {
    pub const SIZE: usize = 40;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SIZE {
            return Err(CryptoError::InvalidSessionKey {
                expected: Self::SIZE,
                len: bytes.len(),
            });
        }
        let mut key = [0u8; Self::SIZE];
        key.copy_from_slice(bytes);
        Ok(SessionKey(key))
    }

    /// Draw a fresh random session key.
    pub fn generate() -> Self {
        let mut key = [0u8; Self::SIZE];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    pub fn aes_key(&self) -> [u8; AES_BLOCK_SIZE] {
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&self.0[0..16]);
        out
    }

    pub fn iv(&self) -> [u8; AES_BLOCK_SIZE] {
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&self.0[16..32]);
        out
    }

    pub fn salt(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[32..40]);
        out
    }
}

// ---------------------------------------------------------------------------
// RSA-1024 OAEP (SHA-1) + PKCS#1 v1.5 signatures
// ---------------------------------------------------------------------------

/// Encrypt one OAEP block with a device public key.
pub fn encrypt_oaep(key: &RsaPublicKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = OsRng;
    Ok(key.encrypt(&mut rng, Oaep::new::<Sha1>(), plain)?)
}

/// Decrypt one OAEP block with the server private key.
pub fn decrypt_oaep(key: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.decrypt(Oaep::new::<Sha1>(), cipher)?)
}

/// Sign the SHA-1 digest of `data` with the server private key.
pub fn sign_sha1(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha1::digest(data);
    Ok(key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)?)
}

/// Verify a [`sign_sha1`] signature. Used by the device side in tests.
pub fn verify_sha1(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let digest = Sha1::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
        .is_ok()
}

/// Load a private key from PEM, accepting PKCS#8 or PKCS#1 encodings.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Load a public key from PEM, accepting SPKI or PKCS#1 encodings.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// PKCS#1 DER bytes of a public key, the form digested during the handshake.
pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    let doc = key
        .to_pkcs1_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(doc.as_bytes().to_vec())
}

// ---------------------------------------------------------------------------
// AES-128-CBC message cipher
// ---------------------------------------------------------------------------

/// One direction of the post-handshake stream cipher.
///
/// Every wire frame is one padded CBC message. The IV chains: after a
/// message is processed the last ciphertext block becomes the IV for the
/// next message, so the two ends stay in lockstep per direction.
pub struct MessageCipher {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl MessageCipher {
    pub fn new(session: &SessionKey) -> Self {
        MessageCipher {
            key: session.aes_key(),
            iv: session.iv(),
        }
    }

    /// Encrypt one message, advancing the IV chain.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain);
        self.chain(&cipher);
        cipher
    }

    /// Decrypt one message, advancing the IV chain.
    ///
    /// The chain advances on well-formed ciphertext even when unpadding
    /// fails; a padding failure is fatal to the session anyway.
    pub fn decrypt(&mut self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.is_empty() || cipher.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::Truncated { len: cipher.len() });
        }
        let decryptor = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        self.chain(cipher);
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| CryptoError::BadPadding)
    }

    fn chain(&mut self, cipher: &[u8]) {
        let tail = &cipher[cipher.len() - AES_BLOCK_SIZE..];
        self.iv.copy_from_slice(tail);
    }
}

// ---------------------------------------------------------------------------
// Digests and randoms
// ---------------------------------------------------------------------------

/// HMAC-SHA1 digest, as used for handshake seed authentication.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// CRC32 (IEEE) of a firmware chunk.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 40 bytes of secure randomness for handshake nonces.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Secure random u16, used to seed message counters.
pub fn random_u16() -> u16 {
    let mut buf = [0u8; 2];
    OsRng.fill_bytes(&mut buf);
    u16::from_le_bytes(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
