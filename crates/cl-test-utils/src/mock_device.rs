//! A scripted device for exercising the gateway end to end.
//!
//! `MockDevice` drives the device side of the wire protocol over one end
//! of a `tokio::io::duplex` pair: the clear-text handshake, the Hello
//! exchange, and encrypted CoAP frames in both directions. Tests call the
//! helpers to publish events, answer variable/function requests, and walk
//! OTA transfers chunk by chunk.

use cl_crypto::{MessageCipher, NONCE_SIZE, RSA_BLOCK_SIZE, RsaPrivateKey, RsaPublicKey, SessionKey};
use cl_protocol::{CoapCode, CoapType, DeviceId, HelloPayload, Message, MessageKind, kinds};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

pub struct MockDevice {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    encrypt: MessageCipher,
    decrypt: MessageCipher,
    /// Message-id counter for device-originated frames; the gateway
    /// expects each to advance by one from the Hello id.
    counter: u16,
    token: u8,
}

impl MockDevice {
    /// Run the device side of the handshake over `io`.
    pub async fn connect(
        io: DuplexStream,
        device_id: DeviceId,
        device_key: &RsaPrivateKey,
        server_public: &RsaPublicKey,
    ) -> io::Result<MockDevice> {
        let (mut read, mut write) = tokio::io::split(io);

        // Step 1: nonce + device id in the clear.
        write.write_all(&cl_crypto::random_nonce()).await?;
        write.write_all(device_id.as_bytes()).await?;

        // Step 2: the server's seed challenge, sealed to our key.
        let mut challenge = [0u8; RSA_BLOCK_SIZE];
        read.read_exact(&mut challenge).await?;
        let plain = cl_crypto::decrypt_oaep(device_key, &challenge)
            .map_err(|e| io::Error::other(format!("challenge: {e}")))?;
        assert_eq!(plain.len(), NONCE_SIZE + 20, "seed + hmac");
        let (seed, digest) = plain.split_at(NONCE_SIZE);
        let our_der = cl_crypto::public_key_der(&RsaPublicKey::from(device_key))
            .map_err(|e| io::Error::other(e.to_string()))?;
        assert_eq!(
            digest,
            cl_crypto::hmac_sha1(seed, &our_der),
            "server seed digest must authenticate our key"
        );

        // Step 3: choose the session key, sealed to the server's key.
        let session_key = SessionKey::generate();
        let block = cl_crypto::encrypt_oaep(server_public, session_key.as_bytes())
            .map_err(|e| io::Error::other(e.to_string()))?;
        write.write_all(&block).await?;

        Ok(MockDevice {
            read,
            write,
            encrypt: MessageCipher::new(&session_key),
            decrypt: MessageCipher::new(&session_key),
            counter: 0x0100,
            token: 0x40,
        })
    }

    /// Step 4: Hello with product/firmware/platform ids; waits for the
    /// server's Hello acknowledgement.
    pub async fn send_hello(
        &mut self,
        product_id: u16,
        firmware_version: u16,
        platform_id: u16,
    ) -> io::Result<Message> {
        let id = self.next_id();
        let mut hello = Message::empty(CoapType::Confirmable, CoapCode::POST, id);
        hello.uri_path = "h".to_owned();
        hello.payload = HelloPayload {
            product_id: Some(product_id),
            firmware_version: Some(firmware_version),
            platform_id: Some(platform_id),
        }
        .encode();
        self.send_message(&hello).await?;

        let ack = self.read_message().await?;
        assert!(ack.is_ack(), "server hello should acknowledge ours");
        assert_eq!(ack.id, id, "server hello echoes our id");
        Ok(ack)
    }

    // -----------------------------------------------------------------------
    // Raw frame plumbing
    // -----------------------------------------------------------------------

    pub async fn send_message(&mut self, message: &Message) -> io::Result<()> {
        let cipher = self.encrypt.encrypt(&message.encode());
        let mut buf = Vec::with_capacity(2 + cipher.len());
        buf.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
        buf.extend_from_slice(&cipher);
        self.write.write_all(&buf).await
    }

    pub async fn read_message(&mut self) -> io::Result<Message> {
        let mut len_buf = [0u8; 2];
        self.read.read_exact(&mut len_buf).await?;
        let mut cipher = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        self.read.read_exact(&mut cipher).await?;
        let plain = self
            .decrypt
            .decrypt(&cipher)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Message::decode(&plain).map_err(|e| io::Error::other(e.to_string()))
    }

    /// Read frames until one classifies as `kind` (skipping, e.g.,
    /// unsolicited event deliveries in between).
    pub async fn read_until_kind(&mut self, kind: MessageKind) -> io::Result<Message> {
        loop {
            let message = self.read_message().await?;
            if !message.is_ack() && MessageKind::classify_request(&message) == kind {
                return Ok(message);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Device-originated traffic
    // -----------------------------------------------------------------------

    /// Publish an event frame; returns the message id used.
    pub async fn send_event(
        &mut self,
        is_public: bool,
        name: &str,
        payload: &[u8],
        confirmable: bool,
    ) -> io::Result<u16> {
        let id = self.next_id();
        let msg_type = if confirmable {
            CoapType::Confirmable
        } else {
            CoapType::NonConfirmable
        };
        let mut message = Message::empty(msg_type, CoapCode::POST, id);
        let prefix = if is_public { "E" } else { "e" };
        message.uri_path = format!("{prefix}/{name}");
        message.payload = payload.to_vec();
        self.send_message(&message).await?;
        Ok(id)
    }

    /// Subscribe to an event-name prefix; returns the message id used.
    pub async fn send_subscribe(
        &mut self,
        name: &str,
        user_scoped: bool,
        device_filter: Option<DeviceId>,
    ) -> io::Result<u16> {
        let id = self.next_id();
        let token = self.next_token();
        let mut message = Message::empty(CoapType::Confirmable, CoapCode::GET, id);
        message.uri_path = format!("e/{name}");
        message.token = vec![token];
        if user_scoped {
            message.uri_query = Some("u".to_owned());
        }
        if let Some(filter) = device_filter {
            message.payload = filter.as_bytes().to_vec();
        }
        self.send_message(&message).await?;
        Ok(id)
    }

    /// Ask the gateway for the time; returns the reply frame.
    pub async fn send_get_time(&mut self) -> io::Result<Message> {
        let id = self.next_id();
        let token = self.next_token();
        let mut message = Message::empty(CoapType::Confirmable, CoapCode::GET, id);
        message.uri_path = "t".to_owned();
        message.token = vec![token];
        self.send_message(&message).await?;
        self.read_message().await
    }

    /// Empty confirmable keepalive probe; waits for the matching ack.
    ///
    /// Keepalive probes sit outside the counter sequence (the gateway
    /// answers them without a counter check), so the id does not advance.
    pub async fn send_ping(&mut self) -> io::Result<()> {
        let id = self.counter;
        self.send_message(&Message::ping(id)).await?;
        let ack = self.read_message().await?;
        assert!(ack.is_ack() && ack.id == id, "ping ack echoes the id");
        Ok(())
    }

    /// Answer a gateway request with a piggybacked reply.
    pub async fn reply(
        &mut self,
        request: &Message,
        code: CoapCode,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut ack = Message::empty(CoapType::Ack, code, request.id);
        ack.token = request.token.clone();
        ack.payload = payload.to_vec();
        self.send_message(&ack).await
    }

    /// Answer a chunk with a receipt carrying this CRC32 value.
    pub async fn reply_chunk_received(&mut self, chunk: &Message, crc: u32) -> io::Result<()> {
        self.reply(chunk, CoapCode::CHANGED, &crc.to_le_bytes()).await
    }

    /// Build a well-formed server reply frame for a request this device
    /// received (used by tests that assert on the wire shape).
    pub fn response_frame(kind: MessageKind, request: &Message) -> Message {
        kinds::response(kind, request.id, request.token_byte())
    }

    fn next_id(&mut self) -> u16 {
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }

    fn next_token(&mut self) -> u8 {
        self.token = self.token.wrapping_add(1);
        self.token
    }
}
