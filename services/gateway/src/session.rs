//! The per-device session actor.
//!
//! One task per connected device owns everything above the socket: the
//! message counters, the outstanding-token table, routing of inbound
//! frames, the backend command surface, the device event surface, and
//! teardown. External callers (backend commands, publisher deliveries)
//! enqueue into the session's mailboxes; the actor drains them in order,
//! so no state here ever needs a lock.
//!
//! A dedicated pump task reads frames off the decrypting stream and feeds
//! them through a channel, keeping the select loop cancellation-safe.

use crate::api::{ApiCommand, ApiReply, ApiResponder, PingStatus};
use crate::cipher::{FrameReader, FrameWriter};
use crate::collaborators::attr;
use crate::error::GatewayError;
use crate::flasher::{FlashAction, FlashError, Flasher};
use crate::publisher::{DEFAULT_TTL, EventRecord, MAX_EVENT_NAME, PublishOutcome, Subscription};
use crate::state::GatewayState;
use chrono::{DateTime, Utc};
use cl_protocol::{
    DeviceFunctionState, DeviceId, HelloPayload, Message, MessageKind, PayloadValue, VarType, kinds,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// How long a tracked request waits for its reply before the listener is
/// torn down and its token released.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Device events under this prefix are server-internal, never republished.
const INTERNAL_EVENT_PREFIX: &str = "spark/";

// ---------------------------------------------------------------------------
// Pending-listener correlation table
// ---------------------------------------------------------------------------

/// What to do when a tracked request's reply (or deadline) arrives.
enum PendingAction {
    VarReply {
        name: String,
        var_type: VarType,
        reply: ApiResponder,
    },
    FnReply {
        name: String,
        reply: ApiResponder,
    },
    DescribeReply {
        reply: Option<ApiResponder>,
        safe_mode: bool,
    },
    RaiseHandReply {
        reply: ApiResponder,
    },
    /// Feed the reply to the flasher.
    FlashAck,
}

struct PendingListener {
    expect: MessageKind,
    deadline: Instant,
    action: PendingAction,
}

struct FlashJob {
    flasher: Flasher,
    reply: ApiResponder,
}

// ---------------------------------------------------------------------------
// Session entry point
// ---------------------------------------------------------------------------

/// Run one device session to completion. Returns after disconnect.
#[allow(clippy::too_many_arguments)]
pub async fn run_session<R, W>(
    state: Arc<GatewayState>,
    device_id: DeviceId,
    serial: u64,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    commands: mpsc::Receiver<ApiCommand>,
    events_tx: mpsc::Sender<EventRecord>,
    events_rx: mpsc::Receiver<EventRecord>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (frame_tx, frame_rx) = mpsc::channel(16);
    let pump = tokio::spawn(pump_frames(reader, frame_tx));

    let user_id = state
        .attributes
        .get_core_attributes(&device_id)
        .get(attr::USER_ID)
        .cloned()
        .unwrap_or_default();
    let counter_max = state.config.protocol.message_counter_max;

    let session = DeviceSession {
        device_id,
        serial,
        user_id,
        product_id: None,
        firmware_version: None,
        platform_id: None,
        send_counter: (u32::from(cl_crypto::random_u16()) % counter_max) as u16,
        recv_counter: 0,
        counter_max,
        token: 0,
        pending: HashMap::new(),
        function_state: None,
        flash: None,
        writer,
        frame_rx,
        pump: Some(pump),
        commands,
        events_tx,
        events_rx,
        connected_at: Utc::now(),
        last_heard: Instant::now(),
        last_heard_at: Utc::now(),
        disconnected: false,
        state,
    };
    session.run().await;
}

/// Read frames off the cipher stream into the session's channel.
async fn pump_frames<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    tx: mpsc::Sender<Result<Vec<u8>, GatewayError>>,
) {
    loop {
        match reader.read_frame().await {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The actor
// ---------------------------------------------------------------------------

struct DeviceSession<W> {
    state: Arc<GatewayState>,
    device_id: DeviceId,
    serial: u64,
    /// Externally injected account binding; empty when unclaimed.
    user_id: String,
    product_id: Option<u16>,
    firmware_version: Option<u16>,
    platform_id: Option<u16>,
    send_counter: u16,
    recv_counter: u16,
    counter_max: u32,
    token: u8,
    pending: HashMap<u8, PendingListener>,
    function_state: Option<DeviceFunctionState>,
    /// Present while the flasher owns the session exclusively.
    flash: Option<FlashJob>,
    writer: FrameWriter<W>,
    frame_rx: mpsc::Receiver<Result<Vec<u8>, GatewayError>>,
    pump: Option<JoinHandle<()>>,
    commands: mpsc::Receiver<ApiCommand>,
    events_tx: mpsc::Sender<EventRecord>,
    events_rx: mpsc::Receiver<EventRecord>,
    connected_at: DateTime<Utc>,
    last_heard: Instant,
    last_heard_at: DateTime<Utc>,
    disconnected: bool,
}

impl<W: AsyncWrite + Unpin> DeviceSession<W> {
    async fn run(mut self) {
        if let Err(e) = self.hello_exchange().await {
            warn!(device_id = %self.device_id, error = %e, "hello exchange failed");
            self.disconnect("hello failed").await;
            return;
        }

        let keepalive = Duration::from_millis(self.state.config.protocol.keepalive_timeout_ms);
        let socket_timeout = Duration::from_millis(self.state.config.protocol.socket_timeout_ms);
        let mut keepalive_tick = tokio::time::interval(keepalive);
        keepalive_tick.tick().await;

        let reason: String;
        loop {
            let deadline = self
                .earliest_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                inbound = self.frame_rx.recv() => match inbound {
                    Some(Ok(raw)) => {
                        if let Err(e) = self.on_frame(&raw).await {
                            if e.is_fatal() {
                                reason = e.to_string();
                                break;
                            }
                            debug!(device_id = %self.device_id, error = %e, "non-fatal frame error");
                        }
                    }
                    Some(Err(e)) => { reason = e.to_string(); break; }
                    None => { reason = "inbound stream ended".to_owned(); break; }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.on_command(command).await {
                            if e.is_fatal() {
                                reason = e.to_string();
                                break;
                            }
                        }
                    }
                    // The registry dropped our mailbox: a reconnect took over.
                    None => { reason = "superseded by reconnect".to_owned(); break; }
                },
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        if let Err(e) = self.deliver_event(event).await {
                            if e.is_fatal() {
                                reason = e.to_string();
                                break;
                            }
                        }
                    }
                },
                () = sleep_until(deadline) => self.expire_pending(),
                _ = keepalive_tick.tick() => {
                    if self.last_heard.elapsed() > socket_timeout {
                        reason = "socket timeout".to_owned();
                        break;
                    }
                }
            }
        }
        self.disconnect(&reason).await;
    }

    /// First ciphertext frame must be the device Hello; it seeds the
    /// receive counter and carries product/firmware/platform ids.
    async fn hello_exchange(&mut self) -> Result<(), GatewayError> {
        let socket_timeout = Duration::from_millis(self.state.config.protocol.socket_timeout_ms);
        let raw = tokio::time::timeout(socket_timeout, self.frame_rx.recv())
            .await
            .map_err(|_| GatewayError::Protocol("timeout waiting for device hello".to_owned()))?
            .ok_or_else(|| GatewayError::Protocol("stream ended before hello".to_owned()))??;
        let message = Message::decode(&raw)?;
        if MessageKind::classify_request(&message) != MessageKind::Hello {
            return Err(GatewayError::Protocol(format!(
                "expected hello, got {} {}",
                message.code, message.uri_path
            )));
        }

        self.recv_counter = message.id;
        let hello = HelloPayload::decode(&message.payload);
        self.product_id = hello.product_id;
        self.firmware_version = hello.firmware_version;
        self.platform_id = hello.platform_id;
        if let Some(product_id) = hello.product_id {
            self.state.attributes.set_core_attribute(
                &self.device_id,
                attr::PRODUCT_ID,
                &product_id.to_string(),
            );
        }
        if let Some(firmware_version) = hello.firmware_version {
            self.state.attributes.set_core_attribute(
                &self.device_id,
                attr::FIRMWARE_VERSION,
                &firmware_version.to_string(),
            );
        }
        info!(
            device_id = %self.device_id,
            product_id = ?self.product_id,
            firmware_version = ?self.firmware_version,
            platform_id = ?self.platform_id,
            "device hello"
        );

        // Our own hello acknowledges theirs.
        self.write_message(&kinds::response(MessageKind::Hello, message.id, None))
            .await
    }

    // -----------------------------------------------------------------------
    // Inbound routing
    // -----------------------------------------------------------------------

    async fn on_frame(&mut self, raw: &[u8]) -> Result<(), GatewayError> {
        let message = Message::decode(raw)?;
        self.last_heard = Instant::now();
        self.last_heard_at = Utc::now();

        if message.is_ack() {
            // Token recovers the awaited reply kind; an unknown or missing
            // token means this is just a keepalive acknowledgement.
            let listener = message
                .token_byte()
                .and_then(|token| self.pending.remove(&token));
            return match listener {
                Some(listener) => self.on_response(listener, message).await,
                None => {
                    debug!(device_id = %self.device_id, id = message.id, "bare ack");
                    Ok(())
                }
            };
        }

        let kind = MessageKind::classify_request(&message);
        if kind == MessageKind::Ping {
            return self.write_message(&Message::ping_ack(message.id)).await;
        }

        let expected = next_counter(self.recv_counter, self.counter_max);
        if message.id != expected {
            // A counter violation is fatal even on frames we would
            // otherwise drop.
            return Err(GatewayError::Protocol(format!(
                "Bad Counter: kind {kind:?} id {} expected {expected}",
                message.id
            )));
        }
        self.recv_counter = expected;

        match kind {
            MessageKind::PublicEvent => self.on_device_event(message, true).await,
            MessageKind::PrivateEvent => self.on_device_event(message, false).await,
            MessageKind::Subscribe => self.on_subscribe(&message).await,
            MessageKind::GetTime => self.on_get_time(&message).await,
            MessageKind::Ignored => {
                debug!(device_id = %self.device_id, "dropping unrecognized frame");
                Ok(())
            }
            other => {
                debug!(device_id = %self.device_id, kind = ?other, "unhandled device-initiated kind");
                Ok(())
            }
        }
    }

    async fn on_response(
        &mut self,
        listener: PendingListener,
        message: Message,
    ) -> Result<(), GatewayError> {
        match listener.action {
            PendingAction::VarReply {
                name,
                var_type,
                reply,
            } => {
                let result = PayloadValue::decode(var_type, &message.payload)
                    .map(|value| ApiReply::VarReturn {
                        name,
                        value,
                        raw: message.payload.clone(),
                    })
                    .map_err(|e| GatewayError::Introspection(e.to_string()));
                let _ = reply.send(result);
                Ok(())
            }
            PendingAction::FnReply { name, reply } => {
                let result = PayloadValue::decode(VarType::Int32, &message.payload)
                    .map(|value| match value {
                        PayloadValue::Int32(v) => ApiReply::FnReturn { name, value: v },
                        _ => unreachable!("decoded as int32"),
                    })
                    .map_err(|e| GatewayError::Introspection(e.to_string()));
                let _ = reply.send(result);
                Ok(())
            }
            PendingAction::DescribeReply { reply, safe_mode } => {
                match DeviceFunctionState::from_payload(&message.payload) {
                    Ok(parsed) => {
                        self.function_state = Some(parsed.clone());
                        if safe_mode {
                            self.state.api.safe_mode(&self.device_id, &message.payload);
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(ApiReply::Describe {
                                product_id: self.product_id,
                                firmware_version: self.firmware_version,
                                state: parsed,
                            }));
                        }
                    }
                    Err(e) => {
                        warn!(device_id = %self.device_id, error = %e, "unparseable describe document");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(GatewayError::Introspection(e.to_string())));
                        }
                    }
                }
                Ok(())
            }
            PendingAction::RaiseHandReply { reply } => {
                let _ = reply.send(Ok(ApiReply::RaiseHand { accepted: true }));
                Ok(())
            }
            PendingAction::FlashAck => self.on_flash_ack(listener.expect, &message).await,
        }
    }

    // -----------------------------------------------------------------------
    // Backend commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: ApiCommand) -> Result<(), GatewayError> {
        // Exclusive ownership: while the flasher holds the session, only
        // Ping is answered, and nothing touches the socket.
        if self.flash.is_some() {
            return match command {
                ApiCommand::Ping { reply } => {
                    let _ = reply.send(self.ping_status());
                    Ok(())
                }
                other => {
                    if let Some(reply) = api_responder(other) {
                        let _ = reply.send(Err(GatewayError::Ownership("locked during flashing")));
                    }
                    Ok(())
                }
            };
        }

        if self.state.config.logging.log_api_messages {
            debug!(device_id = %self.device_id, command = ?command, "api command");
        }

        match command {
            ApiCommand::Describe { reply } => {
                if let Some(state) = &self.function_state {
                    let _ = reply.send(Ok(ApiReply::Describe {
                        product_id: self.product_id,
                        firmware_version: self.firmware_version,
                        state: state.clone(),
                    }));
                    return Ok(());
                }
                self.send_describe(Some(reply), false).await
            }
            ApiCommand::GetVar {
                name,
                var_type,
                reply,
            } => {
                let var_type = var_type
                    .as_deref()
                    .and_then(VarType::parse)
                    .or_else(|| {
                        self.function_state
                            .as_ref()
                            .and_then(|s| s.var_type(&name))
                    })
                    .unwrap_or(VarType::String);
                let action = PendingAction::VarReply {
                    name: name.clone(),
                    var_type,
                    reply,
                };
                self.send_tracked(MessageKind::VariableRequest, &name, None, Vec::new(), action)
                    .await
            }
            ApiCommand::SetVar { name, value, reply } => {
                // Same wire shape as a read; the payload carries the value
                // and the device echoes it back.
                let action = PendingAction::VarReply {
                    name: name.clone(),
                    var_type: value.var_type(),
                    reply,
                };
                self.send_tracked(
                    MessageKind::VariableRequest,
                    &name,
                    None,
                    value.encode(),
                    action,
                )
                .await
            }
            ApiCommand::CallFn { name, args, reply } => self.call_function(name, &args, reply).await,
            ApiCommand::Flash { binary, reply } => self.start_flash(&binary, reply).await,
            ApiCommand::FlashKnown { app, reply } => {
                let environment = self.state.config.logging.environment.clone();
                match self.state.firmware.lookup(&app, &environment) {
                    Some(binary) => self.start_flash(&binary, reply).await,
                    None => {
                        warn!(device_id = %self.device_id, app, environment, "unknown firmware app");
                        self.publish_flash_status("failed");
                        let _ = reply.send(Err(FlashError::UnknownApp(app).into()));
                        Ok(())
                    }
                }
            }
            ApiCommand::RaiseHand { signal, reply } => {
                let query = Some(format!("v={}", u8::from(signal)));
                let action = PendingAction::RaiseHandReply { reply };
                self.send_tracked(MessageKind::RaiseYourHand, "", query, Vec::new(), action)
                    .await
            }
            ApiCommand::Ping { reply } => {
                let _ = reply.send(self.ping_status());
                Ok(())
            }
        }
    }

    fn ping_status(&self) -> PingStatus {
        PingStatus {
            online: !self.disconnected,
            last_heard: Some(self.last_heard_at),
        }
    }

    async fn send_describe(
        &mut self,
        reply: Option<ApiResponder>,
        safe_mode: bool,
    ) -> Result<(), GatewayError> {
        let action = PendingAction::DescribeReply { reply, safe_mode };
        self.send_tracked(MessageKind::Describe, "", None, Vec::new(), action)
            .await
    }

    async fn call_function(
        &mut self,
        name: String,
        args: &str,
        reply: ApiResponder,
    ) -> Result<(), GatewayError> {
        let query = {
            let Some(spec) = self
                .function_state
                .as_ref()
                .and_then(|state| state.function(&name))
            else {
                let _ = reply.send(Err(GatewayError::Introspection(format!(
                    "Unknown Function: {name}"
                ))));
                return Ok(());
            };
            let split: Vec<&str> = if args.is_empty() {
                Vec::new()
            } else {
                args.split(',').collect()
            };
            if split.len() != spec.args.len() {
                let _ = reply.send(Err(GatewayError::Introspection(format!(
                    "{name} takes {} arguments, got {}",
                    spec.args.len(),
                    split.len()
                ))));
                return Ok(());
            }
            if split.is_empty() {
                None
            } else {
                Some(split.join("&"))
            }
        };
        let action = PendingAction::FnReply {
            name: name.clone(),
            reply,
        };
        self.send_tracked(MessageKind::FunctionCall, &name, query, Vec::new(), action)
            .await
    }

    // -----------------------------------------------------------------------
    // OTA flashing
    // -----------------------------------------------------------------------

    async fn start_flash(
        &mut self,
        binary: &[u8],
        reply: ApiResponder,
    ) -> Result<(), GatewayError> {
        let cfg = &self.state.config.flash;
        let mut flasher = match Flasher::new(
            binary,
            cfg.max_binary_size,
            cfg.chunk_size,
            cfg.max_chunk_retries,
        ) {
            Ok(flasher) => flasher,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(());
            }
        };
        info!(
            device_id = %self.device_id,
            bytes = binary.len(),
            chunks = flasher.chunk_count(),
            sha256 = %hex::encode(Sha256::digest(binary)),
            "starting OTA flash"
        );
        flasher.begin();
        let payload = flasher.begin_payload();
        // Take exclusive ownership for the duration of the transfer.
        self.flash = Some(FlashJob { flasher, reply });
        self.send_tracked(
            MessageKind::UpdateBegin,
            "",
            None,
            payload,
            PendingAction::FlashAck,
        )
        .await
    }

    async fn on_flash_ack(
        &mut self,
        expect: MessageKind,
        message: &Message,
    ) -> Result<(), GatewayError> {
        let Some(job) = self.flash.as_mut() else {
            return Ok(());
        };
        if message.code.class() == 4 {
            job.flasher.fail();
            self.abort_flash(FlashError::Interrupted("device rejected update"))
                .await?;
            return Ok(());
        }
        let step = match expect {
            MessageKind::UpdateReady => Ok(job.flasher.on_update_ready()),
            MessageKind::ChunkReceived => match <[u8; 4]>::try_from(&message.payload[..]) {
                Ok(crc) => job.flasher.on_chunk_received(u32::from_le_bytes(crc)),
                Err(_) => {
                    job.flasher.fail();
                    Err(FlashError::Interrupted("malformed chunk receipt"))
                }
            },
            _ => return Ok(()),
        };
        match step {
            Ok(FlashAction::SendChunk { index }) => self.send_chunk(index).await,
            Ok(FlashAction::SendDone) => {
                self.send_request(MessageKind::UpdateDone, "", None, Vec::new())
                    .await?;
                info!(device_id = %self.device_id, "OTA flash complete");
                self.finish_flash(true, Ok(ApiReply::FlashDone));
                Ok(())
            }
            Ok(FlashAction::SendBegin) => Ok(()),
            Err(e) => self.abort_flash(e).await,
        }
    }

    async fn send_chunk(&mut self, index: usize) -> Result<(), GatewayError> {
        let Some(job) = self.flash.as_ref() else {
            return Ok(());
        };
        let payload = job.flasher.chunk(index).to_vec();
        debug!(device_id = %self.device_id, chunk = index, "sending firmware chunk");
        self.send_tracked(MessageKind::Chunk, "", None, payload, PendingAction::FlashAck)
            .await
    }

    /// Tell the device the transfer is off, then settle the flash job.
    async fn abort_flash(&mut self, error: FlashError) -> Result<(), GatewayError> {
        warn!(device_id = %self.device_id, error = %error, "OTA flash failed");
        let send_result = self
            .send_request(MessageKind::UpdateAbort, "", None, Vec::new())
            .await
            .map(|_| ());
        self.finish_flash(false, Err(error.into()));
        send_result
    }

    /// Release exclusive ownership and publish the flash outcome.
    fn finish_flash(&mut self, success: bool, result: Result<ApiReply, GatewayError>) {
        if let Some(job) = self.flash.take() {
            let _ = job.reply.send(result);
            self.publish_flash_status(if success { "success" } else { "failed" });
        }
    }

    fn publish_flash_status(&self, status: &str) {
        let record = EventRecord {
            name: "spark/flash/status".to_owned(),
            is_public: false,
            ttl: DEFAULT_TTL,
            data: Some(status.as_bytes().to_vec()),
            device_id: self.device_id,
            published_at: Utc::now(),
        };
        let _ = self.state.publisher.publish(&record, &self.user_id);
    }

    // -----------------------------------------------------------------------
    // Device events
    // -----------------------------------------------------------------------

    async fn on_device_event(
        &mut self,
        message: Message,
        is_public: bool,
    ) -> Result<(), GatewayError> {
        let name = event_name(message.path_rest());
        if name.starts_with(INTERNAL_EVENT_PREFIX) {
            return self.on_internal_event(&name, &message).await;
        }

        let record = EventRecord {
            name,
            is_public,
            ttl: message.max_age.unwrap_or(DEFAULT_TTL),
            data: if message.payload.is_empty() {
                None
            } else {
                Some(message.payload.clone())
            },
            device_id: self.device_id,
            published_at: Utc::now(),
        };
        match self.state.publisher.publish(&record, &self.user_id) {
            PublishOutcome::RateLimited => {
                // Push back with the original id so the device can match it.
                self.write_message(&kinds::response(
                    MessageKind::EventSlowdown,
                    message.id,
                    None,
                ))
                .await
            }
            PublishOutcome::Accepted => {
                if message.is_confirmable() {
                    self.write_message(&kinds::response(MessageKind::EventAck, message.id, None))
                        .await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// `spark/*` events are consumed here and never republished.
    async fn on_internal_event(
        &mut self,
        name: &str,
        message: &Message,
    ) -> Result<(), GatewayError> {
        match name {
            "spark/device/claim/code" => {
                let claim = String::from_utf8_lossy(&message.payload).into_owned();
                let current = self
                    .state
                    .attributes
                    .get_core_attributes(&self.device_id)
                    .get(attr::CLAIM_CODE)
                    .cloned();
                if current.as_deref() != Some(claim.as_str()) {
                    self.state.attributes.set_core_attribute(
                        &self.device_id,
                        attr::CLAIM_CODE,
                        &claim,
                    );
                    self.state.api.link_device(
                        &self.device_id,
                        &claim,
                        self.product_id.unwrap_or(0),
                    );
                }
            }
            "spark/device/system/version" => {
                let version = String::from_utf8_lossy(&message.payload).into_owned();
                self.state.attributes.set_core_attribute(
                    &self.device_id,
                    attr::SYSTEM_VERSION,
                    &version,
                );
            }
            "spark/device/safemode" => {
                self.send_describe(None, true).await?;
            }
            other => {
                debug!(device_id = %self.device_id, event = other, "dropping internal event");
            }
        }
        if message.is_confirmable() {
            self.write_message(&kinds::response(MessageKind::EventAck, message.id, None))
                .await?;
        }
        Ok(())
    }

    async fn on_subscribe(&mut self, message: &Message) -> Result<(), GatewayError> {
        let name = event_name(message.path_rest());
        if name.is_empty() {
            return self
                .write_message(&kinds::response(
                    MessageKind::SubscribeFail,
                    message.id,
                    message.token_byte(),
                ))
                .await;
        }
        let user_scoped = message
            .uri_query
            .as_deref()
            .is_some_and(|query| query.split('&').any(|entry| entry == "u"));
        let device_filter = DeviceId::from_bytes(&message.payload);

        self.write_message(&kinds::response(
            MessageKind::SubscribeAck,
            message.id,
            message.token_byte(),
        ))
        .await?;

        self.state.publisher.subscribe(Subscription {
            name,
            user_id: if user_scoped {
                self.user_id.clone()
            } else {
                String::new()
            },
            device_filter,
            subscriber: self.device_id.to_string(),
            sink: self.events_tx.clone(),
        });
        Ok(())
    }

    async fn on_get_time(&mut self, message: &Message) -> Result<(), GatewayError> {
        let now = Utc::now().timestamp() as u32;
        let mut response =
            kinds::response(MessageKind::GetTimeReturn, message.id, message.token_byte());
        response.payload = PayloadValue::Uint32(now).encode();
        self.write_message(&response).await
    }

    /// Deliver one subscribed event down to the device.
    async fn deliver_event(&mut self, event: EventRecord) -> Result<(), GatewayError> {
        let name = strip_user_prefix(&event.name, &self.user_id).to_owned();
        let kind = if event.is_public {
            MessageKind::PublicEvent
        } else {
            MessageKind::PrivateEvent
        };
        let id = self.next_send();
        let mut message = Message::empty(
            cl_protocol::CoapType::NonConfirmable,
            kind.spec().code,
            id,
        );
        message.uri_path = kind.uri_for(&name);
        message.max_age = Some(event.ttl);
        message.timestamp = Some(event.published_at.timestamp() as u32);
        if let Some(data) = event.data {
            message.payload = data;
        }
        self.write_message(&message).await
    }

    // -----------------------------------------------------------------------
    // Sending machinery
    // -----------------------------------------------------------------------

    /// Send a request and register its reply listener in the token table.
    async fn send_tracked(
        &mut self,
        kind: MessageKind,
        name: &str,
        query: Option<String>,
        payload: Vec<u8>,
        action: PendingAction,
    ) -> Result<(), GatewayError> {
        let expect = kind
            .response_kind()
            .ok_or_else(|| GatewayError::Protocol(format!("{kind:?} awaits no reply")))?;
        match self.send_request(kind, name, query, payload).await {
            Ok(Some(token)) => {
                self.pending.insert(
                    token,
                    PendingListener {
                        expect,
                        deadline: Instant::now() + LISTEN_TIMEOUT,
                        action,
                    },
                );
                Ok(())
            }
            Ok(None) => Err(GatewayError::Protocol(format!(
                "{kind:?} carries no token to track"
            ))),
            Err(e) => {
                fail_action(action, || GatewayError::Disconnected);
                Err(e)
            }
        }
    }

    /// Counter assignment, frame build, encryption, and write: one step.
    async fn send_request(
        &mut self,
        kind: MessageKind,
        name: &str,
        query: Option<String>,
        payload: Vec<u8>,
    ) -> Result<Option<u8>, GatewayError> {
        let id = self.next_send();
        let token = match kind.spec().token {
            cl_protocol::TokenReq::Required => Some(self.next_token()?),
            cl_protocol::TokenReq::None => None,
        };
        let mut message = kinds::request(kind, id, token, name);
        message.uri_query = query;
        message.payload = payload;
        self.write_message(&message).await?;
        Ok(token)
    }

    async fn write_message(&mut self, message: &Message) -> Result<(), GatewayError> {
        if self.state.config.logging.show_verbose_device_logs {
            debug!(
                device_id = %self.device_id,
                code = %message.code,
                id = message.id,
                uri = %message.uri_path,
                "outbound frame"
            );
        }
        self.writer.write_frame(&message.encode()).await
    }

    /// Post-increment send counter; the wire id equals the new value.
    fn next_send(&mut self) -> u16 {
        self.send_counter = next_counter(self.send_counter, self.counter_max);
        self.send_counter
    }

    /// Post-increment token, skipping values still awaiting a reply.
    fn next_token(&mut self) -> Result<u8, GatewayError> {
        for _ in 0..=usize::from(u8::MAX) {
            self.token = self.token.wrapping_add(1);
            if !self.pending.contains_key(&self.token) {
                return Ok(self.token);
            }
        }
        Err(GatewayError::Protocol("token space exhausted".to_owned()))
    }

    // -----------------------------------------------------------------------
    // Deadlines and teardown
    // -----------------------------------------------------------------------

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|l| l.deadline).min()
    }

    /// Fail every listener whose deadline has passed, releasing its token.
    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u8> = self
            .pending
            .iter()
            .filter(|(_, listener)| listener.deadline <= now)
            .map(|(&token, _)| token)
            .collect();
        for token in expired {
            let Some(listener) = self.pending.remove(&token) else {
                continue;
            };
            debug!(device_id = %self.device_id, token, expect = ?listener.expect, "listener timed out");
            match listener.action {
                // A silent device answers raise-hand with a plain "no".
                PendingAction::RaiseHandReply { reply } => {
                    let _ = reply.send(Ok(ApiReply::RaiseHand { accepted: false }));
                }
                PendingAction::FlashAck => {
                    if let Some(job) = self.flash.as_mut() {
                        job.flasher.fail();
                    }
                    self.finish_flash(
                        false,
                        Err(FlashError::Interrupted("device stopped acknowledging").into()),
                    );
                }
                other => fail_action(other, || GatewayError::Timeout),
            }
        }
    }

    /// Idempotent teardown: ends both cipher streams, clears listeners,
    /// deregisters, and emits exactly one disconnect signal.
    async fn disconnect(&mut self, reason: &str) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        info!(
            device_id = %self.device_id,
            reason,
            connected_secs = (Utc::now() - self.connected_at).num_seconds(),
            "device disconnected"
        );

        if let Some(mut job) = self.flash.take() {
            job.flasher.fail();
            let _ = job
                .reply
                .send(Err(FlashError::Interrupted("session disconnected").into()));
            self.publish_flash_status("failed");
        }
        for (_, listener) in self.pending.drain() {
            fail_action(listener.action, || GatewayError::Disconnected);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.writer.shutdown().await;
        self.state
            .publisher
            .unsubscribe_all(&self.device_id.to_string());
        self.state
            .unregister_session(&self.device_id, self.serial)
            .await;
        self.state.signal_disconnect(self.device_id);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wrapping counter increment under the configured maximum.
fn next_counter(current: u16, max: u32) -> u16 {
    ((u32::from(current) + 1) % max) as u16
}

/// Event name after the URI prefix: clamped to 63 bytes on a char boundary.
fn event_name(raw: &str) -> String {
    let mut name = raw.to_owned();
    if name.len() > MAX_EVENT_NAME {
        let mut end = MAX_EVENT_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Strip a leading `<user_id>/` from an event name before delivery.
fn strip_user_prefix<'a>(name: &'a str, user_id: &str) -> &'a str {
    if user_id.is_empty() {
        return name;
    }
    match name.strip_prefix(user_id) {
        Some(rest) => rest.strip_prefix('/').unwrap_or(name),
        None => name,
    }
}

/// Pull the API responder out of a command so it can be failed.
fn api_responder(command: ApiCommand) -> Option<ApiResponder> {
    match command {
        ApiCommand::Describe { reply }
        | ApiCommand::GetVar { reply, .. }
        | ApiCommand::SetVar { reply, .. }
        | ApiCommand::CallFn { reply, .. }
        | ApiCommand::Flash { reply, .. }
        | ApiCommand::FlashKnown { reply, .. }
        | ApiCommand::RaiseHand { reply, .. } => Some(reply),
        ApiCommand::Ping { .. } => None,
    }
}

fn fail_action(action: PendingAction, error: impl FnOnce() -> GatewayError) {
    match action {
        PendingAction::VarReply { reply, .. }
        | PendingAction::FnReply { reply, .. }
        | PendingAction::RaiseHandReply { reply } => {
            let _ = reply.send(Err(error()));
        }
        PendingAction::DescribeReply { reply, .. } => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(error()));
            }
        }
        PendingAction::FlashAck => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
