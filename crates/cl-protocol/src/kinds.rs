//! The message-kind table.
//!
//! Every symbolic message the device link exchanges maps to a (CoAP code,
//! URI template, token requirement) tuple, and every request kind maps to
//! the reply kind it awaits. Inbound frames are classified from their code
//! and URI root; reply frames are classified through the outstanding-token
//! table by the session.

use crate::coap::{CoapCode, CoapType, Message};

/// Whether a kind carries a correlation token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenReq {
    None,
    Required,
}

/// Static wire description of one message kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSpec {
    pub code: CoapCode,
    /// URI template; `{}` marks the name slot. Reply kinds carry no URI.
    pub uri: Option<&'static str>,
    pub token: TokenReq,
}

/// Every message kind the device link speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Describe,
    DescribeReturn,
    VariableRequest,
    VariableValue,
    FunctionCall,
    FunctionReturn,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    UpdateDone,
    Chunk,
    ChunkReceived,
    Event,
    PublicEvent,
    PrivateEvent,
    Subscribe,
    SubscribeAck,
    SubscribeFail,
    GetTime,
    GetTimeReturn,
    RaiseYourHand,
    RaiseYourHandReturn,
    KeyChange,
    EventAck,
    EventSlowdown,
    SignalStart,
    Ping,
    PingAck,
    Ignored,
}

impl MessageKind {
    /// The static wire tuple for this kind.
    pub fn spec(self) -> KindSpec {
        use MessageKind::*;
        use TokenReq::{None as NoTok, Required as Tok};
        let (code, uri, token) = match self {
            Hello => (CoapCode::POST, Some("h"), NoTok),
            Describe => (CoapCode::GET, Some("d"), Tok),
            DescribeReturn => (CoapCode::CONTENT, None, Tok),
            VariableRequest => (CoapCode::GET, Some("v/{}"), Tok),
            VariableValue => (CoapCode::CONTENT, None, Tok),
            FunctionCall => (CoapCode::POST, Some("f/{}"), Tok),
            FunctionReturn => (CoapCode::CHANGED, None, Tok),
            UpdateBegin => (CoapCode::POST, Some("u"), Tok),
            UpdateReady => (CoapCode::CHANGED, None, Tok),
            UpdateAbort => (CoapCode::BAD_REQUEST, None, NoTok),
            UpdateDone => (CoapCode::PUT, Some("u"), NoTok),
            Chunk => (CoapCode::POST, Some("c"), Tok),
            ChunkReceived => (CoapCode::CHANGED, None, Tok),
            Event => (CoapCode::POST, Some("e/{}"), NoTok),
            PublicEvent => (CoapCode::POST, Some("E/{}"), NoTok),
            PrivateEvent => (CoapCode::POST, Some("e/{}"), NoTok),
            Subscribe => (CoapCode::GET, Some("e/{}"), Tok),
            SubscribeAck => (CoapCode::CONTENT, None, Tok),
            SubscribeFail => (CoapCode::BAD_REQUEST, None, Tok),
            GetTime => (CoapCode::GET, Some("t"), Tok),
            GetTimeReturn => (CoapCode::CONTENT, None, Tok),
            RaiseYourHand => (CoapCode::PUT, Some("s/raise"), Tok),
            RaiseYourHandReturn => (CoapCode::CHANGED, None, Tok),
            KeyChange => (CoapCode::PUT, Some("k"), Tok),
            EventAck => (CoapCode::EMPTY, None, NoTok),
            EventSlowdown => (CoapCode::TOO_MANY_REQUESTS, None, NoTok),
            SignalStart => (CoapCode::PUT, Some("s"), Tok),
            Ping => (CoapCode::EMPTY, None, NoTok),
            PingAck => (CoapCode::EMPTY, None, NoTok),
            Ignored => (CoapCode::EMPTY, None, NoTok),
        };
        KindSpec { code, uri, token }
    }

    /// The reply kind a request of this kind awaits, if any.
    pub fn response_kind(self) -> Option<MessageKind> {
        use MessageKind::*;
        match self {
            Hello => Some(Hello),
            Describe => Some(DescribeReturn),
            VariableRequest => Some(VariableValue),
            FunctionCall => Some(FunctionReturn),
            UpdateBegin => Some(UpdateReady),
            Chunk => Some(ChunkReceived),
            Subscribe => Some(SubscribeAck),
            GetTime => Some(GetTimeReturn),
            RaiseYourHand => Some(RaiseYourHandReturn),
            Ping => Some(PingAck),
            _ => None,
        }
    }

    /// Classify an inbound non-ack frame from its code and URI root.
    ///
    /// Frames this table does not recognize come back as `Ignored`.
    pub fn classify_request(message: &Message) -> MessageKind {
        use MessageKind::*;
        if message.code.is_empty() {
            return if message.is_confirmable() { Ping } else { Ignored };
        }
        match (message.code, message.path_root()) {
            (CoapCode::GET, "d") => Describe,
            (CoapCode::GET, "v") => VariableRequest,
            (CoapCode::GET, "t") => GetTime,
            (CoapCode::GET, "e") => Subscribe,
            (CoapCode::POST, "h") => Hello,
            (CoapCode::POST, "u") => UpdateBegin,
            (CoapCode::POST, "c") => Chunk,
            (CoapCode::POST, "f") => FunctionCall,
            (CoapCode::POST, "e") => PrivateEvent,
            (CoapCode::POST, "E") => PublicEvent,
            (CoapCode::PUT, "u") => UpdateDone,
            (CoapCode::PUT, "k") => KeyChange,
            (CoapCode::PUT, "s") => {
                if message.path_rest() == "raise" {
                    RaiseYourHand
                } else {
                    SignalStart
                }
            }
            _ => Ignored,
        }
    }

    /// Fill this kind's URI template with a name.
    pub fn uri_for(self, name: &str) -> String {
        match self.spec().uri {
            Some(template) => template.replace("{}", name),
            None => String::new(),
        }
    }
}

/// Build a request frame for `kind` in one step.
///
/// The caller owns counter and token assignment; this only applies the
/// static table (code, URI, confirmability).
pub fn request(kind: MessageKind, id: u16, token: Option<u8>, name: &str) -> Message {
    let spec = kind.spec();
    let mut message = Message::empty(CoapType::Confirmable, spec.code, id);
    message.uri_path = kind.uri_for(name);
    if let Some(token) = token {
        message.token = vec![token];
    }
    message
}

/// Build a reply frame for `kind`, acknowledging `id`.
pub fn response(kind: MessageKind, id: u16, token: Option<u8>) -> Message {
    let spec = kind.spec();
    let mut message = Message::empty(CoapType::Ack, spec.code, id);
    if let Some(token) = token {
        message.token = vec![token];
    }
    message
}

// ---------------------------------------------------------------------------
// Hello payload
// ---------------------------------------------------------------------------

/// Device Hello payload: three optional u16 LE values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloPayload {
    pub product_id: Option<u16>,
    pub firmware_version: Option<u16>,
    pub platform_id: Option<u16>,
}

impl HelloPayload {
    pub fn decode(payload: &[u8]) -> HelloPayload {
        let mut fields = payload
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        HelloPayload {
            product_id: fields.next(),
            firmware_version: fields.next(),
            platform_id: fields.next(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        for field in [self.product_id, self.firmware_version, self.platform_id] {
            match field {
                Some(value) => out.extend_from_slice(&value.to_le_bytes()),
                None => break,
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
