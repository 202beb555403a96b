//! CoAP 1.0 frame wrap/unwrap.
//!
//! The device link speaks plain CoAP framing: a 4-byte header, a 0-8 byte
//! token, options in ascending option-number order, then an optional
//! 0xFF-marked payload. Only the options the protocol actually uses are
//! surfaced as typed fields; unrecognized options are skipped on decode.

/// CoAP option numbers used by the device link.
const OPT_URI_PATH: u16 = 11;
const OPT_CONTENT_FORMAT: u16 = 12;
const OPT_MAX_AGE: u16 = 14;
const OPT_URI_QUERY: u16 = 15;
/// Vendor option (elective range): event publish time, u32 UTC seconds.
const OPT_TIMESTAMP: u16 = 2053;

const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LENGTH: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated at byte {at}")]
    Truncated { at: usize },
    #[error("unsupported CoAP version {0}")]
    BadVersion(u8),
    #[error("token length {0} exceeds 8")]
    BadTokenLength(u8),
    #[error("reserved option nibble in delta/length encoding")]
    BadOptionNibble,
    #[error("option value is not valid UTF-8")]
    BadOptionUtf8,
}

/// CoAP message type (header bits 4-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Ack,
    Reset,
}

impl CoapType {
    fn from_bits(bits: u8) -> CoapType {
        match bits & 0x03 {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Ack,
            _ => CoapType::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            CoapType::Confirmable => 0,
            CoapType::NonConfirmable => 1,
            CoapType::Ack => 2,
            CoapType::Reset => 3,
        }
    }
}

/// CoAP code byte: 3-bit class, 5-bit detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapCode(pub u8);

impl CoapCode {
    pub const EMPTY: CoapCode = CoapCode(0x00);
    pub const GET: CoapCode = CoapCode(0x01);
    pub const POST: CoapCode = CoapCode(0x02);
    pub const PUT: CoapCode = CoapCode(0x03);
    /// 2.04 Changed
    pub const CHANGED: CoapCode = CoapCode(0x44);
    /// 2.05 Content
    pub const CONTENT: CoapCode = CoapCode(0x45);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: CoapCode = CoapCode(0x80);
    /// 4.29 Too Many Requests
    pub const TOO_MANY_REQUESTS: CoapCode = CoapCode(0x9D);

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for CoapCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// One decoded frame of the device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: CoapType,
    pub code: CoapCode,
    /// The 16-bit message id; the session counters live in this field.
    pub id: u16,
    /// Request/response correlation token, 0-8 bytes on the wire.
    pub token: Vec<u8>,
    /// Uri-Path segments joined with '/', no leading slash.
    pub uri_path: String,
    /// Uri-Query entries joined with '&'.
    pub uri_query: Option<String>,
    pub content_format: Option<u16>,
    pub max_age: Option<u32>,
    /// Vendor timestamp option: event publish time, UTC seconds.
    pub timestamp: Option<u32>,
    pub payload: Vec<u8>,
}

impl Message {
    /// A bare frame with no token, options, or payload.
    pub fn empty(msg_type: CoapType, code: CoapCode, id: u16) -> Message {
        Message {
            msg_type,
            code,
            id,
            token: Vec::new(),
            uri_path: String::new(),
            uri_query: None,
            content_format: None,
            max_age: None,
            timestamp: None,
            payload: Vec::new(),
        }
    }

    /// The empty confirmable keepalive probe.
    pub fn ping(id: u16) -> Message {
        Message::empty(CoapType::Confirmable, CoapCode::EMPTY, id)
    }

    /// The empty acknowledgement for `id`.
    pub fn ping_ack(id: u16) -> Message {
        Message::empty(CoapType::Ack, CoapCode::EMPTY, id)
    }

    pub fn is_ack(&self) -> bool {
        self.msg_type == CoapType::Ack
    }

    pub fn is_confirmable(&self) -> bool {
        self.msg_type == CoapType::Confirmable
    }

    /// Single-byte view of the token; the link only ever issues one byte.
    pub fn token_byte(&self) -> Option<u8> {
        self.token.first().copied()
    }

    /// First Uri-Path segment, the request discriminator.
    pub fn path_root(&self) -> &str {
        self.uri_path.split('/').next().unwrap_or("")
    }

    /// Uri-Path remainder after the root segment.
    pub fn path_rest(&self) -> &str {
        match self.uri_path.split_once('/') {
            Some((_, rest)) => rest,
            None => "",
        }
    }

    // -----------------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.uri_path.len() + self.payload.len());
        let tkl = self.token.len().min(MAX_TOKEN_LENGTH) as u8;
        buf.push(0x40 | (self.msg_type.bits() << 4) | tkl);
        buf.push(self.code.0);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.token[..tkl as usize]);

        let mut last_number = 0u16;
        if !self.uri_path.is_empty() {
            for segment in self.uri_path.split('/') {
                push_option(&mut buf, &mut last_number, OPT_URI_PATH, segment.as_bytes());
            }
        }
        if let Some(format) = self.content_format {
            push_option(
                &mut buf,
                &mut last_number,
                OPT_CONTENT_FORMAT,
                &uint_bytes(u32::from(format)),
            );
        }
        if let Some(age) = self.max_age {
            push_option(&mut buf, &mut last_number, OPT_MAX_AGE, &uint_bytes(age));
        }
        if let Some(query) = &self.uri_query {
            for entry in query.split('&') {
                push_option(&mut buf, &mut last_number, OPT_URI_QUERY, entry.as_bytes());
            }
        }
        if let Some(ts) = self.timestamp {
            push_option(&mut buf, &mut last_number, OPT_TIMESTAMP, &uint_bytes(ts));
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    // -----------------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------------

    pub fn decode(raw: &[u8]) -> Result<Message, CodecError> {
        if raw.len() < 4 {
            return Err(CodecError::Truncated { at: raw.len() });
        }
        let version = raw[0] >> 6;
        if version != 1 {
            return Err(CodecError::BadVersion(version));
        }
        let msg_type = CoapType::from_bits(raw[0] >> 4);
        let tkl = raw[0] & 0x0F;
        if tkl as usize > MAX_TOKEN_LENGTH {
            return Err(CodecError::BadTokenLength(tkl));
        }
        let code = CoapCode(raw[1]);
        let id = u16::from_be_bytes([raw[2], raw[3]]);

        let mut at = 4;
        if raw.len() < at + tkl as usize {
            return Err(CodecError::Truncated { at: raw.len() });
        }
        let token = raw[at..at + tkl as usize].to_vec();
        at += tkl as usize;

        let mut message = Message::empty(msg_type, code, id);
        message.token = token;

        let mut path_segments: Vec<String> = Vec::new();
        let mut query_entries: Vec<String> = Vec::new();
        let mut number = 0u16;
        while at < raw.len() {
            if raw[at] == PAYLOAD_MARKER {
                at += 1;
                if at == raw.len() {
                    // Marker with nothing behind it.
                    return Err(CodecError::Truncated { at });
                }
                message.payload = raw[at..].to_vec();
                break;
            }
            let nibbles = raw[at];
            at += 1;
            let delta = read_extended(raw, &mut at, nibbles >> 4)?;
            let length = read_extended(raw, &mut at, nibbles & 0x0F)? as usize;
            number = number.wrapping_add(delta);
            if raw.len() < at + length {
                return Err(CodecError::Truncated { at: raw.len() });
            }
            let value = &raw[at..at + length];
            at += length;

            match number {
                OPT_URI_PATH => path_segments.push(utf8_option(value)?),
                OPT_CONTENT_FORMAT => message.content_format = Some(uint_value(value) as u16),
                OPT_MAX_AGE => message.max_age = Some(uint_value(value)),
                OPT_URI_QUERY => query_entries.push(utf8_option(value)?),
                OPT_TIMESTAMP => message.timestamp = Some(uint_value(value)),
                _ => {}
            }
        }

        message.uri_path = path_segments.join("/");
        if !query_entries.is_empty() {
            message.uri_query = Some(query_entries.join("&"));
        }
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Option encoding helpers
// ---------------------------------------------------------------------------

fn push_option(buf: &mut Vec<u8>, last_number: &mut u16, number: u16, value: &[u8]) {
    let delta = number - *last_number;
    *last_number = number;
    let (delta_nibble, delta_ext) = split_extended(delta);
    let (len_nibble, len_ext) = split_extended(value.len() as u16);
    buf.push((delta_nibble << 4) | len_nibble);
    buf.extend_from_slice(&delta_ext);
    buf.extend_from_slice(&len_ext);
    buf.extend_from_slice(value);
}

/// Split a delta/length value into its 4-bit nibble and extension bytes.
fn split_extended(value: u16) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, (value - 269).to_be_bytes().to_vec())
    }
}

fn read_extended(raw: &[u8], at: &mut usize, nibble: u8) -> Result<u16, CodecError> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let byte = *raw.get(*at).ok_or(CodecError::Truncated { at: *at })?;
            *at += 1;
            Ok(u16::from(byte) + 13)
        }
        14 => {
            if raw.len() < *at + 2 {
                return Err(CodecError::Truncated { at: *at });
            }
            let value = u16::from_be_bytes([raw[*at], raw[*at + 1]]);
            *at += 2;
            Ok(value + 269)
        }
        _ => Err(CodecError::BadOptionNibble),
    }
}

/// CoAP uint option value: minimal-length big-endian.
fn uint_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

fn uint_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

fn utf8_option(value: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(value.to_vec()).map_err(|_| CodecError::BadOptionUtf8)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
