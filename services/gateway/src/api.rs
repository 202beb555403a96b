//! The backend-facing command surface of a device session.
//!
//! Commands arrive over the session's mailbox; each carries a oneshot
//! responder. The session drains them in order on its own task, so command
//! handling never races frame routing.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use cl_protocol::{DeviceFunctionState, PayloadValue};
use tokio::sync::oneshot;

pub type ApiResult = Result<ApiReply, GatewayError>;
pub type ApiResponder = oneshot::Sender<ApiResult>;

/// Commands the backend can issue against a connected device.
#[derive(Debug)]
pub enum ApiCommand {
    /// Fetch (and cache) the device's introspection document.
    Describe { reply: ApiResponder },
    /// Read a variable, decoding per the declared or cached type.
    GetVar {
        name: String,
        var_type: Option<String>,
        reply: ApiResponder,
    },
    /// Write a variable; the device echoes the value back.
    SetVar {
        name: String,
        value: PayloadValue,
        reply: ApiResponder,
    },
    /// Call a device function with comma-separated arguments.
    CallFn {
        name: String,
        args: String,
        reply: ApiResponder,
    },
    /// Flash a caller-supplied firmware image.
    Flash {
        binary: Vec<u8>,
        reply: ApiResponder,
    },
    /// Flash a named image from the firmware store.
    FlashKnown { app: String, reply: ApiResponder },
    /// Toggle the device's rainbow signal.
    RaiseHand { signal: bool, reply: ApiResponder },
    /// Liveness probe; answered from session state without touching the
    /// socket, even mid-flash.
    Ping { reply: oneshot::Sender<PingStatus> },
}

/// Replies to [`ApiCommand`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    Describe {
        product_id: Option<u16>,
        firmware_version: Option<u16>,
        state: DeviceFunctionState,
    },
    VarReturn {
        name: String,
        value: PayloadValue,
        raw: Vec<u8>,
    },
    FnReturn {
        name: String,
        value: i32,
    },
    /// The OTA transfer completed and `UpdateDone` went out.
    FlashDone,
    RaiseHand {
        accepted: bool,
    },
}

/// Answer to [`ApiCommand::Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingStatus {
    pub online: bool,
    pub last_heard: Option<DateTime<Utc>>,
}
