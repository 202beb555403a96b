//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/corelink/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `keys.server_key_file`
//!
//! Everything else has a default.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub flash: FlashConfig,
    pub keys: KeysConfig,
    pub firmware: FirmwareConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Message-id counters wrap at this value.
    pub message_counter_max: u32,
    pub keepalive_timeout_ms: u64,
    pub socket_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FlashConfig {
    pub max_binary_size: usize,
    pub chunk_size: usize,
    pub max_chunk_retries: u32,
}

#[derive(Debug, Clone)]
pub struct KeysConfig {
    /// Server RSA private key, PEM.
    pub server_key_file: String,
    /// Directory of `<device-id-hex>.pub.pem` device public keys.
    pub device_keys_dir: String,
}

#[derive(Debug, Clone)]
pub struct FirmwareConfig {
    /// Root holding the `known_firmware/` lookup directory.
    pub dir: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Environment tag used in firmware lookups and log fields.
    pub environment: String,
    pub log_api_messages: bool,
    pub show_verbose_device_logs: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    protocol: Option<RawProtocolConfig>,
    flash: Option<RawFlashConfig>,
    keys: Option<RawKeysConfig>,
    firmware: Option<RawFirmwareConfig>,
    logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProtocolConfig {
    message_counter_max: Option<u32>,
    keepalive_timeout_ms: Option<u64>,
    socket_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFlashConfig {
    max_binary_size: Option<usize>,
    chunk_size: Option<usize>,
    max_chunk_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawKeysConfig {
    server_key_file: Option<String>,
    device_keys_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFirmwareConfig {
    dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLoggingConfig {
    environment: Option<String>,
    log_api_messages: Option<bool>,
    show_verbose_device_logs: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/corelink/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/corelink/gateway.toml"))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:5683".to_owned()),
    };

    let protocol = match raw.protocol {
        Some(p) => ProtocolConfig {
            message_counter_max: p.message_counter_max.unwrap_or(65_536),
            keepalive_timeout_ms: p.keepalive_timeout_ms.unwrap_or(15_000),
            socket_timeout_ms: p.socket_timeout_ms.unwrap_or(31_000),
        },
        None => ProtocolConfig {
            message_counter_max: 65_536,
            keepalive_timeout_ms: 15_000,
            socket_timeout_ms: 31_000,
        },
    };
    if protocol.message_counter_max == 0 || protocol.message_counter_max > 65_536 {
        return Err(ConfigError::InvalidValue(format!(
            "message_counter_max must be in 1..=65536, got {}",
            protocol.message_counter_max
        )));
    }

    let flash = match raw.flash {
        Some(f) => FlashConfig {
            max_binary_size: f.max_binary_size.unwrap_or(108_000),
            chunk_size: f.chunk_size.unwrap_or(512),
            max_chunk_retries: f.max_chunk_retries.unwrap_or(3),
        },
        None => FlashConfig {
            max_binary_size: 108_000,
            chunk_size: 512,
            max_chunk_retries: 3,
        },
    };
    if flash.chunk_size == 0 {
        return Err(ConfigError::InvalidValue(
            "flash.chunk_size must be non-zero".to_owned(),
        ));
    }

    let raw_keys = raw
        .keys
        .ok_or_else(|| ConfigError::MissingField("keys".to_owned()))?;
    let keys = KeysConfig {
        server_key_file: raw_keys
            .server_key_file
            .ok_or_else(|| ConfigError::MissingField("keys.server_key_file".to_owned()))?,
        device_keys_dir: raw_keys
            .device_keys_dir
            .unwrap_or_else(|| "/var/lib/corelink/device_keys".to_owned()),
    };

    let firmware = FirmwareConfig {
        dir: raw
            .firmware
            .and_then(|f| f.dir)
            .unwrap_or_else(|| "/var/lib/corelink".to_owned()),
    };

    let logging = match raw.logging {
        Some(l) => LoggingConfig {
            environment: l.environment.unwrap_or_else(|| "dev".to_owned()),
            log_api_messages: l.log_api_messages.unwrap_or(false),
            show_verbose_device_logs: l.show_verbose_device_logs.unwrap_or(false),
        },
        None => LoggingConfig {
            environment: "dev".to_owned(),
            log_api_messages: false,
            show_verbose_device_logs: false,
        },
    };

    Ok(GatewayConfig {
        schema_version,
        server,
        protocol,
        flash,
        keys,
        firmware,
        logging,
    })
}

impl GatewayConfig {
    /// A fully defaulted config for tests and in-process harnesses.
    pub fn for_tests() -> GatewayConfig {
        load_config_from_str(
            "schema_version = 1\n[keys]\nserver_key_file = \"unused.pem\"\n",
        )
        .expect("test config is valid")
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
