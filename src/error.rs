//! Error types and result definitions for the tuyalan crate.
//! Includes the numeric device error codes and conversion from IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Bad handle configuration (unsupported version, unknown device profile)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Standard IO error (network, broken pipe, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// TCP connection could not be established within the retry budget
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Request or read timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// Frame-level failure: prefix absent, length out of bounds
    #[error("Frame error: {0}")]
    Frame(String),

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// Failed to decrypt a message from the device (bad padding, GCM tag mismatch)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Session-key negotiation failed (bad HMAC, short nonce, wrong command)
    #[error("Session key negotiation failed: {0}")]
    Negotiation(String),

    /// Device response was not valid JSON
    #[error("JSON error: {0}")]
    Json(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

// Device error response codes, as reported by the firmware fleet.
pub const ERR_SUCCESS: u32 = 0;
pub const ERR_JSON: u32 = 900;
pub const ERR_CONNECT: u32 = 901;
pub const ERR_TIMEOUT: u32 = 902;
pub const ERR_RANGE: u32 = 903;
pub const ERR_PAYLOAD: u32 = 904;
pub const ERR_OFFLINE: u32 = 905;
pub const ERR_STATE: u32 = 906;
pub const ERR_FUNCTION: u32 = 907;
pub const ERR_DEVTYPE: u32 = 908;
pub const ERR_PARAMS: u32 = 912;
pub const ERR_KEY_OR_VER: u32 = 914;

/// Maps a numeric device error code to a user-facing description.
pub fn error_message(code: u32) -> String {
    match code {
        ERR_SUCCESS => "Success".to_string(),
        ERR_JSON => "Invalid JSON Response from Device".to_string(),
        ERR_CONNECT => "Network Error: Unable to Connect".to_string(),
        ERR_TIMEOUT => "Timeout Waiting for Device".to_string(),
        ERR_RANGE => "Specified Value Out of Range".to_string(),
        ERR_PAYLOAD => "Unexpected Payload from Device".to_string(),
        ERR_OFFLINE => "Network Error: Device Unreachable".to_string(),
        ERR_STATE => "Device in Unknown State".to_string(),
        ERR_FUNCTION => "Function Not Supported by Device".to_string(),
        ERR_DEVTYPE => "Device22 Detected: Retry Command".to_string(),
        ERR_PARAMS => "Missing Function Parameters".to_string(),
        ERR_KEY_OR_VER => "Check device key or version".to_string(),
        n => format!("Error code: {}", n),
    }
}
