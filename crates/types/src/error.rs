//! USB error taxonomy

use crate::types::TransferType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// libusb-compatible platform error codes
pub mod code {
    pub const IO: i32 = -1;
    pub const INVALID_PARAM: i32 = -2;
    pub const ACCESS: i32 = -3;
    pub const NO_DEVICE: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const BUSY: i32 = -6;
    pub const TIMEOUT: i32 = -7;
    pub const OVERFLOW: i32 = -8;
    pub const PIPE: i32 = -9;
    pub const INTERRUPTED: i32 = -10;
    pub const NO_MEM: i32 = -11;
    pub const NOT_SUPPORTED: i32 = -12;
    pub const OTHER: i32 = -99;
}

/// Errors raised by the host stack
///
/// State-precondition variants (`NotActive`, `NotClaimed`, `NotOpen`,
/// `Disconnected`) are returned synchronously before a request is queued;
/// everything else is recorded on the request that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// A native driver call failed
    #[error("platform error {code}: {message}")]
    Platform { code: i32, message: String },

    /// Fewer bytes moved than requested and short packets were not accepted
    #[error("short packet: expected {expected} bytes, transferred {actual}")]
    ShortPacket { expected: usize, actual: usize },

    /// Request discarded or interrupted by an abort
    #[error("request aborted")]
    Aborted,

    #[error("interface is not claimed")]
    NotClaimed,

    #[error("configuration or interface is not active")]
    NotActive,

    #[error("pipe is not open")]
    NotOpen,

    /// The device is no longer part of the topology
    #[error("device is disconnected")]
    Disconnected,

    /// Native lookup by id failed
    #[error("device not found")]
    DeviceNotFound,

    #[error("{0} transfers are not implemented")]
    UnsupportedTransferType(TransferType),

    /// Transfer attempted against the synthetic root hub
    #[error("operation not supported on the virtual root hub")]
    VirtualDevice,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl UsbError {
    pub fn platform(code: i32, message: impl Into<String>) -> Self {
        UsbError::Platform {
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::platform(code::TIMEOUT, "transfer timed out")
    }

    /// True for a native timeout, which IN transfers retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, UsbError::Platform { code: c, .. } if *c == code::TIMEOUT)
    }
}

/// Type alias for host stack results
pub type Result<T> = std::result::Result<T, UsbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UsbError::ShortPacket {
            expected: 64,
            actual: 13,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("short packet"));
        assert!(msg.contains("64"));
        assert!(msg.contains("13"));

        let err = UsbError::UnsupportedTransferType(TransferType::Isochronous);
        assert_eq!(err.to_string(), "isochronous transfers are not implemented");
    }

    #[test]
    fn test_timeout_detection() {
        assert!(UsbError::timeout().is_timeout());
        assert!(!UsbError::platform(code::PIPE, "stall").is_timeout());
        assert!(!UsbError::Aborted.is_timeout());
    }
}
