//! USB transfer and device type definitions
//!
//! Small value types shared by the descriptor records, the native driver
//! boundary and the transfer engine.

use serde::{Deserialize, Serialize};

/// Device class code for hubs (bDeviceClass)
pub const CLASS_HUB: u8 = 0x09;

/// Direction bit in endpoint addresses and bmRequestType
pub const DIRECTION_MASK: u8 = 0x80;

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceSpeed {
    /// Speed not reported by the driver
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferType::Control => "control",
            TransferType::Isochronous => "isochronous",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// Data direction, seen from the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_bit(value: u8) -> Self {
        if value & DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The 8-byte SETUP stage of a control transfer, minus wLength
///
/// wLength is implied by the data window of the request carrying it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
        }
    }

    /// Direction of the data stage
    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.request_type)
    }
}
