//! Shared USB types for usb-host
//!
//! This crate defines the value types used on both sides of the native
//! driver boundary: descriptor records, speeds, transfer types, the control
//! SETUP packet and the [`UsbError`] taxonomy.
//!
//! # Example
//!
//! ```
//! use usb_types::{Direction, EndpointDescriptor, TransferType};
//!
//! let ep = EndpointDescriptor {
//!     address: 0x81,
//!     transfer_type: TransferType::Interrupt,
//!     max_packet_size: 8,
//!     interval: 10,
//! };
//! assert_eq!(ep.direction(), Direction::In);
//! assert_eq!(ep.number(), 1);
//! ```

pub mod descriptors;
pub mod error;
pub mod types;

pub use descriptors::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
pub use error::{Result, UsbError};
pub use types::{CLASS_HUB, DIRECTION_MASK, DeviceSpeed, Direction, SetupPacket, TransferType};
