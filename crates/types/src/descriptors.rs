//! Standard descriptor records
//!
//! Immutable, already-decoded views of the device, configuration, interface
//! and endpoint descriptors. Decoding raw bytes is left to the native driver;
//! these records only carry the fields the host stack reads.

use crate::types::{CLASS_HUB, Direction, TransferType};
use serde::{Deserialize, Serialize};

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    /// bDeviceClass
    pub class_code: u8,
    /// bDeviceSubClass
    pub sub_class_code: u8,
    /// bDeviceProtocol
    pub protocol_code: u8,
    /// bMaxPacketSize0 (default control pipe)
    pub max_packet_size_0: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    /// iManufacturer
    pub manufacturer_string_index: Option<u8>,
    /// iProduct
    pub product_string_index: Option<u8>,
    /// iSerialNumber
    pub serial_number_string_index: Option<u8>,
    /// bNumConfigurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Whether the device declares itself a hub
    pub fn is_hub(&self) -> bool {
        self.class_code == CLASS_HUB
    }
}

/// Standard configuration descriptor with its interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// bConfigurationValue
    pub configuration_value: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower, in milliamps
    pub max_power_ma: u16,
    /// Every alternate setting of every interface
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigurationDescriptor {
    /// Default alternate setting (0) of an interface
    pub fn interface(&self, number: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|iface| iface.interface_number == number && iface.alternate_setting == 0)
    }
}

/// Standard interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn endpoint(&self, address: u8) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }
}

/// Standard endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    pub transfer_type: TransferType,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    /// The default control endpoint of a device
    pub fn default_control(max_packet_size: u8) -> Self {
        Self {
            address: 0x00,
            transfer_type: TransferType::Control,
            max_packet_size: u16::from(max_packet_size),
            interval: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.address)
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
}
