//! Device identity
//!
//! A [`DeviceId`] is created the first time a scan sees a native device and
//! is never mutated afterwards. Two ids are equal when they name the same bus
//! and address; the port number and descriptor ride along as information.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use usb_types::DeviceDescriptor;

/// Bus + address key, the part of a [`DeviceId`] that defines identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    pub bus: u32,
    pub address: u32,
}

impl BusAddress {
    pub fn new(bus: u32, address: u32) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Identity of a native device: (bus, address, port) plus its descriptor
#[derive(Debug, Clone)]
pub struct DeviceId {
    key: BusAddress,
    port: u32,
    descriptor: DeviceDescriptor,
}

impl DeviceId {
    pub fn new(bus: u32, address: u32, port: u32, descriptor: DeviceDescriptor) -> Self {
        Self {
            key: BusAddress::new(bus, address),
            port,
            descriptor,
        }
    }

    pub fn bus(&self) -> u32 {
        self.key.bus
    }

    pub fn address(&self) -> u32 {
        self.key.address
    }

    /// Physical port on the parent hub, as reported by the driver
    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn bus_address(&self) -> BusAddress {
        self.key
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn is_hub(&self) -> bool {
        self.descriptor.is_hub()
    }
}

impl PartialEq for DeviceId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DeviceId {}

// Must hash exactly like BusAddress for the Borrow impl below.
impl Hash for DeviceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Borrow<BusAddress> for DeviceId {
    fn borrow(&self) -> &BusAddress {
        &self.key
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}]",
            self.key, self.descriptor.vendor_id, self.descriptor.product_id
        )
    }
}
