//! Native driver boundary
//!
//! The host stack never talks to a host-controller driver directly. Everything
//! it needs (enumeration, parent lookup, descriptors, opening a device and
//! blocking transfers) goes through [`NativeDriver`] and [`NativeHandle`], so
//! the topology and transfer engines can run against `rusb` in production and
//! against the mock driver in `test_utils` in tests.

pub mod rusb_driver;

use std::sync::Arc;
use std::time::Duration;
use usb_types::{ConfigurationDescriptor, DeviceDescriptor, DeviceSpeed, Result, SetupPacket};

pub use rusb_driver::RusbDriver;

/// Raw device handle as reported by the driver's device list
///
/// Only the location triple is carried; drivers resolve it back to their own
/// device objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDevice {
    pub bus: u8,
    pub address: u8,
    /// Port number on the parent hub (0 for host-controller root hubs)
    pub port: u8,
}

impl RawDevice {
    pub fn new(bus: u8, address: u8, port: u8) -> Self {
        Self { bus, address, port }
    }
}

/// Enumeration side of a host-controller driver
pub trait NativeDriver: Send + Sync {
    /// Every device the driver currently sees, hubs included
    fn list_devices(&self) -> Result<Vec<RawDevice>>;

    /// Upstream hub of `device`, `None` for host-controller root hubs
    fn parent(&self, device: &RawDevice) -> Option<RawDevice>;

    fn device_descriptor(&self, device: &RawDevice) -> Result<DeviceDescriptor>;

    fn speed(&self, device: &RawDevice) -> DeviceSpeed;

    fn configurations(&self, device: &RawDevice) -> Result<Vec<ConfigurationDescriptor>>;

    /// bConfigurationValue of the active configuration, 0 if unconfigured
    fn active_configuration(&self, device: &RawDevice) -> Result<u8>;

    fn open(&self, device: &RawDevice) -> Result<Arc<dyn NativeHandle>>;
}

/// An opened device
///
/// All transfer calls block for at most `timeout` and return the number of
/// bytes moved.
pub trait NativeHandle: Send + Sync {
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize>;

    fn interrupt_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration)
    -> Result<usize>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;
}
