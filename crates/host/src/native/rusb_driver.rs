//! libusb-backed native driver
//!
//! Wraps a `rusb::Context`. Device objects returned by the last enumeration
//! are cached by (bus, address) so parent and descriptor lookups made during
//! a scan do not re-enumerate the bus.

use super::{NativeDriver, NativeHandle, RawDevice};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};
use usb_types::error::code;
use usb_types::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceSpeed, Direction, EndpointDescriptor,
    InterfaceDescriptor, Result, SetupPacket, TransferType, UsbError,
};

/// Native driver backed by libusb through `rusb`
pub struct RusbDriver {
    context: Context,
    devices: Mutex<HashMap<(u8, u8), Device<Context>>>,
}

impl RusbDriver {
    /// Create a driver with its own libusb context
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a raw device to the rusb device, re-enumerating on a cache miss
    fn lookup(&self, raw: &RawDevice) -> Result<Device<Context>> {
        let key = (raw.bus, raw.address);
        let mut cache = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = cache.get(&key) {
            return Ok(device.clone());
        }

        trace!(
            "Device cache miss for bus={}, addr={}, re-enumerating",
            raw.bus, raw.address
        );
        let list = self.context.devices().map_err(map_rusb_error)?;
        for device in list.iter() {
            cache.insert((device.bus_number(), device.address()), device);
        }
        cache.get(&key).cloned().ok_or(UsbError::DeviceNotFound)
    }
}

impl NativeDriver for RusbDriver {
    fn list_devices(&self) -> Result<Vec<RawDevice>> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut cache = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        cache.clear();

        let mut raw = Vec::with_capacity(list.len());
        for device in list.iter() {
            raw.push(raw_device(&device));
            cache.insert((device.bus_number(), device.address()), device);
        }

        trace!("libusb reported {} devices", raw.len());
        Ok(raw)
    }

    fn parent(&self, device: &RawDevice) -> Option<RawDevice> {
        let device = self.lookup(device).ok()?;
        device.get_parent().map(|parent| raw_device(&parent))
    }

    fn device_descriptor(&self, device: &RawDevice) -> Result<DeviceDescriptor> {
        let desc = self
            .lookup(device)?
            .device_descriptor()
            .map_err(map_rusb_error)?;
        Ok(map_device_descriptor(&desc))
    }

    fn speed(&self, device: &RawDevice) -> DeviceSpeed {
        self.lookup(device)
            .map(|d| map_device_speed(d.speed()))
            .unwrap_or_default()
    }

    fn configurations(&self, device: &RawDevice) -> Result<Vec<ConfigurationDescriptor>> {
        let device = self.lookup(device)?;
        let desc = device.device_descriptor().map_err(map_rusb_error)?;

        let mut configs = Vec::with_capacity(usize::from(desc.num_configurations()));
        for index in 0..desc.num_configurations() {
            match device.config_descriptor(index) {
                Ok(config) => configs.push(map_config_descriptor(&config)),
                Err(e) => warn!(
                    "Failed to read configuration {} of bus={}, addr={}: {}",
                    index,
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(configs)
    }

    fn active_configuration(&self, device: &RawDevice) -> Result<u8> {
        match self.lookup(device)?.active_config_descriptor() {
            Ok(config) => Ok(config.number()),
            // libusb reports an unconfigured device as NOT_FOUND
            Err(rusb::Error::NotFound) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn open(&self, device: &RawDevice) -> Result<Arc<dyn NativeHandle>> {
        let usb_device = self.lookup(device)?;
        let handle = usb_device.open().map_err(|e| {
            warn!(
                "Failed to open device bus={}, addr={}: {}",
                device.bus, device.address, e
            );
            match e {
                rusb::Error::NotFound | rusb::Error::NoDevice => UsbError::DeviceNotFound,
                _ => map_rusb_error(e),
            }
        })?;

        debug!("Opened device bus={}, addr={}", device.bus, device.address);
        Ok(Arc::new(RusbHandle {
            handle,
            raw: *device,
        }))
    }
}

/// An opened libusb device handle
struct RusbHandle {
    handle: DeviceHandle<Context>,
    raw: RawDevice,
}

impl NativeHandle for RusbHandle {
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let result = match setup.direction() {
            Direction::In => self.handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
            Direction::Out => self.handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            ),
        };
        result.map_err(map_rusb_error)
    }

    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let result = match Direction::from_bit(endpoint) {
            Direction::In => self.handle.read_bulk(endpoint, data, timeout),
            Direction::Out => self.handle.write_bulk(endpoint, data, timeout),
        };
        result.map_err(map_rusb_error)
    }

    fn interrupt_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let result = match Direction::from_bit(endpoint) {
            Direction::In => self.handle.read_interrupt(endpoint, data, timeout),
            Direction::Out => self.handle.write_interrupt(endpoint, data, timeout),
        };
        result.map_err(map_rusb_error)
    }

    /// Claim an interface, detaching any kernel driver bound to it first
    fn claim_interface(&self, interface: u8) -> Result<()> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on bus={}, addr={}",
                    interface, self.raw.bus, self.raw.address
                );
                if let Err(e) = self.handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)?;
        debug!(
            "Claimed interface {} on bus={}, addr={}",
            interface, self.raw.bus, self.raw.address
        );
        Ok(())
    }

    /// Release an interface and hand it back to the kernel
    fn release_interface(&self, interface: u8) -> Result<()> {
        self.handle
            .release_interface(interface)
            .map_err(map_rusb_error)?;

        if let Err(e) = self.handle.attach_kernel_driver(interface) {
            debug!(
                "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                interface, e
            );
        }
        debug!(
            "Released interface {} on bus={}, addr={}",
            interface, self.raw.bus, self.raw.address
        );
        Ok(())
    }
}

fn raw_device(device: &Device<Context>) -> RawDevice {
    RawDevice::new(device.bus_number(), device.address(), device.port_number())
}

/// Map rusb::Error to a platform error with its libusb code
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    let code = match err {
        rusb::Error::Io => code::IO,
        rusb::Error::InvalidParam => code::INVALID_PARAM,
        rusb::Error::Access => code::ACCESS,
        rusb::Error::NoDevice => code::NO_DEVICE,
        rusb::Error::NotFound => code::NOT_FOUND,
        rusb::Error::Busy => code::BUSY,
        rusb::Error::Timeout => code::TIMEOUT,
        rusb::Error::Overflow => code::OVERFLOW,
        rusb::Error::Pipe => code::PIPE,
        rusb::Error::Interrupted => code::INTERRUPTED,
        rusb::Error::NoMem => code::NO_MEM,
        rusb::Error::NotSupported => code::NOT_SUPPORTED,
        _ => code::OTHER,
    };
    UsbError::platform(code, err.to_string())
}

/// Map rusb device speed to DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> TransferType {
    match transfer_type {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

/// Re-encode a decoded version as BCD (bcdUSB / bcdDevice)
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0F) << 4)
        | u16::from(version.sub_minor() & 0x0F)
}

fn map_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: version_to_bcd(desc.usb_version()),
        class_code: desc.class_code(),
        sub_class_code: desc.sub_class_code(),
        protocol_code: desc.protocol_code(),
        max_packet_size_0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: version_to_bcd(desc.device_version()),
        manufacturer_string_index: desc.manufacturer_string_index(),
        product_string_index: desc.product_string_index(),
        serial_number_string_index: desc.serial_number_string_index(),
        num_configurations: desc.num_configurations(),
    }
}

fn map_config_descriptor(config: &rusb::ConfigDescriptor) -> ConfigurationDescriptor {
    let mut attributes = 0x80;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    let interfaces = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .map(|alt| InterfaceDescriptor {
            interface_number: alt.interface_number(),
            alternate_setting: alt.setting_number(),
            class_code: alt.class_code(),
            sub_class_code: alt.sub_class_code(),
            protocol_code: alt.protocol_code(),
            endpoints: alt
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    transfer_type: map_transfer_type(ep.transfer_type()),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                })
                .collect(),
        })
        .collect();

    ConfigurationDescriptor {
        configuration_value: config.number(),
        attributes,
        max_power_ma: config.max_power(),
        interfaces,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert!(map_rusb_error(rusb::Error::Timeout).is_timeout());
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe),
            UsbError::Platform { code: code::PIPE, .. }
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::NoDevice),
            UsbError::Platform {
                code: code::NO_DEVICE,
                ..
            }
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Other),
            UsbError::Platform { code: code::OTHER, .. }
        ));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), DeviceSpeed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 0, 0)), 0x0200);
        assert_eq!(version_to_bcd(rusb::Version(1, 1, 0)), 0x0110);
        assert_eq!(version_to_bcd(rusb::Version(3, 2, 0)), 0x0320);
        assert_eq!(version_to_bcd(rusb::Version(12, 3, 4)), 0x1234);
    }
}
