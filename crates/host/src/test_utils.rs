//! Test utilities for usb-host
//!
//! Provides a scriptable in-memory native driver and descriptor builders for
//! exercising the topology and transfer engines without hardware.
//!
//! # Example
//!
//! ```
//! use host::test_utils::{MockDevice, MockDriver};
//!
//! let driver = MockDriver::new();
//! driver.insert(MockDevice::hub(1, 1, 0));
//! driver.insert(MockDevice::new(1, 2, 1, 0x1234, 0x5678).parent(1, 1));
//! assert_eq!(driver.device_count(), 2);
//! ```

use crate::lock;
use crate::native::{NativeDriver, NativeHandle, RawDevice};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use usb_types::{
    CLASS_HUB, ConfigurationDescriptor, DIRECTION_MASK, DeviceDescriptor, DeviceSpeed,
    EndpointDescriptor, InterfaceDescriptor, Result, SetupPacket, TransferType, UsbError,
};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Device descriptor with the given ids and class, 64-byte control pipe
pub fn device_descriptor(vendor_id: u16, product_id: u16, class_code: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: 0x0200,
        class_code,
        sub_class_code: 0,
        protocol_code: 0,
        max_packet_size_0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_string_index: None,
        product_string_index: None,
        serial_number_string_index: None,
        num_configurations: 1,
    }
}

pub fn endpoint(address: u8, transfer_type: TransferType, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        transfer_type,
        max_packet_size,
        interval: 0,
    }
}

/// Alternate setting 0 of interface `number`
pub fn interface(number: u8, endpoints: Vec<EndpointDescriptor>) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number: number,
        alternate_setting: 0,
        class_code: 0xff,
        sub_class_code: 0,
        protocol_code: 0,
        endpoints,
    }
}

pub fn configuration(value: u8, interfaces: Vec<InterfaceDescriptor>) -> ConfigurationDescriptor {
    ConfigurationDescriptor {
        configuration_value: value,
        attributes: 0x80,
        max_power_ma: 100,
        interfaces,
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// A device known to [`MockDriver`]
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub raw: RawDevice,
    pub parent: Option<RawDevice>,
    pub descriptor: DeviceDescriptor,
    pub speed: DeviceSpeed,
    pub configurations: Vec<ConfigurationDescriptor>,
    pub active_configuration: u8,
    /// Descriptor reads fail while set
    pub unreadable: bool,
}

impl MockDevice {
    pub fn new(bus: u8, address: u8, port: u8, vendor_id: u16, product_id: u16) -> Self {
        Self {
            raw: RawDevice::new(bus, address, port),
            parent: None,
            descriptor: device_descriptor(vendor_id, product_id, 0),
            speed: DeviceSpeed::High,
            configurations: Vec::new(),
            active_configuration: 0,
            unreadable: false,
        }
    }

    pub fn hub(bus: u8, address: u8, port: u8) -> Self {
        let mut device = Self::new(bus, address, port, 0x1d6b, 0x0002);
        device.descriptor.class_code = CLASS_HUB;
        device
    }

    pub fn parent(mut self, bus: u8, address: u8) -> Self {
        self.parent = Some(RawDevice::new(bus, address, 0));
        self
    }

    /// Add `config` and make it the active configuration
    pub fn configured(mut self, config: ConfigurationDescriptor) -> Self {
        self.active_configuration = config.configuration_value;
        self.configurations.push(config);
        self
    }

    pub fn max_packet_size_0(mut self, size: u8) -> Self {
        self.descriptor.max_packet_size_0 = size;
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.unreadable = true;
        self
    }
}

#[derive(Default)]
struct DriverState {
    devices: Vec<MockDevice>,
    handles: HashMap<(u8, u8), Arc<MockHandle>>,
    list_error: Option<UsbError>,
    opened: usize,
}

/// In-memory [`NativeDriver`]
///
/// Devices are listed in insertion order. Each device gets one
/// [`MockHandle`], created on first access so tests can script it before the
/// host opens the device.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<DriverState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device
    pub fn insert(&self, device: MockDevice) {
        let mut state = lock(&self.state);
        let key = (device.raw.bus, device.raw.address);
        state
            .devices
            .retain(|d| (d.raw.bus, d.raw.address) != key);
        state.devices.push(device);
    }

    /// Remove a device; returns false if it was not present
    pub fn remove(&self, bus: u8, address: u8) -> bool {
        let mut state = lock(&self.state);
        let before = state.devices.len();
        state
            .devices
            .retain(|d| (d.raw.bus, d.raw.address) != (bus, address));
        state.devices.len() != before
    }

    pub fn set_unreadable(&self, bus: u8, address: u8, unreadable: bool) {
        let mut state = lock(&self.state);
        for device in state
            .devices
            .iter_mut()
            .filter(|d| (d.raw.bus, d.raw.address) == (bus, address))
        {
            device.unreadable = unreadable;
        }
    }

    /// Make `list_devices` fail until cleared with `None`
    pub fn fail_listing(&self, error: Option<UsbError>) {
        lock(&self.state).list_error = error;
    }

    pub fn device_count(&self) -> usize {
        lock(&self.state).devices.len()
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        lock(&self.state).opened
    }

    /// The handle `open` returns for this device
    pub fn handle(&self, bus: u8, address: u8) -> Arc<MockHandle> {
        lock(&self.state)
            .handles
            .entry((bus, address))
            .or_insert_with(|| Arc::new(MockHandle::new()))
            .clone()
    }

    fn find(&self, raw: &RawDevice) -> Result<MockDevice> {
        lock(&self.state)
            .devices
            .iter()
            .find(|d| (d.raw.bus, d.raw.address) == (raw.bus, raw.address))
            .cloned()
            .ok_or(UsbError::DeviceNotFound)
    }
}

impl NativeDriver for MockDriver {
    fn list_devices(&self) -> Result<Vec<RawDevice>> {
        let state = lock(&self.state);
        if let Some(e) = &state.list_error {
            return Err(e.clone());
        }
        Ok(state.devices.iter().map(|d| d.raw).collect())
    }

    fn parent(&self, device: &RawDevice) -> Option<RawDevice> {
        self.find(device).ok()?.parent
    }

    fn device_descriptor(&self, device: &RawDevice) -> Result<DeviceDescriptor> {
        let device = self.find(device)?;
        if device.unreadable {
            return Err(UsbError::platform(
                usb_types::error::code::IO,
                "descriptor read failed",
            ));
        }
        Ok(device.descriptor)
    }

    fn speed(&self, device: &RawDevice) -> DeviceSpeed {
        self.find(device)
            .map(|d| d.speed)
            .unwrap_or(DeviceSpeed::Unknown)
    }

    fn configurations(&self, device: &RawDevice) -> Result<Vec<ConfigurationDescriptor>> {
        Ok(self.find(device)?.configurations)
    }

    fn active_configuration(&self, device: &RawDevice) -> Result<u8> {
        Ok(self.find(device)?.active_configuration)
    }

    fn open(&self, device: &RawDevice) -> Result<Arc<dyn NativeHandle>> {
        self.find(device)?;
        let handle = self.handle(device.bus, device.address);
        lock(&self.state).opened += 1;
        Ok(handle)
    }
}

/// Scripted outcome of one native transfer call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Move this many bytes (capped at the chunk size)
    Transfer(usize),
    /// Return these bytes on an IN call
    Data(Vec<u8>),
    /// Fail with a native timeout after a short delay
    Timeout,
    Error(UsbError),
}

/// One native call seen by [`MockHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub requested: usize,
    pub setup: Option<SetupPacket>,
    /// Bytes handed to an OUT call
    pub written: Vec<u8>,
}

#[derive(Default)]
struct HandleState {
    scripted: HashMap<u8, VecDeque<MockResponse>>,
    fallback: HashMap<u8, MockResponse>,
    calls: Vec<MockCall>,
    claimed: HashSet<u8>,
    held: bool,
    in_flight: usize,
}

/// Opened mock device
///
/// Unscripted calls move the full chunk; IN calls fill the buffer with its
/// index pattern (`0, 1, 2, ...`). While [`MockHandle::hold`] is in effect
/// every transfer call blocks until [`MockHandle::release`].
#[derive(Default)]
pub struct MockHandle {
    state: Mutex<HandleState>,
    gate: Condvar,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for the next calls on `endpoint` (0x00 for control)
    pub fn script(&self, endpoint: u8, responses: impl IntoIterator<Item = MockResponse>) {
        lock(&self.state)
            .scripted
            .entry(endpoint)
            .or_default()
            .extend(responses);
    }

    /// Response used once the script for `endpoint` runs out
    pub fn set_fallback(&self, endpoint: u8, response: MockResponse) {
        lock(&self.state).fallback.insert(endpoint, response);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_on(&self, endpoint: u8) -> Vec<MockCall> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        lock(&self.state).claimed.contains(&interface)
    }

    /// Block every subsequent transfer call until [`MockHandle::release`]
    pub fn hold(&self) {
        lock(&self.state).held = true;
    }

    pub fn release(&self) {
        lock(&self.state).held = false;
        self.gate.notify_all();
    }

    /// Calls currently blocked by [`MockHandle::hold`]
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight
    }

    fn transfer(
        &self,
        endpoint: u8,
        transfer_type: TransferType,
        setup: Option<&SetupPacket>,
        data: &mut [u8],
    ) -> Result<usize> {
        let is_in = match setup {
            Some(setup) => setup.request_type & DIRECTION_MASK != 0,
            None => endpoint & DIRECTION_MASK != 0,
        };

        let response = {
            let mut state = lock(&self.state);
            state.in_flight += 1;
            while state.held {
                state = self
                    .gate
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.in_flight -= 1;

            state.calls.push(MockCall {
                endpoint,
                transfer_type,
                requested: data.len(),
                setup: setup.copied(),
                written: if is_in { Vec::new() } else { data.to_vec() },
            });
            let scripted = state
                .scripted
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front);
            scripted.or_else(|| state.fallback.get(&endpoint).cloned())
        };

        match response.unwrap_or(MockResponse::Transfer(data.len())) {
            MockResponse::Transfer(n) => {
                let n = n.min(data.len());
                if is_in {
                    for (i, byte) in data[..n].iter_mut().enumerate() {
                        *byte = i as u8;
                    }
                }
                Ok(n)
            }
            MockResponse::Data(bytes) => {
                let n = bytes.len().min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            MockResponse::Timeout => {
                thread::sleep(Duration::from_millis(1));
                Err(UsbError::timeout())
            }
            MockResponse::Error(e) => Err(e),
        }
    }
}

impl NativeHandle for MockHandle {
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        self.transfer(0x00, TransferType::Control, Some(setup), data)
    }

    fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], _timeout: Duration) -> Result<usize> {
        self.transfer(endpoint, TransferType::Bulk, None, data)
    }

    fn interrupt_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        self.transfer(endpoint, TransferType::Interrupt, None, data)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        lock(&self.state).claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        lock(&self.state).claimed.remove(&interface);
        Ok(())
    }
}
