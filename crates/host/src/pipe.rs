//! Interfaces and pipes
//!
//! An [`Interface`] is obtained from a configured [`DeviceNode`] and must be
//! claimed before any of its [`Pipe`]s can be opened. Every pipe owns one
//! [`TransferQueue`], so requests on one endpoint run strictly in order while
//! different endpoints proceed independently.

use crate::lock;
use crate::topology::DeviceNode;
use crate::transfer::{Irp, TransferQueue};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};
use usb_types::{EndpointDescriptor, InterfaceDescriptor, Result, UsbError};

/// One interface of a device's active configuration
#[derive(Debug, Clone)]
pub struct Interface {
    device: Arc<DeviceNode>,
    descriptor: InterfaceDescriptor,
}

impl Interface {
    pub(crate) fn new(device: Arc<DeviceNode>, descriptor: InterfaceDescriptor) -> Self {
        Self { device, descriptor }
    }

    pub fn number(&self) -> u8 {
        self.descriptor.interface_number
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn device(&self) -> &Arc<DeviceNode> {
        &self.device
    }

    pub fn is_claimed(&self) -> bool {
        self.device.is_interface_claimed(self.number())
    }

    /// Claim the interface for exclusive use by this host
    pub fn claim(&self) -> Result<()> {
        let number = self.number();
        if !self.device.is_connected() {
            return Err(UsbError::Disconnected);
        }
        self.device.check_interface_active(number)?;

        let mut claimed = lock(&self.device.claimed);
        if claimed.contains(&number) {
            return Err(UsbError::InvalidRequest(format!(
                "interface {} is already claimed",
                number
            )));
        }

        self.device.native_handle()?.claim_interface(number)?;
        claimed.insert(number);
        info!("Claimed interface {} on {}", number, self.device.id());
        Ok(())
    }

    /// Release a claimed interface; all of its pipes must be closed
    pub fn release(&self) -> Result<()> {
        let number = self.number();
        let mut claimed = lock(&self.device.claimed);
        if !claimed.contains(&number) {
            return Err(UsbError::NotClaimed);
        }

        let open_pipe = lock(&self.device.pipes)
            .values()
            .any(|pipe| pipe.interface_number == number && pipe.is_open());
        if open_pipe {
            return Err(UsbError::InvalidRequest(format!(
                "interface {} still has open pipes",
                number
            )));
        }

        // A vanished device has nothing left to release natively
        if self.device.is_connected() {
            self.device.native_handle()?.release_interface(number)?;
        }
        claimed.remove(&number);
        info!("Released interface {} on {}", number, self.device.id());
        Ok(())
    }

    /// Pipe for endpoint `address`; repeated calls return the same pipe
    pub fn pipe(&self, address: u8) -> Result<Arc<Pipe>> {
        let endpoint = *self.descriptor.endpoint(address).ok_or_else(|| {
            UsbError::InvalidRequest(format!(
                "no endpoint {:#04x} on interface {}",
                address,
                self.number()
            ))
        })?;

        let mut pipes = lock(&self.device.pipes);
        let pipe = pipes.entry(address).or_insert_with(|| {
            Arc::new(Pipe::new(
                Arc::downgrade(&self.device),
                self.number(),
                endpoint,
            ))
        });
        Ok(pipe.clone())
    }

    /// Pipes for every endpoint of the interface
    pub fn pipes(&self) -> Result<Vec<Arc<Pipe>>> {
        self.descriptor
            .endpoints
            .iter()
            .map(|endpoint| self.pipe(endpoint.address))
            .collect()
    }
}

#[derive(Default)]
struct PipeState {
    open: bool,
    queue: Option<TransferQueue>,
}

/// Channel to one endpoint of a claimed interface
pub struct Pipe {
    device: Weak<DeviceNode>,
    interface_number: u8,
    endpoint: EndpointDescriptor,
    state: Mutex<PipeState>,
}

impl Pipe {
    fn new(device: Weak<DeviceNode>, interface_number: u8, endpoint: EndpointDescriptor) -> Self {
        Self {
            device,
            interface_number,
            endpoint,
            state: Mutex::new(PipeState::default()),
        }
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// True while requests are queued or in flight
    pub fn is_busy(&self) -> bool {
        lock(&self.state)
            .queue
            .as_ref()
            .is_some_and(TransferQueue::is_busy)
    }

    /// Connected device owning this pipe, with its interface active and claimed
    fn usable_device(&self) -> Result<Arc<DeviceNode>> {
        let device = self
            .device
            .upgrade()
            .filter(|device| device.is_connected())
            .ok_or(UsbError::Disconnected)?;
        device.check_interface_active(self.interface_number)?;
        if !device.is_interface_claimed(self.interface_number) {
            return Err(UsbError::NotClaimed);
        }
        Ok(device)
    }

    pub fn open(&self) -> Result<()> {
        let device = self.usable_device()?;

        let mut state = lock(&self.state);
        if state.open {
            return Err(UsbError::InvalidRequest(format!(
                "pipe {:#04x} is already open",
                self.endpoint.address
            )));
        }
        if state.queue.is_none() {
            let handle = device.native_handle()?;
            state.queue = Some(device.transfer_queue(self.endpoint, handle));
        }
        state.open = true;
        debug!("Opened pipe {:#04x} on {}", self.endpoint.address, device.id());
        Ok(())
    }

    /// Close an idle pipe
    pub fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(UsbError::NotOpen);
        }
        if state.queue.as_ref().is_some_and(TransferQueue::is_busy) {
            return Err(UsbError::InvalidRequest(format!(
                "pipe {:#04x} has requests in flight",
                self.endpoint.address
            )));
        }
        state.open = false;
        Ok(())
    }

    /// Queue `irp` on this pipe
    ///
    /// Preconditions are checked in order: device connected, interface
    /// active, interface claimed, pipe open, request window valid.
    pub fn submit(&self, irp: Arc<Irp>) -> Result<()> {
        self.usable_device()?;

        // Held across enqueue so close() cannot pass its idle check in between
        let state = lock(&self.state);
        let queue = match (&state.queue, state.open) {
            (Some(queue), true) => queue,
            _ => return Err(UsbError::NotOpen),
        };
        irp.validate()?;

        queue.enqueue(irp)
    }

    /// Queue `irp` and block until it completes
    pub fn sync_submit(&self, irp: Arc<Irp>) -> Result<()> {
        self.submit(irp.clone())?;
        irp.wait_for_result()
    }

    /// Discard queued requests and wait for the one in flight
    pub fn abort_all_submissions(&self) -> Result<()> {
        let queue = {
            let state = lock(&self.state);
            match (&state.queue, state.open) {
                (Some(queue), true) => queue.clone(),
                _ => return Err(UsbError::NotOpen),
            }
        };
        queue.abort();
        Ok(())
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("interface_number", &self.interface_number)
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}
