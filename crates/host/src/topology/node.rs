//! Modelled devices
//!
//! A [`DeviceNode`] is created by the synchronizer for every native device it
//! discovers. Hubs are the same record with a [`NodeKind::Hub`] tag carrying
//! their [`PortSet`]. Nodes also own the device-level I/O state: the lazily
//! opened native handle, the default control pipe's queue, claimed
//! interfaces and the pipe registry.

use super::port::{PortRef, PortSet};
use crate::device_id::DeviceId;
use crate::events::{EventRegistry, TransferSource};
use crate::lock;
use crate::native::{NativeDriver, NativeHandle, RawDevice};
use crate::pipe::{Interface, Pipe};
use crate::transfer::{Irp, TransferDispatcher, TransferQueue};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use usb_types::{
    ConfigurationDescriptor, DeviceSpeed, EndpointDescriptor, Result, UsbError,
};

/// Initial port count of a device hub; grows on demand
const HUB_INITIAL_PORTS: u32 = 1;

/// Collaborators every node needs to perform I/O
pub(crate) struct IoContext {
    pub(crate) driver: Arc<dyn NativeDriver>,
    pub(crate) dispatcher: TransferDispatcher,
    pub(crate) events: Arc<EventRegistry>,
}

/// What kind of device a node models
#[derive(Debug)]
pub enum NodeKind {
    Device,
    Hub(PortSet),
}

/// A device in the topology tree
pub struct DeviceNode {
    id: DeviceId,
    parent_id: Option<DeviceId>,
    raw: RawDevice,
    speed: DeviceSpeed,
    configurations: Vec<ConfigurationDescriptor>,
    active_config: u8,
    kind: NodeKind,
    port: Mutex<Option<PortRef>>,
    pub(crate) io: Arc<IoContext>,
    handle: Mutex<Option<Arc<dyn NativeHandle>>>,
    control: Mutex<Option<TransferQueue>>,
    pub(crate) claimed: Mutex<HashSet<u8>>,
    pub(crate) pipes: Mutex<HashMap<u8, Arc<Pipe>>>,
}

impl DeviceNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DeviceId,
        parent_id: Option<DeviceId>,
        raw: RawDevice,
        speed: DeviceSpeed,
        configurations: Vec<ConfigurationDescriptor>,
        active_config: u8,
        io: Arc<IoContext>,
    ) -> Self {
        let kind = if id.is_hub() {
            NodeKind::Hub(PortSet::new(HUB_INITIAL_PORTS))
        } else {
            NodeKind::Device
        };

        Self {
            id,
            parent_id,
            raw,
            speed,
            configurations,
            active_config,
            kind,
            port: Mutex::new(None),
            io,
            handle: Mutex::new(None),
            control: Mutex::new(None),
            claimed: Mutex::new(HashSet::new()),
            pipes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Upstream hub; `None` for devices on the root hub
    pub fn parent_id(&self) -> Option<&DeviceId> {
        self.parent_id.as_ref()
    }

    pub fn raw(&self) -> &RawDevice {
        &self.raw
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn configurations(&self) -> &[ConfigurationDescriptor] {
        &self.configurations
    }

    /// bConfigurationValue of the active configuration, 0 if unconfigured
    pub fn active_configuration_number(&self) -> u8 {
        self.active_config
    }

    pub fn active_configuration(&self) -> Option<&ConfigurationDescriptor> {
        if self.active_config == 0 {
            return None;
        }
        self.configurations
            .iter()
            .find(|c| c.configuration_value == self.active_config)
    }

    pub fn is_configured(&self) -> bool {
        self.active_configuration().is_some()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.kind, NodeKind::Hub(_))
    }

    /// Port set of a hub, `None` for plain devices
    pub fn ports(&self) -> Option<&PortSet> {
        match &self.kind {
            NodeKind::Hub(ports) => Some(ports),
            NodeKind::Device => None,
        }
    }

    /// Port this device occupies, `None` once detached
    pub fn port(&self) -> Option<PortRef> {
        lock(&self.port).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.port).is_some()
    }

    /// Record the port this node was connected to; only the first call sticks
    pub(crate) fn set_port(&self, port: PortRef) -> bool {
        let mut slot = lock(&self.port);
        if slot.is_some() {
            warn!("Device {} is already attached, ignoring {:?}", self.id, port);
            return false;
        }
        *slot = Some(port);
        true
    }

    pub(crate) fn clear_port(&self) -> Option<PortRef> {
        lock(&self.port).take()
    }

    /// Open the native handle on first use
    pub(crate) fn native_handle(&self) -> Result<Arc<dyn NativeHandle>> {
        if !self.is_connected() {
            return Err(UsbError::Disconnected);
        }

        let mut handle = lock(&self.handle);
        if let Some(handle) = handle.as_ref() {
            return Ok(handle.clone());
        }

        let opened = self.io.driver.open(&self.raw)?;
        debug!("Opened native handle for {}", self.id);
        *handle = Some(opened.clone());
        Ok(opened)
    }

    /// Build a queue that dispatches to `endpoint` and reports to the registry
    pub(crate) fn transfer_queue(
        &self,
        endpoint: EndpointDescriptor,
        handle: Arc<dyn NativeHandle>,
    ) -> TransferQueue {
        let dispatcher = self.io.dispatcher;
        let events = self.io.events.clone();
        let source = TransferSource {
            device: self.id.clone(),
            endpoint: endpoint.address,
        };

        TransferQueue::new(
            format!("{}-ep{:02x}", self.id.bus_address(), endpoint.address),
            move |irp: &Irp, abort| dispatcher.dispatch(handle.as_ref(), &endpoint, irp, abort),
            move |irp: &Arc<Irp>| events.notify_transfer(&source, irp),
        )
    }

    fn control_queue(&self) -> Result<TransferQueue> {
        let mut control = lock(&self.control);
        if let Some(queue) = control.as_ref() {
            return Ok(queue.clone());
        }

        let handle = self.native_handle()?;
        let endpoint = EndpointDescriptor::default_control(self.id.descriptor().max_packet_size_0);
        let queue = self.transfer_queue(endpoint, handle);
        *control = Some(queue.clone());
        Ok(queue)
    }

    /// Queue a control request on the default control pipe
    pub fn submit_control(&self, irp: Arc<Irp>) -> Result<()> {
        if !self.is_connected() {
            return Err(UsbError::Disconnected);
        }
        if irp.setup().is_none() {
            return Err(UsbError::InvalidRequest(
                "control request without setup packet".to_string(),
            ));
        }
        irp.validate()?;

        self.control_queue()?.enqueue(irp)
    }

    /// Queue a control request and wait for its outcome
    pub fn sync_control(&self, irp: Arc<Irp>) -> Result<()> {
        self.submit_control(irp.clone())?;
        irp.wait_for_result()
    }

    /// Abort every queued control request
    pub fn abort_control(&self) {
        let queue = lock(&self.control).clone();
        if let Some(queue) = queue {
            queue.abort();
        }
    }

    /// Fail with `NotActive` unless `interface` belongs to the active configuration
    pub(crate) fn check_interface_active(&self, interface: u8) -> Result<()> {
        match self.active_configuration() {
            Some(config) if config.interface(interface).is_some() => Ok(()),
            _ => Err(UsbError::NotActive),
        }
    }

    pub fn is_interface_claimed(&self, interface: u8) -> bool {
        lock(&self.claimed).contains(&interface)
    }

    /// Interface `number` of the active configuration
    pub fn interface(self: &Arc<Self>, number: u8) -> Result<Interface> {
        let descriptor = self
            .active_configuration()
            .and_then(|config| config.interface(number))
            .cloned()
            .ok_or(UsbError::NotActive)?;
        Ok(Interface::new(self.clone(), descriptor))
    }
}

impl fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceNode")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("speed", &self.speed)
            .field("active_config", &self.active_config)
            .field("kind", &self.kind)
            .field("port", &self.port())
            .finish()
    }
}
