//! Topology synchronization
//!
//! [`TopologySynchronizer::scan`] lists the native devices, creates nodes for
//! newly seen ones, detaches vanished devices (whole subtrees for vanished
//! hubs) and connects new nodes to their parent hub's ports.

use super::node::{DeviceNode, IoContext};
use super::port::{HubRef, PortRef, PortSet};
use super::root_hub::RootHub;
use crate::device_id::{BusAddress, DeviceId};
use crate::events::EventRegistry;
use crate::lock;
use crate::native::{NativeDriver, RawDevice};
use crate::transfer::TransferDispatcher;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, info, trace, warn};
use usb_types::{Result, UsbError};

/// Devices attached and detached by one scan, in notification order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub attached: Vec<DeviceId>,
    pub detached: Vec<DeviceId>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Keeps the device tree in step with the native driver
pub struct TopologySynchronizer {
    io: Arc<IoContext>,
    root: RootHub,
    devices: Mutex<HashMap<DeviceId, Arc<DeviceNode>>>,
    scan_lock: Mutex<()>,
    /// Thread currently running a scan
    scan_thread: Mutex<Option<ThreadId>>,
}

impl TopologySynchronizer {
    pub fn new(
        driver: Arc<dyn NativeDriver>,
        dispatcher: TransferDispatcher,
        events: Arc<EventRegistry>,
    ) -> Self {
        Self {
            io: Arc::new(IoContext {
                driver,
                dispatcher,
                events,
            }),
            root: RootHub::new(),
            devices: Mutex::new(HashMap::new()),
            scan_lock: Mutex::new(()),
            scan_thread: Mutex::new(None),
        }
    }

    pub fn root_hub(&self) -> &RootHub {
        &self.root
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.io.events
    }

    /// Known node by bus and address
    pub fn device(&self, key: &BusAddress) -> Option<Arc<DeviceNode>> {
        lock(&self.devices).get(key).cloned()
    }

    /// Every known node, attached or not, ordered by bus and address
    pub fn devices(&self) -> Vec<Arc<DeviceNode>> {
        let mut nodes: Vec<_> = lock(&self.devices).values().cloned().collect();
        nodes.sort_by_key(|node| node.id().bus_address());
        nodes
    }

    /// Nodes on the root hub's ports
    pub fn root_devices(&self) -> Vec<Arc<DeviceNode>> {
        self.nodes_on(self.root.ports())
    }

    /// Nodes on a hub's ports; empty for plain devices
    pub fn children(&self, node: &DeviceNode) -> Vec<Arc<DeviceNode>> {
        node.ports()
            .map(|ports| self.nodes_on(ports))
            .unwrap_or_default()
    }

    fn nodes_on(&self, ports: &PortSet) -> Vec<Arc<DeviceNode>> {
        let devices = lock(&self.devices);
        ports
            .attached_devices()
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect()
    }

    /// Run one synchronization cycle
    ///
    /// Concurrent callers are serialized. Listener notifications are sent
    /// after the device map is unlocked but before the next scan can start.
    ///
    /// A listener calling `scan` from inside a notification gets
    /// `InvalidRequest` instead of waiting on its own scan.
    pub fn scan(&self) -> Result<ScanReport> {
        let current = thread::current().id();
        if *lock(&self.scan_thread) == Some(current) {
            warn!("Topology scan requested from inside a scan notification");
            return Err(UsbError::InvalidRequest(
                "scan called from a topology listener".to_string(),
            ));
        }

        let _scan = lock(&self.scan_lock);
        *lock(&self.scan_thread) = Some(current);
        let report = self.scan_locked();
        *lock(&self.scan_thread) = None;
        report
    }

    fn scan_locked(&self) -> Result<ScanReport> {
        let raw_devices = self.io.driver.list_devices()?;
        let listed = self.identify(&raw_devices);
        let present: HashSet<BusAddress> = listed.iter().map(|(_, id)| id.bus_address()).collect();

        let (attached, detached) = {
            let mut devices = lock(&self.devices);

            self.upsert(&listed, &mut devices);

            let mut detached = Vec::new();
            sweep_removed(self.root.ports(), &present, &mut devices, &mut detached);
            devices.retain(|id, node| {
                let keep = node.is_connected() || present.contains(&id.bus_address());
                if !keep {
                    trace!("Dropping unattached device {}", id);
                }
                keep
            });

            let mut pending = unattached_by_parent(&devices);
            let mut attached = Vec::new();
            attach_children(
                &HubRef::Root,
                self.root.ports(),
                &devices,
                &mut pending,
                &mut attached,
            );
            for (parent, nodes) in &pending {
                for node in nodes {
                    debug!(
                        "Device {} left unattached, parent {:?} is not in the tree",
                        node.id(),
                        parent
                    );
                }
            }

            (attached, detached)
        };

        for node in &detached {
            self.io.events.notify_detach(node);
        }
        for node in &attached {
            self.io.events.notify_attach(node);
        }

        if !attached.is_empty() || !detached.is_empty() {
            debug!(
                "Scan complete: {} attached, {} detached",
                attached.len(),
                detached.len()
            );
        }

        Ok(ScanReport {
            attached: attached.iter().map(|node| node.id().clone()).collect(),
            detached: detached.iter().map(|node| node.id().clone()).collect(),
        })
    }

    /// Derive ids for every device whose descriptor can be read
    fn identify(&self, raw_devices: &[RawDevice]) -> Vec<(RawDevice, DeviceId)> {
        raw_devices
            .iter()
            .filter_map(|raw| match self.io.driver.device_descriptor(raw) {
                Ok(descriptor) => Some((
                    *raw,
                    DeviceId::new(
                        u32::from(raw.bus),
                        u32::from(raw.address),
                        u32::from(raw.port),
                        descriptor,
                    ),
                )),
                Err(e) => {
                    debug!(
                        "Skipping device at bus={}, addr={} this cycle: {}",
                        raw.bus, raw.address, e
                    );
                    None
                }
            })
            .collect()
    }

    /// Create nodes for ids not seen before
    fn upsert(
        &self,
        listed: &[(RawDevice, DeviceId)],
        devices: &mut HashMap<DeviceId, Arc<DeviceNode>>,
    ) {
        let ids: HashMap<BusAddress, &DeviceId> = listed
            .iter()
            .map(|(_, id)| (id.bus_address(), id))
            .collect();

        for (raw, id) in listed {
            if devices.contains_key(id) {
                continue;
            }

            let parent_id = match self.io.driver.parent(raw) {
                None => None,
                Some(parent) => {
                    let key = BusAddress::new(u32::from(parent.bus), u32::from(parent.address));
                    match ids.get(&key) {
                        Some(parent_id) => Some((*parent_id).clone()),
                        None => {
                            debug!("Deferring {}: parent {} was not identified", id, key);
                            continue;
                        }
                    }
                }
            };

            let node = self.create_node(id.clone(), parent_id, *raw);
            devices.insert(id.clone(), Arc::new(node));
        }
    }

    fn create_node(&self, id: DeviceId, parent_id: Option<DeviceId>, raw: RawDevice) -> DeviceNode {
        let driver = &self.io.driver;

        let configurations = driver.configurations(&raw).unwrap_or_else(|e| {
            warn!("Failed to read configurations of {}: {}", id, e);
            Vec::new()
        });
        let active_config = driver.active_configuration(&raw).unwrap_or_else(|e| {
            debug!("Failed to read active configuration of {}: {}", id, e);
            0
        });

        trace!(
            "New {} {} (parent {:?}, config {})",
            if id.is_hub() { "hub" } else { "device" },
            id,
            parent_id.as_ref().map(DeviceId::bus_address),
            active_config
        );

        DeviceNode::new(
            id,
            parent_id,
            raw,
            driver.speed(&raw),
            configurations,
            active_config,
            self.io.clone(),
        )
    }
}

/// Depth-first pass detaching every attached device that is no longer listed
fn sweep_removed(
    ports: &PortSet,
    present: &HashSet<BusAddress>,
    devices: &mut HashMap<DeviceId, Arc<DeviceNode>>,
    detached: &mut Vec<Arc<DeviceNode>>,
) {
    for occupant in ports.attached_devices() {
        if !present.contains(&occupant.bus_address()) {
            detach_subtree(ports, &occupant, devices, detached);
            continue;
        }

        let node = devices.get(&occupant).cloned();
        if let Some(child_ports) = node.as_ref().and_then(|node| node.ports()) {
            sweep_removed(child_ports, present, devices, detached);
        }
    }
}

/// Disconnect `id` from `ports`, taking its descendants with it first
fn detach_subtree(
    ports: &PortSet,
    id: &DeviceId,
    devices: &mut HashMap<DeviceId, Arc<DeviceNode>>,
    detached: &mut Vec<Arc<DeviceNode>>,
) {
    let node = devices.get(id).cloned();

    if let Some(child_ports) = node.as_ref().and_then(|node| node.ports()) {
        for child in child_ports.attached_devices() {
            detach_subtree(child_ports, &child, devices, detached);
        }
    }

    ports.disconnect(id);
    if let Some(node) = node {
        node.clear_port();
        devices.remove(id);
        info!("Device {} detached", id);
        detached.push(node);
    }
}

/// Unattached nodes grouped by the hub they belong under
fn unattached_by_parent(
    devices: &HashMap<DeviceId, Arc<DeviceNode>>,
) -> HashMap<Option<BusAddress>, Vec<Arc<DeviceNode>>> {
    let mut pending: HashMap<_, Vec<_>> = HashMap::new();
    for node in devices.values().filter(|node| !node.is_connected()) {
        let parent = node.parent_id().map(DeviceId::bus_address);
        pending.entry(parent).or_default().push(node.clone());
    }
    for nodes in pending.values_mut() {
        nodes.sort_by_key(|node| (node.id().port(), node.id().bus_address()));
    }
    pending
}

/// Connect the pending children of `hub`, then descend into every hub below it
fn attach_children(
    hub: &HubRef,
    ports: &PortSet,
    devices: &HashMap<DeviceId, Arc<DeviceNode>>,
    pending: &mut HashMap<Option<BusAddress>, Vec<Arc<DeviceNode>>>,
    attached: &mut Vec<Arc<DeviceNode>>,
) {
    let key = match hub {
        HubRef::Root => None,
        HubRef::Device(id) => Some(id.bus_address()),
    };

    for child in pending.remove(&key).unwrap_or_default() {
        let number = ports.connect(child.id());
        if child.set_port(PortRef {
            hub: hub.clone(),
            number,
        }) {
            info!("Device {} attached to {} port {}", child.id(), hub, number);
            attached.push(child);
        }
    }

    for occupant in ports.attached_devices() {
        let Some(node) = devices.get(&occupant) else {
            continue;
        };
        if let Some(child_ports) = node.ports() {
            attach_children(
                &HubRef::Device(occupant.clone()),
                child_ports,
                devices,
                pending,
                attached,
            );
        }
    }
}
