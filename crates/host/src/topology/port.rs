//! Hub ports
//!
//! A [`PortSet`] is the ordered, 1-based list of ports on one hub. Ports only
//! ever record the [`DeviceId`] of their occupant; the node itself stays
//! owned by the synchronizer's device map.

use crate::device_id::DeviceId;
use crate::lock;
use std::fmt;
use std::sync::Mutex;

/// The hub a port belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HubRef {
    /// The synthetic root hub
    Root,
    /// A physical hub in the tree
    Device(DeviceId),
}

impl fmt::Display for HubRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubRef::Root => f.write_str("root hub"),
            HubRef::Device(id) => write!(f, "hub {}", id.bus_address()),
        }
    }
}

/// Back-reference from a device to the port it occupies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub hub: HubRef,
    pub number: u32,
}

/// Snapshot of one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub number: u32,
    pub occupant: Option<DeviceId>,
}

impl Port {
    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }
}

/// Ports of one hub, guarded by a hub-scoped lock
#[derive(Debug)]
pub struct PortSet {
    ports: Mutex<Vec<Port>>,
}

impl PortSet {
    /// Create a port set with `initial` empty ports numbered 1..=initial
    pub fn new(initial: u32) -> Self {
        let ports = (1..=initial)
            .map(|number| Port {
                number,
                occupant: None,
            })
            .collect();
        Self {
            ports: Mutex::new(ports),
        }
    }

    /// Place `device` in the first free port, appending a port if all are taken
    ///
    /// Returns the port number. Connecting a device that is already present
    /// returns its current port.
    pub fn connect(&self, device: &DeviceId) -> u32 {
        let mut ports = lock(&self.ports);

        if let Some(port) = ports.iter().find(|p| p.occupant.as_ref() == Some(device)) {
            return port.number;
        }

        if let Some(port) = ports.iter_mut().find(|p| p.occupant.is_none()) {
            port.occupant = Some(device.clone());
            return port.number;
        }

        let number = ports.len() as u32 + 1;
        ports.push(Port {
            number,
            occupant: Some(device.clone()),
        });
        number
    }

    /// Free the port holding `device`, returning its number
    pub fn disconnect(&self, device: &DeviceId) -> Option<u32> {
        let mut ports = lock(&self.ports);
        let port = ports
            .iter_mut()
            .find(|p| p.occupant.as_ref() == Some(device))?;
        port.occupant = None;
        Some(port.number)
    }

    pub fn number_of_ports(&self) -> u32 {
        lock(&self.ports).len() as u32
    }

    pub fn port(&self, number: u32) -> Option<Port> {
        let ports = lock(&self.ports);
        let index = usize::try_from(number.checked_sub(1)?).ok()?;
        ports.get(index).cloned()
    }

    pub fn ports(&self) -> Vec<Port> {
        lock(&self.ports).clone()
    }

    /// Occupants in port order
    pub fn attached_devices(&self) -> Vec<DeviceId> {
        lock(&self.ports)
            .iter()
            .filter_map(|p| p.occupant.clone())
            .collect()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        lock(&self.ports)
            .iter()
            .any(|p| p.occupant.as_ref() == Some(device))
    }
}
