use super::port::PortSet;
use crate::device_id::DeviceId;
use crate::transfer::Irp;
use std::sync::Arc;
use tracing::debug;
use usb_types::{CLASS_HUB, DeviceDescriptor, Result, UsbError};

/// Synthetic hub at the top of the tree
///
/// Host-controller root hubs reported by the driver attach to its ports. It
/// has no native device behind it, so every transfer fails with
/// [`UsbError::VirtualDevice`].
#[derive(Debug)]
pub struct RootHub {
    descriptor: DeviceDescriptor,
    ports: PortSet,
}

impl Default for RootHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RootHub {
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                class_code: CLASS_HUB,
                sub_class_code: 0,
                protocol_code: 0,
                max_packet_size_0: 64,
                vendor_id: 0,
                product_id: 0,
                device_version: 0,
                manufacturer_string_index: None,
                product_string_index: None,
                serial_number_string_index: None,
                num_configurations: 1,
            },
            ports: PortSet::new(0),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    /// Devices on the root hub's ports, in port order
    pub fn attached_devices(&self) -> Vec<DeviceId> {
        self.ports.attached_devices()
    }

    pub fn submit_control(&self, irp: Arc<Irp>) -> Result<()> {
        debug!(
            "Rejecting control request of {} bytes on the root hub",
            irp.length()
        );
        Err(UsbError::VirtualDevice)
    }

    pub fn sync_control(&self, irp: Arc<Irp>) -> Result<()> {
        self.submit_control(irp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_types::SetupPacket;

    #[test]
    fn test_root_hub_is_a_hub_without_ports() {
        let root = RootHub::new();
        assert!(root.descriptor().is_hub());
        assert_eq!(root.descriptor().vendor_id, 0);
        assert_eq!(root.ports().number_of_ports(), 0);
        assert!(root.attached_devices().is_empty());
    }

    #[test]
    fn test_root_hub_rejects_transfers() {
        let root = RootHub::new();
        let irp = Arc::new(Irp::control(
            SetupPacket::new(0x80, 0x06, 0x0100, 0),
            vec![0; 18],
        ));

        assert_eq!(root.sync_control(irp.clone()), Err(UsbError::VirtualDevice));
        assert!(!irp.is_complete());
    }
}
