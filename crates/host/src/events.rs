//! Topology and transfer notifications
//!
//! [`EventRegistry`] is a plain observer registry: listeners are added and
//! removed by id and every notification goes to all of them in registration
//! order. [`ChannelListener`] forwards notifications as [`UsbEvent`] values
//! over an `async_channel` for consumers running on an async runtime.

use crate::device_id::DeviceId;
use crate::topology::DeviceNode;
use crate::transfer::{CompletionState, Irp};
use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};
use usb_types::UsbError;

/// Handle returned by [`EventRegistry::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Device and endpoint a transfer ran on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSource {
    pub device: DeviceId,
    pub endpoint: u8,
}

/// Receiver of host notifications; every method defaults to a no-op
///
/// Attach and detach notifications run inside the topology scan. Calling
/// [`TopologySynchronizer::scan`](crate::TopologySynchronizer::scan) from
/// them fails with `InvalidRequest`; hand the work to another thread instead.
pub trait UsbListener: Send + Sync {
    fn on_attach(&self, _device: &Arc<DeviceNode>) {}

    fn on_detach(&self, _device: &Arc<DeviceNode>) {}

    fn on_transfer_complete(&self, _source: &TransferSource, _irp: &Arc<Irp>) {}

    fn on_transfer_error(&self, _source: &TransferSource, _irp: &Arc<Irp>, _error: &UsbError) {}
}

/// Observer registry shared by the synchronizer and every transfer queue
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn UsbListener>)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn UsbListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns false if the id was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Listeners run on a snapshot so they may add or remove listeners.
    fn snapshot(&self) -> Vec<Arc<dyn UsbListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub fn notify_attach(&self, device: &Arc<DeviceNode>) {
        for listener in self.snapshot() {
            listener.on_attach(device);
        }
    }

    pub fn notify_detach(&self, device: &Arc<DeviceNode>) {
        for listener in self.snapshot() {
            listener.on_detach(device);
        }
    }

    /// Fire the data or error notification matching the request's state
    pub fn notify_transfer(&self, source: &TransferSource, irp: &Arc<Irp>) {
        match irp.completion_state() {
            CompletionState::Done => {
                for listener in self.snapshot() {
                    listener.on_transfer_complete(source, irp);
                }
            }
            CompletionState::Failed(error) => {
                for listener in self.snapshot() {
                    listener.on_transfer_error(source, irp, &error);
                }
            }
            CompletionState::Pending => {
                debug!(
                    "Ignoring notification for pending request on endpoint {:#04x}",
                    source.endpoint
                );
            }
        }
    }
}

/// Notification forwarded by [`ChannelListener`]
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device was connected to a hub port
    DeviceAttached {
        device: DeviceId,
        parent: Option<DeviceId>,
        port: Option<u32>,
    },

    /// A device was removed from the tree
    DeviceDetached { device: DeviceId },

    TransferCompleted {
        source: TransferSource,
        actual_length: usize,
    },

    TransferFailed {
        source: TransferSource,
        error: UsbError,
    },
}

/// Listener that forwards every notification into a channel
pub struct ChannelListener {
    sender: Sender<UsbEvent>,
}

impl ChannelListener {
    pub fn new(sender: Sender<UsbEvent>) -> Self {
        Self { sender }
    }

    /// Listener plus the receiving end of an unbounded channel
    pub fn channel() -> (Self, Receiver<UsbEvent>) {
        let (sender, receiver) = async_channel::unbounded();
        (Self::new(sender), receiver)
    }

    fn send(&self, event: UsbEvent) {
        if let Err(e) = self.sender.try_send(event) {
            error!("Failed to forward USB event: {}", e);
        }
    }
}

impl UsbListener for ChannelListener {
    fn on_attach(&self, device: &Arc<DeviceNode>) {
        self.send(UsbEvent::DeviceAttached {
            device: device.id().clone(),
            parent: device.parent_id().cloned(),
            port: device.port().map(|p| p.number),
        });
    }

    fn on_detach(&self, device: &Arc<DeviceNode>) {
        self.send(UsbEvent::DeviceDetached {
            device: device.id().clone(),
        });
    }

    fn on_transfer_complete(&self, source: &TransferSource, irp: &Arc<Irp>) {
        self.send(UsbEvent::TransferCompleted {
            source: source.clone(),
            actual_length: irp.actual_length(),
        });
    }

    fn on_transfer_error(&self, source: &TransferSource, _irp: &Arc<Irp>, error: &UsbError) {
        self.send(UsbEvent::TransferFailed {
            source: source.clone(),
            error: error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::device_descriptor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        completed: Mutex<Vec<usize>>,
        failed: Mutex<Vec<UsbError>>,
    }

    impl UsbListener for Recorder {
        fn on_transfer_complete(&self, _source: &TransferSource, irp: &Arc<Irp>) {
            self.completed.lock().unwrap().push(irp.actual_length());
        }

        fn on_transfer_error(&self, _source: &TransferSource, _irp: &Arc<Irp>, error: &UsbError) {
            self.failed.lock().unwrap().push(error.clone());
        }
    }

    fn source() -> TransferSource {
        TransferSource {
            device: DeviceId::new(1, 2, 1, device_descriptor(0x1234, 0x5678, 0)),
            endpoint: 0x81,
        }
    }

    #[test]
    fn test_add_remove_listener() {
        let registry = EventRegistry::new();
        assert!(registry.is_empty());

        let first = registry.add_listener(Arc::new(Recorder::default()));
        let second = registry.add_listener(Arc::new(Recorder::default()));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove_listener(first));
        assert!(!registry.remove_listener(first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transfer_notification_follows_state() {
        let registry = EventRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());

        let done = Arc::new(Irp::new(vec![0; 4]));
        done.set_actual_length(4);
        done.complete(Ok(()));
        registry.notify_transfer(&source(), &done);

        let failed = Arc::new(Irp::new(vec![0; 4]));
        failed.complete(Err(UsbError::Aborted));
        registry.notify_transfer(&source(), &failed);

        let pending = Arc::new(Irp::new(vec![0; 4]));
        registry.notify_transfer(&source(), &pending);

        assert_eq!(*recorder.completed.lock().unwrap(), vec![4]);
        assert_eq!(*recorder.failed.lock().unwrap(), vec![UsbError::Aborted]);
    }

    #[test]
    fn test_channel_listener_forwards_transfers() {
        let (listener, receiver) = ChannelListener::channel();
        let irp = Arc::new(Irp::new(vec![0; 8]));
        irp.set_actual_length(8);
        irp.complete(Ok(()));

        listener.on_transfer_complete(&source(), &irp);

        match receiver.try_recv().unwrap() {
            UsbEvent::TransferCompleted {
                source,
                actual_length,
            } => {
                assert_eq!(source.endpoint, 0x81);
                assert_eq!(actual_length, 8);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
