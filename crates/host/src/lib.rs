//! USB host access library
//!
//! Models the devices attached to the host as a tree of hubs and ports kept in
//! step with the native driver by [`TopologySynchronizer`], and moves data
//! through per-pipe [`TransferQueue`]s whose worker threads run each request
//! through the [`TransferDispatcher`].
//!
//! # Example
//!
//! ```
//! use host::test_utils::{MockDevice, MockDriver};
//! use host::{HostConfig, HostServices};
//! use std::sync::Arc;
//!
//! let driver = Arc::new(MockDriver::new());
//! driver.insert(MockDevice::hub(1, 1, 0));
//! driver.insert(MockDevice::new(1, 2, 1, 0x04f9, 0x0042).parent(1, 1));
//!
//! let mut config = HostConfig::default();
//! config.usb.scan_interval_millis = 0;
//!
//! let services = HostServices::new(config, driver);
//! let report = services.start().unwrap();
//! assert_eq!(report.attached.len(), 2);
//! assert_eq!(services.root_hub().attached_devices().len(), 1);
//! ```

pub mod config;
pub mod device_id;
pub mod events;
pub mod native;
pub mod pipe;
pub mod services;
// Not part of the stable API; integration tests enable `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod topology;
pub mod transfer;

pub use config::{HostConfig, load_config};
pub use device_id::{BusAddress, DeviceId};
pub use events::{ChannelListener, EventRegistry, ListenerId, TransferSource, UsbEvent, UsbListener};
pub use native::{NativeDriver, NativeHandle, RawDevice, RusbDriver};
pub use pipe::{Interface, Pipe};
pub use services::HostServices;
pub use topology::{
    DeviceNode, HubRef, NodeKind, Port, PortRef, PortSet, RootHub, ScanReport,
    TopologySynchronizer,
};
pub use transfer::{
    AbortSignal, CompletionState, DEFAULT_TIMEOUT, Irp, TransferDispatcher, TransferQueue,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
