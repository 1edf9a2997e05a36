//! Host services
//!
//! [`HostServices`] is constructed once at startup and handed to whatever
//! needs USB access. It owns the event registry and the topology
//! synchronizer, and runs the periodic background scan.

use crate::config::HostConfig;
use crate::events::{EventRegistry, ListenerId, UsbListener};
use crate::lock;
use crate::native::{NativeDriver, RusbDriver};
use crate::topology::{RootHub, ScanReport, TopologySynchronizer};
use crate::transfer::TransferDispatcher;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use usb_types::Result;

#[derive(Default)]
struct ScannerControl {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub struct HostServices {
    config: HostConfig,
    events: Arc<EventRegistry>,
    topology: Arc<TopologySynchronizer>,
    control: Arc<ScannerControl>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl HostServices {
    pub fn new(config: HostConfig, driver: Arc<dyn NativeDriver>) -> Self {
        let events = Arc::new(EventRegistry::new());
        let dispatcher = TransferDispatcher::new(config.timeout());
        let topology = Arc::new(TopologySynchronizer::new(driver, dispatcher, events.clone()));

        Self {
            config,
            events,
            topology,
            control: Arc::new(ScannerControl::default()),
            scanner: Mutex::new(None),
        }
    }

    /// Services backed by libusb
    pub fn with_rusb(config: HostConfig) -> Result<Self> {
        let driver = RusbDriver::new()?;
        Ok(Self::new(config, Arc::new(driver)))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Run the initial scan and start the background scanner
    ///
    /// The scanner is not started when the configured interval is 0.
    /// Calling `start` again after a successful start only rescans.
    pub fn start(&self) -> Result<ScanReport> {
        let report = self.topology.scan()?;
        info!(
            "Initial scan found {} devices",
            self.topology.devices().len()
        );

        let Some(interval) = self.config.scan_interval() else {
            debug!("Background scanning disabled");
            return Ok(report);
        };

        let mut scanner = lock(&self.scanner);
        if scanner.is_some() {
            return Ok(report);
        }
        *lock(&self.control.stop) = false;

        let topology = self.topology.clone();
        let control = self.control.clone();
        let handle = thread::Builder::new()
            .name("usb-topology".to_string())
            .spawn(move || run_scanner(topology, control, interval))
            .map_err(|e| {
                usb_types::UsbError::platform(
                    usb_types::error::code::NO_MEM,
                    format!("failed to spawn topology scanner: {}", e),
                )
            })?;
        *scanner = Some(handle);

        info!("Background topology scan every {:?}", interval);
        Ok(report)
    }

    /// Run a scan now, serialized with the background scanner
    pub fn scan(&self) -> Result<ScanReport> {
        self.topology.scan()
    }

    pub fn topology(&self) -> &Arc<TopologySynchronizer> {
        &self.topology
    }

    pub fn root_hub(&self) -> &RootHub {
        self.topology.root_hub()
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn add_listener(&self, listener: Arc<dyn UsbListener>) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scanner).is_some()
    }

    /// Stop the background scanner and wait for it to exit
    pub fn shutdown(&self) {
        let handle = lock(&self.scanner).take();
        let Some(handle) = handle else {
            return;
        };

        *lock(&self.control.stop) = true;
        self.control.wake.notify_all();

        if handle.join().is_err() {
            warn!("Topology scanner panicked");
        }
        info!("Host services shut down");
    }
}

impl Drop for HostServices {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scanner(topology: Arc<TopologySynchronizer>, control: Arc<ScannerControl>, interval: Duration) {
    debug!("Topology scanner started");
    loop {
        {
            let stop = lock(&control.stop);
            let (stop, _) = control
                .wake
                .wait_timeout_while(stop, interval, |stop| !*stop)
                .unwrap_or_else(PoisonError::into_inner);
            if *stop {
                break;
            }
        }

        if let Err(e) = topology.scan() {
            warn!("Topology scan failed: {}", e);
        }
    }
    debug!("Topology scanner stopped");
}
