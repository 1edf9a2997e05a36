//! Integration tests for HostServices
//!
//! Tests the service object wiring, including:
//! - Initial scan on start
//! - Background scanning and shutdown
//! - Event forwarding through ChannelListener

use host::test_utils::{DEFAULT_TEST_TIMEOUT, MockDevice, MockDriver, wait_until};
use host::{ChannelListener, HostConfig, HostServices, UsbEvent};
use std::sync::Arc;
use std::time::Duration;

fn config(scan_interval_millis: u32) -> HostConfig {
    let mut config = HostConfig::default();
    config.usb.scan_interval_millis = scan_interval_millis;
    config
}

fn single_hub() -> Arc<MockDriver> {
    let driver = Arc::new(MockDriver::new());
    driver.insert(MockDevice::hub(1, 1, 0));
    driver
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_without_background_scan() {
        let driver = single_hub();
        let services = HostServices::new(config(0), driver.clone());

        let report = services.start().unwrap();

        assert_eq!(report.attached.len(), 1);
        assert!(!services.is_scanning());

        driver.insert(MockDevice::new(1, 2, 1, 0x1234, 0x5678).parent(1, 1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(services.topology().devices().len(), 1);

        let report = services.scan().unwrap();
        assert_eq!(report.attached.len(), 1);
    }

    #[test]
    fn test_background_scan_picks_up_hotplug() {
        let driver = single_hub();
        let services = HostServices::new(config(5), driver.clone());
        services.start().unwrap();
        assert!(services.is_scanning());

        driver.insert(MockDevice::new(1, 2, 1, 0x1234, 0x5678).parent(1, 1));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            services.topology().devices().len() == 2
        }));

        driver.remove(1, 1);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            services.root_hub().attached_devices().is_empty()
        }));

        services.shutdown();
        assert!(!services.is_scanning());
    }

    #[test]
    fn test_scan_failures_do_not_stop_scanner() {
        let driver = single_hub();
        let services = HostServices::new(config(5), driver.clone());
        services.start().unwrap();

        driver.fail_listing(Some(usb_types::UsbError::platform(-1, "bus reset")));
        std::thread::sleep(Duration::from_millis(30));
        driver.fail_listing(None);
        driver.insert(MockDevice::new(1, 2, 1, 0x1234, 0x5678).parent(1, 1));

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            services.topology().devices().len() == 2
        }));
        assert!(services.is_scanning());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let services = HostServices::new(config(5), single_hub());
        services.start().unwrap();
        services.shutdown();
        services.shutdown();
        assert!(!services.is_scanning());
    }

    #[test]
    fn test_timeout_comes_from_config() {
        let mut config = config(0);
        config.usb.timeout_millis = 250;
        let services = HostServices::new(config, single_hub());
        assert_eq!(services.config().timeout(), Duration::from_millis(250));
    }
}

mod events {
    use super::*;

    #[test]
    fn test_listener_removal() {
        let services = HostServices::new(config(0), single_hub());
        let (listener, receiver) = ChannelListener::channel();
        let id = services.add_listener(Arc::new(listener));
        assert!(services.remove_listener(id));

        services.start().unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_listener_receives_hotplug() {
        let driver = single_hub();
        let services = HostServices::new(config(0), driver.clone());
        let (listener, receiver) = ChannelListener::channel();
        services.add_listener(Arc::new(listener));

        services.start().unwrap();
        driver.insert(MockDevice::new(1, 2, 3, 0x04f9, 0x0042).parent(1, 1));
        services.scan().unwrap();
        driver.remove(1, 2);
        services.scan().unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, receiver.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }

        match &events[0] {
            UsbEvent::DeviceAttached { device, parent, port } => {
                assert_eq!(device.address(), 1);
                assert!(parent.is_none());
                assert_eq!(*port, Some(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            UsbEvent::DeviceAttached { device, parent, port } => {
                assert_eq!(device.address(), 2);
                assert_eq!(parent.as_ref().map(|p| p.address()), Some(1));
                assert_eq!(*port, Some(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(&events[2], UsbEvent::DeviceDetached { device } if device.address() == 2));
    }
}
