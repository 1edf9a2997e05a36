//! Integration tests for interfaces, pipes and the default control pipe
//!
//! Tests the capability layer on top of the topology, including:
//! - Precondition checks and their order
//! - Claim / open / submit / close lifecycle
//! - Control transfers and lazy device opening
//! - Abort through a pipe and transfer notifications

use host::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockDevice, MockDriver, MockResponse, configuration, endpoint, interface,
    wait_until,
};
use host::{
    BusAddress, CompletionState, DeviceNode, EventRegistry, Irp, TopologySynchronizer,
    TransferDispatcher, TransferSource, UsbListener,
};
use std::sync::{Arc, Mutex};
use std::thread;
use usb_types::{SetupPacket, TransferType, UsbError};

const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;
const INTERRUPT_IN: u8 = 0x83;

struct Fixture {
    driver: Arc<MockDriver>,
    topology: TopologySynchronizer,
}

impl Fixture {
    /// Hub 1:1 with a configured device at 1:2 and an unconfigured one at 1:3
    fn new() -> Self {
        let driver = Arc::new(MockDriver::new());
        driver.insert(MockDevice::hub(1, 1, 0));
        driver.insert(
            MockDevice::new(1, 2, 1, 0x04f9, 0x0042)
                .parent(1, 1)
                .configured(configuration(
                    1,
                    vec![interface(
                        0,
                        vec![
                            endpoint(BULK_IN, TransferType::Bulk, 64),
                            endpoint(BULK_OUT, TransferType::Bulk, 64),
                            endpoint(INTERRUPT_IN, TransferType::Interrupt, 8),
                        ],
                    )],
                )),
        );
        driver.insert(MockDevice::new(1, 3, 2, 0x1234, 0x5678).parent(1, 1));

        let topology = TopologySynchronizer::new(
            driver.clone(),
            TransferDispatcher::default(),
            Arc::new(EventRegistry::new()),
        );
        topology.scan().unwrap();

        Self { driver, topology }
    }

    fn device(&self, address: u32) -> Arc<DeviceNode> {
        self.topology.device(&BusAddress::new(1, address)).unwrap()
    }
}

fn get_descriptor() -> Arc<Irp> {
    Arc::new(Irp::control(
        SetupPacket::new(0x80, 0x06, 0x0100, 0),
        vec![0; 18],
    ))
}

mod preconditions {
    use super::*;

    #[test]
    fn test_unconfigured_device_has_no_interfaces() {
        let fixture = Fixture::new();
        let device = fixture.device(3);

        assert!(!device.is_configured());
        assert_eq!(device.interface(0).unwrap_err(), UsbError::NotActive);
    }

    #[test]
    fn test_unknown_interface_is_not_active() {
        let fixture = Fixture::new();
        assert_eq!(fixture.device(2).interface(5).unwrap_err(), UsbError::NotActive);
    }

    #[test]
    fn test_open_requires_claim() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        let pipe = iface.pipe(BULK_IN).unwrap();

        assert_eq!(pipe.open(), Err(UsbError::NotClaimed));
        assert!(!pipe.is_open());
    }

    #[test]
    fn test_submit_requires_open() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_IN).unwrap();

        let irp = Arc::new(Irp::new(vec![0; 64]));
        assert_eq!(pipe.submit(irp.clone()), Err(UsbError::NotOpen));
        assert!(!irp.is_complete());
        assert_eq!(pipe.abort_all_submissions(), Err(UsbError::NotOpen));
        assert_eq!(pipe.close(), Err(UsbError::NotOpen));
    }

    #[test]
    fn test_claim_checked_before_open() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_IN).unwrap();
        pipe.open().unwrap();
        pipe.close().unwrap();
        iface.release().unwrap();

        // Closed and unclaimed: the claim check comes first
        let irp = Arc::new(Irp::new(vec![0; 64]));
        assert_eq!(pipe.submit(irp), Err(UsbError::NotClaimed));
    }

    #[test]
    fn test_invalid_window_rejected_synchronously() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_IN).unwrap();
        pipe.open().unwrap();

        let irp = Arc::new(Irp::new(vec![0; 8]).with_window(4, 8));
        assert!(matches!(pipe.submit(irp), Err(UsbError::InvalidRequest(_))));
        assert!(!pipe.is_busy());
    }

    #[test]
    fn test_disconnected_checked_first() {
        let fixture = Fixture::new();
        let device = fixture.device(2);
        let iface = device.interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_IN).unwrap();
        pipe.open().unwrap();

        fixture.driver.remove(1, 2);
        fixture.topology.scan().unwrap();

        let irp = Arc::new(Irp::new(vec![0; 64]));
        assert_eq!(pipe.submit(irp.clone()), Err(UsbError::Disconnected));
        assert_eq!(device.sync_control(get_descriptor()), Err(UsbError::Disconnected));
        assert_eq!(iface.claim(), Err(UsbError::Disconnected));
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_claim_open_transfer_close_release() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        let handle = fixture.driver.handle(1, 2);

        iface.claim().unwrap();
        assert!(iface.is_claimed());
        assert!(handle.is_claimed(0));

        let pipe = iface.pipe(BULK_IN).unwrap();
        pipe.open().unwrap();

        let irp = Arc::new(Irp::new(vec![0; 128]).with_accept_short_packet(false));
        pipe.sync_submit(irp.clone()).unwrap();
        assert_eq!(irp.actual_length(), 128);
        assert_eq!(handle.calls_on(BULK_IN).len(), 2);

        pipe.close().unwrap();
        iface.release().unwrap();
        assert!(!iface.is_claimed());
        assert!(!handle.is_claimed(0));
    }

    #[test]
    fn test_double_claim_rejected() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();

        iface.claim().unwrap();
        assert!(matches!(iface.claim(), Err(UsbError::InvalidRequest(_))));
    }

    #[test]
    fn test_release_requires_closed_pipes() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_OUT).unwrap();
        pipe.open().unwrap();

        assert!(matches!(iface.release(), Err(UsbError::InvalidRequest(_))));
        pipe.close().unwrap();
        iface.release().unwrap();
        assert_eq!(iface.release(), Err(UsbError::NotClaimed));
    }

    #[test]
    fn test_pipe_is_shared_per_endpoint() {
        let fixture = Fixture::new();
        let device = fixture.device(2);
        let first = device.interface(0).unwrap().pipe(BULK_IN).unwrap();
        let second = device.interface(0).unwrap().pipe(BULK_IN).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(device.interface(0).unwrap().pipes().unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_endpoint() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        assert!(matches!(iface.pipe(0x8f), Err(UsbError::InvalidRequest(_))));
    }

    #[test]
    fn test_close_races_with_submit() {
        let fixture = Fixture::new();
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_OUT).unwrap();
        pipe.open().unwrap();

        let submitter = {
            let pipe = pipe.clone();
            thread::spawn(move || {
                let mut submitted = Vec::new();
                loop {
                    let irp = Arc::new(Irp::new(vec![3; 8]));
                    match pipe.submit(irp.clone()) {
                        Ok(()) => {
                            submitted.push(irp);
                            thread::sleep(std::time::Duration::from_micros(200));
                        }
                        Err(UsbError::NotOpen) => return submitted,
                        Err(e) => panic!("unexpected error {:?}", e),
                    }
                }
            })
        };

        thread::sleep(std::time::Duration::from_millis(5));
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || pipe.close().is_ok()));
        // Nothing can be queued behind a successful close
        assert!(!pipe.is_busy());

        let submitted = submitter.join().unwrap();
        assert!(submitted.iter().all(|irp| irp.is_complete()));
        assert_eq!(
            fixture.driver.handle(1, 2).calls_on(BULK_OUT).len(),
            submitted.len()
        );
    }

    #[test]
    fn test_sync_submit_reports_transfer_error() {
        let fixture = Fixture::new();
        let handle = fixture.driver.handle(1, 2);
        handle.script(
            BULK_OUT,
            [MockResponse::Error(UsbError::platform(
                usb_types::error::code::PIPE,
                "stall",
            ))],
        );
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_OUT).unwrap();
        pipe.open().unwrap();

        let irp = Arc::new(Irp::new(vec![1; 16]));
        let err = pipe.sync_submit(irp.clone()).unwrap_err();

        assert!(matches!(err, UsbError::Platform { .. }));
        assert_eq!(irp.error(), Some(err));
    }
}

mod control_pipe {
    use super::*;

    #[test]
    fn test_sync_control() {
        let fixture = Fixture::new();
        let device = fixture.device(2);

        let irp = get_descriptor();
        device.sync_control(irp.clone()).unwrap();

        assert_eq!(irp.actual_length(), 18);
        let calls = fixture.driver.handle(1, 2).calls_on(0x00);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].setup, Some(SetupPacket::new(0x80, 0x06, 0x0100, 0)));
    }

    #[test]
    fn test_device_opened_lazily_once() {
        let fixture = Fixture::new();
        assert_eq!(fixture.driver.open_count(), 0);

        let device = fixture.device(3);
        device.sync_control(get_descriptor()).unwrap();
        device.sync_control(get_descriptor()).unwrap();

        assert_eq!(fixture.driver.open_count(), 1);
    }

    #[test]
    fn test_resubmitted_control_waits_for_new_outcome() {
        let fixture = Fixture::new();
        let device = fixture.device(2);
        let handle = fixture.driver.handle(1, 2);
        handle.script(
            0x00,
            [MockResponse::Error(UsbError::platform(
                usb_types::error::code::PIPE,
                "stall",
            ))],
        );

        let irp = get_descriptor();
        assert!(matches!(
            device.sync_control(irp.clone()),
            Err(UsbError::Platform { .. })
        ));

        handle.hold();
        let retry = {
            let device = device.clone();
            let irp = irp.clone();
            thread::spawn(move || device.sync_control(irp))
        };
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || handle.in_flight() == 1));
        assert!(!irp.is_complete());
        assert!(!retry.is_finished());

        handle.release();
        retry.join().unwrap().unwrap();
        assert_eq!(irp.actual_length(), 18);
        assert_eq!(handle.calls_on(0x00).len(), 2);
    }

    #[test]
    fn test_control_requires_setup() {
        let fixture = Fixture::new();
        let irp = Arc::new(Irp::new(vec![0; 8]));
        assert!(matches!(
            fixture.device(2).submit_control(irp),
            Err(UsbError::InvalidRequest(_))
        ));
    }

    #[derive(Default)]
    struct Recorder {
        completed: Mutex<Vec<(TransferSource, usize)>>,
        failed: Mutex<Vec<(TransferSource, UsbError)>>,
    }

    impl UsbListener for Recorder {
        fn on_transfer_complete(&self, source: &TransferSource, irp: &Arc<Irp>) {
            self.completed
                .lock()
                .unwrap()
                .push((source.clone(), irp.actual_length()));
        }

        fn on_transfer_error(&self, source: &TransferSource, _irp: &Arc<Irp>, error: &UsbError) {
            self.failed
                .lock()
                .unwrap()
                .push((source.clone(), error.clone()));
        }
    }

    #[test]
    fn test_transfer_notifications() {
        let fixture = Fixture::new();
        let recorder = Arc::new(Recorder::default());
        fixture.topology.events().add_listener(recorder.clone());
        fixture
            .driver
            .handle(1, 2)
            .script(INTERRUPT_IN, [MockResponse::Error(UsbError::platform(-1, "io"))]);

        let device = fixture.device(2);
        device.sync_control(get_descriptor()).unwrap();

        let iface = device.interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(INTERRUPT_IN).unwrap();
        pipe.open().unwrap();
        assert!(pipe.sync_submit(Arc::new(Irp::new(vec![0; 8]))).is_err());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            recorder.completed.lock().unwrap().len() == 1 && recorder.failed.lock().unwrap().len() == 1
        }));

        let completed = recorder.completed.lock().unwrap();
        assert_eq!(completed[0].0.endpoint, 0x00);
        assert_eq!(completed[0].0.device, *device.id());
        assert_eq!(completed[0].1, 18);

        let failed = recorder.failed.lock().unwrap();
        assert_eq!(failed[0].0.endpoint, INTERRUPT_IN);
        assert!(matches!(failed[0].1, UsbError::Platform { code: -1, .. }));
    }
}

mod abort {
    use super::*;

    #[test]
    fn test_abort_all_submissions() {
        let fixture = Fixture::new();
        let handle = fixture.driver.handle(1, 2);
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let pipe = iface.pipe(BULK_OUT).unwrap();
        pipe.open().unwrap();

        handle.hold();
        let irps: Vec<_> = (0..3).map(|_| Arc::new(Irp::new(vec![7; 32]))).collect();
        for irp in &irps {
            pipe.submit(irp.clone()).unwrap();
        }
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || handle.in_flight() == 1));
        assert!(pipe.is_busy());
        assert!(matches!(pipe.close(), Err(UsbError::InvalidRequest(_))));

        let aborter = {
            let pipe = pipe.clone();
            thread::spawn(move || pipe.abort_all_submissions())
        };
        // Discarded requests complete only after the one in flight
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(irps.iter().all(|irp| !irp.is_complete()));

        handle.release();
        aborter.join().unwrap().unwrap();

        assert_eq!(irps[0].completion_state(), CompletionState::Done);
        assert_eq!(irps[1].error(), Some(UsbError::Aborted));
        assert_eq!(irps[2].error(), Some(UsbError::Aborted));
        assert!(!pipe.is_busy());
        pipe.close().unwrap();
    }

    #[test]
    fn test_pipes_run_independently() {
        let fixture = Fixture::new();
        let handle = fixture.driver.handle(1, 2);
        handle.set_fallback(BULK_IN, MockResponse::Timeout);
        let iface = fixture.device(2).interface(0).unwrap();
        iface.claim().unwrap();
        let reader = iface.pipe(BULK_IN).unwrap();
        let writer = iface.pipe(BULK_OUT).unwrap();
        reader.open().unwrap();
        writer.open().unwrap();

        let pending_read = Arc::new(Irp::new(vec![0; 64]));
        reader.submit(pending_read.clone()).unwrap();

        let write = Arc::new(Irp::new(vec![1; 64]));
        writer.sync_submit(write.clone()).unwrap();
        assert_eq!(write.actual_length(), 64);
        assert!(!pending_read.is_complete());

        reader.abort_all_submissions().unwrap();
        assert_eq!(pending_read.error(), Some(UsbError::Aborted));
    }
}
