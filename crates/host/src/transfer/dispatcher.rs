//! USB transfer execution
//!
//! Turns one [`Irp`] into native transfer calls for a given endpoint.
//! Control requests go out as a single native call; bulk and interrupt
//! requests are split into max-packet-size chunks and stop at the first
//! short chunk.

use super::irp::Irp;
use super::queue::AbortSignal;
use crate::native::NativeHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};
use usb_types::{Direction, EndpointDescriptor, Result, SetupPacket, TransferType, UsbError};

/// Default timeout for native transfer calls (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Executes requests against an opened device
#[derive(Debug, Clone, Copy)]
pub struct TransferDispatcher {
    timeout: Duration,
}

impl Default for TransferDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TransferDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `irp` on `endpoint`, recording the transferred length on the request
    ///
    /// Short transfers fail with [`UsbError::ShortPacket`] unless the request
    /// accepts short packets. The length moved so far is recorded either way.
    pub fn dispatch(
        &self,
        handle: &dyn NativeHandle,
        endpoint: &EndpointDescriptor,
        irp: &Irp,
        abort: &AbortSignal,
    ) -> Result<()> {
        if endpoint.transfer_type == TransferType::Isochronous {
            warn!(
                "Rejecting isochronous request on endpoint {:#04x}",
                endpoint.address
            );
            return Err(UsbError::UnsupportedTransferType(TransferType::Isochronous));
        }
        irp.validate()?;

        let mut buffer = irp.take_buffer();
        let window = &mut buffer[irp.offset()..irp.offset() + irp.length()];

        let result = match endpoint.transfer_type {
            TransferType::Control => match irp.setup() {
                Some(setup) => self.control(handle, setup, window, abort),
                None => Err((
                    0,
                    UsbError::InvalidRequest("control request without setup packet".to_string()),
                )),
            },
            _ => self.chunked(handle, endpoint, window, abort),
        };
        irp.restore_buffer(buffer);

        let actual = match result {
            Ok(actual) => actual,
            Err((actual, e)) => {
                irp.set_actual_length(actual);
                return Err(e);
            }
        };
        irp.set_actual_length(actual);

        if actual < irp.length() && !irp.accept_short_packet() {
            debug!(
                "Short packet on endpoint {:#04x}: {} of {} bytes",
                endpoint.address,
                actual,
                irp.length()
            );
            return Err(UsbError::ShortPacket {
                expected: irp.length(),
                actual,
            });
        }

        Ok(())
    }

    /// One native control transfer over the whole data stage
    fn control(
        &self,
        handle: &dyn NativeHandle,
        setup: &SetupPacket,
        data: &mut [u8],
        abort: &AbortSignal,
    ) -> std::result::Result<usize, (usize, UsbError)> {
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data.len()
        );

        self.with_retry(setup.direction(), 0x00, abort, || {
            handle.control_transfer(setup, data, self.timeout)
        })
        .map_err(|e| (0, e))
    }

    /// Consecutive native calls of at most max-packet-size bytes each
    fn chunked(
        &self,
        handle: &dyn NativeHandle,
        endpoint: &EndpointDescriptor,
        data: &mut [u8],
        abort: &AbortSignal,
    ) -> std::result::Result<usize, (usize, UsbError)> {
        let address = endpoint.address;
        let direction = endpoint.direction();
        let length = data.len();
        let chunk_size = match usize::from(endpoint.max_packet_size) {
            0 => length.max(1),
            size => size,
        };

        debug!(
            "{} transfer: endpoint={:#04x}, len={}, chunk={}, is_in={}",
            endpoint.transfer_type,
            address,
            length,
            chunk_size,
            direction == Direction::In
        );

        let mut total = 0;
        loop {
            let end = (total + chunk_size).min(length);
            let requested = end - total;
            let chunk = &mut data[total..end];

            let moved = self
                .with_retry(direction, address, abort, || match endpoint.transfer_type {
                    TransferType::Interrupt => {
                        handle.interrupt_transfer(address, chunk, self.timeout)
                    }
                    _ => handle.bulk_transfer(address, chunk, self.timeout),
                })
                .map_err(|e| (total, e))?;

            // Drivers never report more than asked; clamp anyway
            let moved = moved.min(requested);
            total += moved;
            trace!(
                "Chunk on endpoint {:#04x}: {}/{} bytes, total {}/{}",
                address, moved, requested, total, length
            );

            if moved < requested || total >= length {
                break;
            }
        }

        Ok(total)
    }

    /// Retry IN timeouts until the queue starts aborting
    fn with_retry<F>(
        &self,
        direction: Direction,
        endpoint: u8,
        abort: &AbortSignal,
        mut call: F,
    ) -> Result<usize>
    where
        F: FnMut() -> Result<usize>,
    {
        loop {
            match call() {
                Err(e) if e.is_timeout() && direction == Direction::In => {
                    if abort.is_aborting() {
                        debug!(
                            "IN transfer on endpoint {:#04x} timed out during abort",
                            endpoint
                        );
                        return Err(UsbError::Aborted);
                    }
                    trace!(
                        "IN transfer on endpoint {:#04x} timed out, retrying",
                        endpoint
                    );
                }
                other => return other,
            }
        }
    }
}
