//! I/O request packets
//!
//! An [`Irp`] is one buffered read or write submitted to an endpoint. It is
//! shared as `Arc<Irp>` between the submitting thread and the queue worker:
//! the worker records the transferred length and the completion state, the
//! submitter may block in [`Irp::wait`] until that happens.

use crate::lock;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use usb_types::{Result, SetupPacket, UsbError};

/// Completion state of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Done,
    Failed(UsbError),
}

#[derive(Debug)]
struct IrpState {
    buffer: Vec<u8>,
    actual_length: usize,
    completion: CompletionState,
    /// Set from enqueue until completion
    queued: bool,
}

/// One buffered I/O request
#[derive(Debug)]
pub struct Irp {
    setup: Option<SetupPacket>,
    offset: usize,
    length: usize,
    accept_short_packet: bool,
    state: Mutex<IrpState>,
    completed: Condvar,
}

impl Irp {
    /// Request covering the whole buffer
    ///
    /// For IN endpoints the buffer is the receive area; for OUT endpoints it
    /// holds the bytes to send.
    pub fn new(buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self {
            setup: None,
            offset: 0,
            length,
            accept_short_packet: true,
            state: Mutex::new(IrpState {
                buffer,
                actual_length: 0,
                completion: CompletionState::Pending,
                queued: false,
            }),
            completed: Condvar::new(),
        }
    }

    /// Control request; the buffer is the data stage (may be empty)
    pub fn control(setup: SetupPacket, buffer: Vec<u8>) -> Self {
        Self {
            setup: Some(setup),
            ..Self::new(buffer)
        }
    }

    /// Restrict the transfer to `buffer[offset..offset + length]`
    pub fn with_window(mut self, offset: usize, length: usize) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    pub fn with_accept_short_packet(mut self, accept: bool) -> Self {
        self.accept_short_packet = accept;
        self
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn accept_short_packet(&self) -> bool {
        self.accept_short_packet
    }

    pub fn actual_length(&self) -> usize {
        lock(&self.state).actual_length
    }

    pub fn completion_state(&self) -> CompletionState {
        lock(&self.state).completion.clone()
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).completion != CompletionState::Pending
    }

    /// Outcome of a completed request, `None` while pending
    pub fn result(&self) -> Option<Result<()>> {
        match &lock(&self.state).completion {
            CompletionState::Pending => None,
            CompletionState::Done => Some(Ok(())),
            CompletionState::Failed(e) => Some(Err(e.clone())),
        }
    }

    pub fn error(&self) -> Option<UsbError> {
        match &lock(&self.state).completion {
            CompletionState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Copy of the whole buffer
    ///
    /// While the request is in flight the buffer is lent to the dispatcher
    /// and this returns an empty vector.
    pub fn buffer(&self) -> Vec<u8> {
        lock(&self.state).buffer.clone()
    }

    /// The bytes actually transferred, `buffer[offset..offset + actual_length]`
    pub fn data(&self) -> Vec<u8> {
        let state = lock(&self.state);
        let end = (self.offset + state.actual_length).min(state.buffer.len());
        state
            .buffer
            .get(self.offset..end)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Block until the request completes
    pub fn wait(&self) {
        let mut state = lock(&self.state);
        while state.completion == CompletionState::Pending {
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the request completes and return its outcome
    pub fn wait_for_result(&self) -> Result<()> {
        let mut state = lock(&self.state);
        loop {
            match &state.completion {
                CompletionState::Pending => {
                    state = self
                        .completed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                CompletionState::Done => return Ok(()),
                CompletionState::Failed(e) => return Err(e.clone()),
            }
        }
    }

    /// Block until the request completes or `timeout` elapses
    ///
    /// Returns true if the request completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.completion == CompletionState::Pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .completed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Check that the data window lies inside the buffer
    pub fn validate(&self) -> Result<()> {
        let buffer_len = lock(&self.state).buffer.len();
        let end = self.offset.checked_add(self.length);
        match end {
            Some(end) if end <= buffer_len => Ok(()),
            _ => Err(UsbError::InvalidRequest(format!(
                "window {}+{} exceeds buffer of {} bytes",
                self.offset, self.length, buffer_len
            ))),
        }
    }

    /// Lend the buffer to the dispatcher for the duration of a transfer
    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.state).buffer)
    }

    pub(crate) fn restore_buffer(&self, buffer: Vec<u8>) {
        lock(&self.state).buffer = buffer;
    }

    pub(crate) fn set_actual_length(&self, actual_length: usize) {
        lock(&self.state).actual_length = actual_length;
    }

    /// Mark the request queued, clearing any earlier outcome
    pub(crate) fn begin(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.queued {
            return Err(UsbError::InvalidRequest(
                "request is already queued".to_string(),
            ));
        }
        state.queued = true;
        state.actual_length = 0;
        state.completion = CompletionState::Pending;
        Ok(())
    }

    /// Record the outcome and wake every waiter
    pub(crate) fn complete(&self, result: Result<()>) {
        let mut state = lock(&self.state);
        state.queued = false;
        state.completion = match result {
            Ok(()) => CompletionState::Done,
            Err(e) => CompletionState::Failed(e),
        };
        self.completed.notify_all();
    }
}
