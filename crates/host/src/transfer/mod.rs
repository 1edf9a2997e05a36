//! Transfer engine
//!
//! Requests ([`Irp`]) are queued per pipe on a [`TransferQueue`], whose
//! worker thread hands them one at a time to the [`TransferDispatcher`].

pub mod dispatcher;
pub mod irp;
pub mod queue;

pub use dispatcher::{DEFAULT_TIMEOUT, TransferDispatcher};
pub use irp::{CompletionState, Irp};
pub use queue::{AbortSignal, TransferQueue};
