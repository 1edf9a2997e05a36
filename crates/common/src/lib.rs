//! Common utilities for usb-host
//!
//! This crate provides the ambient pieces shared by the host library and the
//! command line front end: the crate-spanning error type and tracing setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
