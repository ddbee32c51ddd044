//! Common utilities for qt-pull
//!
//! This crate provides the ambient pieces shared by the capture tool:
//! the passed-down logging context, the shared error type, and the
//! shutdown coordinator that fans a single interrupt out to every
//! long-running loop.

pub mod error;
pub mod logging;
pub mod shutdown;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::{LogContext, LogFormat};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownSubscription};
