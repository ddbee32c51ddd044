//! qt-pull capture library
//!
//! Activates the hidden streaming configuration of an attached phone, claims
//! its bulk stream, deframes it and forwards every payload to a file or a
//! push socket. The `qt-pull` binary is a thin CLI over these modules.

pub mod config;
pub mod listing;
pub mod orchestrator;
pub mod pipeline;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::CaptureConfig;
pub use orchestrator::{RetryPolicy, StartError, StartOutcome, start_with_retry};
pub use pipeline::CapturePipeline;
