//! USB subsystem
//!
//! Everything that touches the phone over libusb:
//! - discovery and activation-state classification ([`catalog`])
//! - the vendor control requests that enable and disable the hidden
//!   streaming configuration ([`activation`])
//! - claiming the streaming interface and deframing its bulk stream
//!   ([`session`], [`stream`])
//!
//! All of it is blocking. The async side reaches it through
//! `spawn_blocking` and talks back through `async_channel`.

pub mod activation;
pub mod catalog;
pub mod device;
pub mod handle;
pub mod session;
pub mod stream;

pub use activation::{ActivationController, ActivationError};
pub use catalog::{
    ActivationState, CatalogError, DeviceCatalog, DeviceSource, DeviceSummary, Markers,
};
pub use device::{DeviceDescriptors, OpenDevice};
pub use handle::UsbHandle;
pub use session::{ClaimError, RunSummary, StreamError, StreamingSession};
pub use stream::{BulkStream, BulkStreamConfig, StreamCloser};
