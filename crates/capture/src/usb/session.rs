//! Streaming session over the activated configuration
//!
//! A session owns everything claimed on the device: the configuration, the
//! vendor-specific streaming interface, its bulk endpoint pair, the buffered
//! bulk stream and, once running, the sink. Teardown releases them in a fixed
//! order and every step runs at most once, whether it is reached through
//! [`StreamingSession::teardown`] or through `Drop`.

use crate::config::StreamSettings;
use crate::sink::{Sink, SinkError};
use crate::usb::activation::ActivationController;
use crate::usb::device::{DeviceDescriptors, Direction, OpenDevice, TransferKind};
use crate::usb::handle::{DEFAULT_TIMEOUT, UsbHandle};
use crate::usb::stream::{BulkStream, BulkStreamConfig, StreamCloser};
use protocol::{FrameReader, ProtocolError};
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Device has no configuration {value}")]
    ConfigurationNotFound { value: u8 },

    #[error(
        "Configuration {configuration} has no vendor-specific interface \
         with subclass {subclass:#04x}"
    )]
    InterfaceNotFound { configuration: u8, subclass: u8 },

    #[error("Interface {interface} has no bulk {direction:?} endpoint")]
    EndpointNotFound { interface: u8, direction: Direction },

    #[error("USB error while {action}: {source}")]
    Usb {
        action: &'static str,
        #[source]
        source: rusb::Error,
    },

    #[error("Failed to start bulk reader: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// Short read or corrupt length on the bulk stream
    #[error("Bulk stream failed after {frames} frame(s): {source}")]
    Frame {
        frames: u64,
        #[source]
        source: ProtocolError,
    },

    #[error("Sink rejected frame: {0}")]
    Sink(#[from] SinkError),

    #[error("Session is already torn down")]
    TornDown,
}

/// Outcome of a streaming run that ended without error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub bytes: u64,
    /// The run ended because the stream was closed from outside
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct TeardownSteps {
    stream_closed: bool,
    interface_released: bool,
    configuration_released: bool,
    disabled: bool,
}

pub struct StreamingSession<H: UsbHandle = DeviceHandle<Context>> {
    handle: Arc<H>,
    descriptors: DeviceDescriptors,
    controller: ActivationController,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    detached_interfaces: Vec<u8>,
    max_frame_len: usize,
    stream: Option<BulkStream>,
    closer: StreamCloser,
    sink: Option<Box<dyn Sink>>,
    steps: TeardownSteps,
}

impl<H: UsbHandle> std::fmt::Debug for StreamingSession<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("location", &self.descriptors.location())
            .field("interface", &self.interface)
            .field("endpoint_in", &self.endpoint_in)
            .field("endpoint_out", &self.endpoint_out)
            .field("steps", &self.steps)
            .finish()
    }
}

impl<H: UsbHandle> StreamingSession<H> {
    /// Claim the streaming interface of an activated device
    ///
    /// On failure the device handle is dropped (closed) after any kernel
    /// driver that was detached has been reattached.
    pub fn claim(
        device: OpenDevice<H>,
        settings: &StreamSettings,
        controller: ActivationController,
    ) -> Result<Self, ClaimError> {
        let (mut handle, descriptors) = device.into_parts();
        let location = descriptors.location();

        let config = descriptors
            .configuration(settings.configuration)
            .ok_or(ClaimError::ConfigurationNotFound {
                value: settings.configuration,
            })?;

        let mut matching = config
            .interfaces
            .iter()
            .filter(|i| i.is_vendor_specific() && i.subclass == settings.interface_subclass);
        let iface = matching.next().ok_or(ClaimError::InterfaceNotFound {
            configuration: config.value,
            subclass: settings.interface_subclass,
        })?;
        if matching.next().is_some() {
            warn!(
                "More than one streaming interface on {}, using interface {}",
                location, iface.number
            );
        }

        let endpoint_in = iface
            .find_endpoint(Direction::In, TransferKind::Bulk)
            .ok_or(ClaimError::EndpointNotFound {
                interface: iface.number,
                direction: Direction::In,
            })?;
        let endpoint_out = iface
            .find_endpoint(Direction::Out, TransferKind::Bulk)
            .ok_or(ClaimError::EndpointNotFound {
                interface: iface.number,
                direction: Direction::Out,
            })?;
        let interface = iface.number;

        match handle.active_configuration() {
            Ok(active) if active == settings.configuration => {
                debug!("Configuration {} already active on {}", active, location);
            }
            _ => {
                handle
                    .set_active_configuration(settings.configuration)
                    .map_err(|source| ClaimError::Usb {
                        action: "selecting configuration",
                        source,
                    })?;
                debug!(
                    "Selected configuration {} on {}",
                    settings.configuration, location
                );
            }
        }

        let mut detached_interfaces = Vec::new();
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => detached_interfaces.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        if let Err(source) = handle.claim_interface(interface) {
            reattach(&mut handle, &detached_interfaces);
            return Err(ClaimError::Usb {
                action: "claiming interface",
                source,
            });
        }
        debug!("Claimed interface {} on {}", interface, location);

        let handle = Arc::new(handle);
        let stream = match BulkStream::start(
            handle.clone(),
            BulkStreamConfig {
                endpoint: endpoint_in,
                transfer_size: settings.transfer_size,
                depth: settings.transfer_depth,
                read_timeout: settings.read_timeout(),
            },
        ) {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(mut handle) = Arc::into_inner(handle) {
                    if let Err(e) = handle.release_interface(interface) {
                        warn!("Failed to release interface {}: {}", interface, e);
                    }
                    reattach(&mut handle, &detached_interfaces);
                }
                return Err(ClaimError::Io(e));
            }
        };
        let closer = stream.closer();

        info!(
            "Streaming interface {} claimed on {} (in {:#04x}, out {:#04x})",
            interface, location, endpoint_in, endpoint_out
        );

        Ok(Self {
            handle,
            descriptors,
            controller,
            interface,
            endpoint_in,
            endpoint_out,
            detached_interfaces,
            max_frame_len: settings.max_frame_len,
            stream: Some(stream),
            closer,
            sink: None,
            steps: TeardownSteps::default(),
        })
    }

    pub fn descriptors(&self) -> &DeviceDescriptors {
        &self.descriptors
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn endpoints(&self) -> (u8, u8) {
        (self.endpoint_in, self.endpoint_out)
    }

    /// Handle that cancels a running (or future) [`Self::run`]
    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    /// Deframe the bulk stream into `sink` until it fails or is closed
    ///
    /// There is no cancellation check in the loop: closing the stream makes
    /// the next blocked read fail, and a failure after close is reported as a
    /// cancelled run. Frames already buffered when the stream is closed may
    /// still be delivered.
    pub fn run(&mut self, sink: Box<dyn Sink>) -> Result<RunSummary, StreamError> {
        if self.steps.stream_closed {
            return Err(StreamError::TornDown);
        }
        let stream = self.stream.as_mut().ok_or(StreamError::TornDown)?;
        let sink = self.sink.insert(sink);

        let mut reader = FrameReader::with_max_frame_len(stream, self.max_frame_len);
        info!("Streaming from {}", self.descriptors.location());

        loop {
            let payload = match reader.read_frame() {
                Ok(payload) => payload,
                Err(e) if self.closer.is_closed() => {
                    debug!("Read ended after close: {}", e);
                    return Ok(cancelled_summary(&reader));
                }
                Err(source) => {
                    return Err(StreamError::Frame {
                        frames: reader.frames_read(),
                        source,
                    });
                }
            };

            if let Err(e) = sink.write(&payload) {
                // the sink may shut down on the same signal that closed us
                if self.closer.is_closed() {
                    debug!("Sink write failed after close: {}", e);
                    return Ok(cancelled_summary(&reader));
                }
                return Err(e.into());
            }
        }
    }

    /// Send bytes to the device's bulk OUT endpoint; failures are only logged
    pub fn write_to_device(&self, data: &[u8]) {
        match self
            .handle
            .write_bulk(self.endpoint_out, data, DEFAULT_TIMEOUT)
        {
            Ok(n) if n < data.len() => {
                warn!("Short bulk OUT write: {} of {} bytes", n, data.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Bulk OUT write failed: {}", e),
        }
    }

    /// Release everything in order: sink, stream, interface, configuration,
    /// activation
    ///
    /// Failures are logged and never stop later steps. Calling this again is
    /// a no-op.
    pub fn teardown(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            debug!("Stopping sink");
            if let Err(e) = sink.stop() {
                warn!("Failed to stop sink: {}", e);
            }
        }

        if !self.steps.stream_closed {
            self.steps.stream_closed = true;
            self.closer.close();
            if let Some(mut stream) = self.stream.take() {
                stream.join();
            }
            debug!("Bulk stream closed");
        }

        let location = self.descriptors.location();
        let interface = self.interface;
        let Some(handle) = Arc::get_mut(&mut self.handle) else {
            warn!("Device handle for {} still shared, skipping release", location);
            return;
        };

        if !self.steps.interface_released {
            self.steps.interface_released = true;
            match handle.release_interface(interface) {
                Ok(()) => debug!("Released interface {}", interface),
                Err(e) => warn!("Failed to release interface {}: {}", interface, e),
            }
        }

        if !self.steps.configuration_released {
            self.steps.configuration_released = true;
            reattach(handle, &self.detached_interfaces);
        }

        if !self.steps.disabled {
            self.steps.disabled = true;
            match self.controller.disable_handle(handle) {
                Ok(()) => info!("Disabled streaming configuration on {}", location),
                Err(e) => warn!("Failed to disable {}: {}", location, e),
            }
        }
    }
}

impl<H: UsbHandle> Drop for StreamingSession<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn cancelled_summary<R: std::io::Read>(reader: &FrameReader<R>) -> RunSummary {
    let summary = RunSummary {
        frames: reader.frames_read(),
        bytes: reader.bytes_read(),
        cancelled: true,
    };
    info!(
        frames = summary.frames,
        bytes = summary.bytes,
        "Streaming cancelled"
    );
    summary
}

fn reattach<H: UsbHandle>(handle: &mut H, interfaces: &[u8]) {
    for &interface in interfaces {
        match handle.attach_kernel_driver(interface) {
            Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
            Err(e) => debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        FakeUsbHandle, RecordingSink, activated_descriptors, candidate_descriptors,
    };
    use common::test_utils::capture_logs;

    fn settings() -> StreamSettings {
        StreamSettings {
            read_timeout_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_requires_configuration() {
        let device = OpenDevice::new(FakeUsbHandle::new(), candidate_descriptors("x"));
        let err = StreamingSession::claim(device, &settings(), ActivationController::default())
            .unwrap_err();
        assert!(matches!(err, ClaimError::ConfigurationNotFound { value: 6 }));
    }

    #[test]
    fn test_claim_requires_interface() {
        let mut descriptors = activated_descriptors("x");
        for config in &mut descriptors.configurations {
            config.interfaces.retain(|i| i.subclass != 0x2A);
        }
        let device = OpenDevice::new(FakeUsbHandle::new(), descriptors);
        let err = StreamingSession::claim(device, &settings(), ActivationController::default())
            .unwrap_err();
        assert!(matches!(err, ClaimError::InterfaceNotFound { .. }));
    }

    #[test]
    fn test_claim_requires_bulk_out() {
        let mut descriptors = activated_descriptors("x");
        for config in &mut descriptors.configurations {
            for iface in &mut config.interfaces {
                iface.endpoints.retain(|ep| ep.direction == Direction::In);
            }
        }
        let handle = FakeUsbHandle::new();
        let view = handle.view();
        let err = StreamingSession::claim(
            OpenDevice::new(handle, descriptors),
            &settings(),
            ActivationController::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::EndpointNotFound {
                direction: Direction::Out,
                ..
            }
        ));
        assert!(view.claimed_interfaces().is_empty());
    }

    #[test]
    fn test_claim_failure_reattaches_kernel_driver() {
        let handle = FakeUsbHandle::new();
        handle.set_kernel_driver_active(true);
        handle.fail_claim(rusb::Error::Busy);
        let view = handle.view();

        let err = StreamingSession::claim(
            OpenDevice::new(handle, activated_descriptors("x")),
            &settings(),
            ActivationController::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ClaimError::Usb { source: rusb::Error::Busy, .. }));
        assert_eq!(view.detached(), vec![3]);
        assert_eq!(view.attached(), vec![3]);
        assert!(view.is_closed());
    }

    #[test]
    fn test_teardown_twice_is_noop() {
        let handle = FakeUsbHandle::new();
        let view = handle.view();
        let mut session = StreamingSession::claim(
            OpenDevice::new(handle, activated_descriptors("x")),
            &settings(),
            ActivationController::default(),
        )
        .unwrap();

        session.teardown();
        session.teardown();
        drop(session);

        assert_eq!(view.released_interfaces(), vec![3]);
        assert_eq!(view.reset_count(), 1);
        assert!(view.is_closed());
    }

    #[test]
    fn test_teardown_continues_past_failures() {
        let handle = FakeUsbHandle::new();
        handle.set_kernel_driver_active(true);
        handle.push_bulk_in(vec![0x0C, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
        handle.disconnect_after_data();
        handle.fail_release(rusb::Error::NoDevice);
        handle.fail_reset(rusb::Error::NoDevice);
        let view = handle.view();

        let mut session = StreamingSession::claim(
            OpenDevice::new(handle, activated_descriptors("x")),
            &settings(),
            ActivationController::default(),
        )
        .unwrap();
        let closer = session.closer();

        let sink = RecordingSink::failing_stop();
        let err = session.run(Box::new(sink.clone())).unwrap_err();
        assert!(matches!(err, StreamError::Frame { frames: 1, .. }));

        let (ctx, logs) = capture_logs();
        ctx.in_scope(|| session.teardown());

        assert_eq!(sink.stop_count(), 1);
        assert!(closer.is_closed());
        // the reader thread holds the handle until joined
        assert_eq!(view.released_interfaces(), vec![3]);
        assert_eq!(view.attached(), vec![3]);
        assert_eq!(view.reset_count(), 1);
        assert!(logs.contains("Failed to stop sink"));
        assert!(logs.contains("Failed to release interface 3"));
        assert!(logs.contains("Failed to disable"));

        session.teardown();
        drop(session);
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(view.released_interfaces(), vec![3]);
        assert_eq!(view.attached(), vec![3]);
        assert_eq!(view.reset_count(), 1);
        assert!(view.is_closed());
    }

    #[test]
    fn test_run_delivers_frames_then_fails_on_short_read() {
        let handle = FakeUsbHandle::new();
        handle.push_bulk_in(vec![0x0C, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
        handle.push_bulk_in(vec![0x08, 0, 0, 0, 0xAA]);
        handle.disconnect_after_data();

        let mut session = StreamingSession::claim(
            OpenDevice::new(handle, activated_descriptors("x")),
            &settings(),
            ActivationController::default(),
        )
        .unwrap();

        let sink = RecordingSink::new();
        let err = session.run(Box::new(sink.clone())).unwrap_err();
        assert!(matches!(err, StreamError::Frame { frames: 1, .. }));
        assert_eq!(sink.frames(), vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);

        session.teardown();
        assert_eq!(sink.stop_count(), 1);
    }

    #[test]
    fn test_write_to_device_logs_failure_only() {
        let handle = FakeUsbHandle::new();
        let view = handle.view();
        let session = StreamingSession::claim(
            OpenDevice::new(handle, activated_descriptors("x")),
            &settings(),
            ActivationController::default(),
        )
        .unwrap();

        session.write_to_device(b"ping");
        assert_eq!(view.bulk_out(), vec![b"ping".to_vec()]);

        view.fail_bulk_out(rusb::Error::Pipe);
        session.write_to_device(b"lost");
        assert_eq!(view.bulk_out().len(), 1);
    }
}
