//! Enabling and disabling the hidden streaming configuration
//!
//! Enabling is a single vendor control request after which the device drops
//! off the bus and comes back with extra interfaces. The handle used to send
//! the request is useless afterwards, so [`ActivationController::enable`]
//! consumes it and [`ActivationController::reconcile_after_enable`] polls for
//! the re-enumerated device.

use crate::config::{ActivationSettings, DisableMode};
use crate::usb::catalog::{ActivationState, CatalogError, DeviceSource};
use crate::usb::device::OpenDevice;
use crate::usb::handle::{DEFAULT_TIMEOUT, UsbHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ActivationError {
    /// The device came back but never exposed the activated interface
    #[error("Device {serial} did not activate after {attempts} attempts")]
    NotActivated { serial: String, attempts: u32 },

    /// The device never came back
    #[error("Device {serial} not found after {attempts} attempts")]
    DeviceNotFound { serial: String, attempts: u32 },

    /// Without a serial number the device cannot be found again
    #[error("Device at {location} has no serial number")]
    NoSerial { location: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Sends the activation control requests and waits for their effect
#[derive(Debug, Clone, Default)]
pub struct ActivationController {
    settings: ActivationSettings,
}

impl ActivationController {
    pub fn new(settings: ActivationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ActivationSettings {
        &self.settings
    }

    /// Ask the device to switch to the streaming configuration
    ///
    /// Failures are only logged: the device often disconnects before it
    /// acknowledges the request.
    pub fn enable<H: UsbHandle>(&self, device: OpenDevice<H>) {
        let location = device.descriptors().location();
        info!("Enabling streaming configuration on {}", location);

        if let Err(e) = device.handle().write_control(
            self.settings.request_type,
            self.settings.request,
            0,
            self.settings.enable_index,
            &[],
            DEFAULT_TIMEOUT,
        ) {
            warn!("Enable control transfer on {} failed: {}", location, e);
        }
    }

    /// Take the device back to its normal configuration
    pub fn disable<H: UsbHandle>(&self, device: &mut OpenDevice<H>) -> rusb::Result<()> {
        self.disable_handle(device.handle_mut())
    }

    /// [`Self::disable`] on a bare handle, as held by a streaming session
    pub fn disable_handle<H: UsbHandle>(&self, handle: &mut H) -> rusb::Result<()> {
        match self.settings.disable_mode {
            DisableMode::Reset => {
                debug!("Resetting device to disable streaming configuration");
                handle.reset()
            }
            DisableMode::Control => self.send_disable_request(handle),
        }
    }

    /// The fine-grained disable request
    pub fn send_disable_request<H: UsbHandle>(&self, handle: &H) -> rusb::Result<()> {
        debug!("Sending disable control request");
        handle
            .write_control(
                self.settings.request_type,
                self.settings.request,
                0,
                self.settings.disable_index,
                &[],
                DEFAULT_TIMEOUT,
            )
            .map(|_| ())
    }

    /// Poll until the device with `serial` reappears activated
    ///
    /// Each attempt waits `poll_interval` first; a device that is back but not
    /// yet activated is closed before the next attempt.
    pub fn reconcile_after_enable<S: DeviceSource>(
        &self,
        source: &S,
        serial: &str,
    ) -> Result<OpenDevice<S::Handle>, ActivationError> {
        let attempts = self.settings.max_poll_attempts;
        let mut seen = false;

        for attempt in 1..=attempts {
            std::thread::sleep(self.settings.poll_interval());

            let device = match source.open_by_serial(serial) {
                Ok(device) => device,
                Err(e) => {
                    warn!(attempt, "Error reopening {}: {}", serial, e);
                    None
                }
            };

            let state = device
                .as_ref()
                .map_or(ActivationState::Unknown, |d| source.classify(d.descriptors()));
            debug!(attempt, %state, "Polled {} after enable", serial);

            match device {
                Some(device) if state == ActivationState::Enabled => {
                    info!("Device {} activated after {} attempt(s)", serial, attempt);
                    return Ok(device);
                }
                Some(device) => {
                    seen = true;
                    drop(device);
                }
                None => {}
            }
        }

        let serial = serial.to_string();
        if seen {
            Err(ActivationError::NotActivated { serial, attempts })
        } else {
            Err(ActivationError::DeviceNotFound { serial, attempts })
        }
    }

    /// Return `device` if already activated, otherwise enable and wait for it
    pub fn ensure_enabled<S: DeviceSource>(
        &self,
        source: &S,
        device: OpenDevice<S::Handle>,
    ) -> Result<OpenDevice<S::Handle>, ActivationError> {
        if source.classify(device.descriptors()) == ActivationState::Enabled {
            debug!("Device {} already activated", device.descriptors().location());
            return Ok(device);
        }

        let serial = device
            .serial()
            .map(str::to_string)
            .ok_or_else(|| ActivationError::NoSerial {
                location: device.descriptors().location(),
            })?;

        self.enable(device);
        self.reconcile_after_enable(source, &serial)
    }
}
