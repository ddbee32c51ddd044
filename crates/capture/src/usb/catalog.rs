//! Device discovery and activation-state classification
//!
//! A candidate is any device exposing a vendor-specific interface with the
//! candidate subclass. Whether the hidden streaming configuration is active is
//! read off the same descriptors: an activated device also exposes a
//! vendor-specific interface with the activated subclass.

use crate::config::ActivationSettings;
use crate::usb::device::{DeviceDescriptors, OpenDevice};
use crate::usb::handle::UsbHandle;
use rusb::{Context, DeviceHandle, UsbContext};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    /// libusb could not be initialised or queried
    #[error("USB enumeration failed: {0}")]
    Enumeration(#[source] rusb::Error),

    #[error("USB error on device {location}: {source}")]
    Usb {
        location: String,
        #[source]
        source: rusb::Error,
    },
}

/// Whether the hidden streaming configuration is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    Disabled,
    Enabled,
    /// The device could not be found, typically while it re-enumerates
    Unknown,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationState::Disabled => f.write_str("disabled"),
            ActivationState::Enabled => f.write_str("enabled"),
            ActivationState::Unknown => f.write_str("unknown"),
        }
    }
}

/// Interface subclasses used to recognise devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markers {
    pub candidate_subclass: u8,
    pub activated_subclass: u8,
}

impl Default for Markers {
    fn default() -> Self {
        Self::from(&ActivationSettings::default())
    }
}

impl From<&ActivationSettings> for Markers {
    fn from(settings: &ActivationSettings) -> Self {
        Self {
            candidate_subclass: settings.candidate_subclass,
            activated_subclass: settings.activated_subclass,
        }
    }
}

impl Markers {
    pub fn is_candidate(&self, descriptors: &DeviceDescriptors) -> bool {
        descriptors.has_vendor_subclass(self.candidate_subclass)
    }

    /// Pure scan of the interface descriptors
    pub fn classify(&self, descriptors: &DeviceDescriptors) -> ActivationState {
        if descriptors.has_vendor_subclass(self.activated_subclass) {
            ActivationState::Enabled
        } else {
            ActivationState::Disabled
        }
    }
}

/// Listing entry for one candidate device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub port: u8,
    pub serial: Option<String>,
    pub product: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub state: ActivationState,
}

/// Anything that can reopen a device by serial number
///
/// Activation reconciliation polls through this so it can run without
/// hardware.
pub trait DeviceSource {
    type Handle: UsbHandle;

    fn open_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<OpenDevice<Self::Handle>>, CatalogError>;

    fn classify(&self, descriptors: &DeviceDescriptors) -> ActivationState;
}

/// Enumerates and opens candidate devices
pub struct DeviceCatalog<T: UsbContext = Context> {
    context: T,
    markers: Markers,
}

impl DeviceCatalog<Context> {
    /// Create a catalog on a fresh libusb context
    pub fn new(markers: Markers) -> Result<Self, CatalogError> {
        let context = Context::new().map_err(CatalogError::Enumeration)?;
        Ok(Self::with_context(context, markers))
    }
}

impl<T: UsbContext + 'static> DeviceCatalog<T> {
    pub fn with_context(context: T, markers: Markers) -> Self {
        Self { context, markers }
    }

    pub fn markers(&self) -> Markers {
        self.markers
    }

    /// Open every attached candidate, activated or not
    ///
    /// Devices that cannot be opened or described are logged and skipped.
    pub fn list_candidates(&self) -> Result<Vec<OpenDevice<DeviceHandle<T>>>, CatalogError> {
        let devices = self.context.devices().map_err(CatalogError::Enumeration)?;

        let mut candidates = Vec::new();
        for device in devices.iter() {
            let location = format!("{:03}:{:03}", device.bus_number(), device.address());

            let descriptors = match DeviceDescriptors::from_device(&device) {
                Ok(d) => d,
                Err(e) => {
                    debug!("Skipping {}: cannot read descriptors: {}", location, e);
                    continue;
                }
            };
            if !self.markers.is_candidate(&descriptors) {
                continue;
            }

            match OpenDevice::open(&device) {
                Ok(open) => candidates.push(open),
                Err(e) => warn!("Failed to open candidate device {}: {}", location, e),
            }
        }

        debug!("Found {} candidate device(s)", candidates.len());
        Ok(candidates)
    }

    pub fn classify(&self, descriptors: &DeviceDescriptors) -> ActivationState {
        self.markers.classify(descriptors)
    }

    /// Open the candidate with this serial number, closing every other one
    ///
    /// An enumeration failure is logged and reported as "not found".
    pub fn open_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<OpenDevice<DeviceHandle<T>>>, CatalogError> {
        let candidates = match self.list_candidates() {
            Ok(c) => c,
            Err(e) => {
                warn!("Error finding devices: {}", e);
                return Ok(None);
            }
        };

        Ok(select_by_serial(candidates, serial))
    }

    /// Open the first candidate in `filter` state (any state when `None`)
    pub fn open_first(
        &self,
        filter: Option<ActivationState>,
    ) -> Result<Option<OpenDevice<DeviceHandle<T>>>, CatalogError> {
        let candidates = self.list_candidates()?;
        Ok(select_first(candidates, filter, &self.markers))
    }

    pub fn describe<H: UsbHandle>(&self, device: &OpenDevice<H>) -> DeviceSummary {
        describe(device.descriptors(), &self.markers)
    }
}

impl<T: UsbContext + 'static> DeviceSource for DeviceCatalog<T> {
    type Handle = DeviceHandle<T>;

    fn open_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<OpenDevice<Self::Handle>>, CatalogError> {
        DeviceCatalog::open_by_serial(self, serial)
    }

    fn classify(&self, descriptors: &DeviceDescriptors) -> ActivationState {
        self.markers.classify(descriptors)
    }
}

/// Keep the device whose serial matches; the rest are closed on return
pub fn select_by_serial<H: UsbHandle>(
    candidates: Vec<OpenDevice<H>>,
    serial: &str,
) -> Option<OpenDevice<H>> {
    let mut found = None;
    for device in candidates {
        if found.is_none() && device.serial() == Some(serial) {
            info!("Found device {} at {}", serial, device.descriptors().location());
            found = Some(device);
        }
    }
    found
}

/// Keep the first device in `filter` state; the rest are closed on return
pub fn select_first<H: UsbHandle>(
    candidates: Vec<OpenDevice<H>>,
    filter: Option<ActivationState>,
    markers: &Markers,
) -> Option<OpenDevice<H>> {
    candidates
        .into_iter()
        .find(|device| filter.is_none_or(|want| markers.classify(device.descriptors()) == want))
}

pub fn describe(descriptors: &DeviceDescriptors, markers: &Markers) -> DeviceSummary {
    DeviceSummary {
        bus: descriptors.bus,
        address: descriptors.address,
        port: descriptors.port,
        serial: descriptors.serial.clone(),
        product: descriptors.product.clone(),
        vendor_id: descriptors.vendor_id,
        product_id: descriptors.product_id,
        state: markers.classify(descriptors),
    }
}
