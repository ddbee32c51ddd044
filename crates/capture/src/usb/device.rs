//! USB device abstraction
//!
//! [`DeviceDescriptors`] is a plain snapshot of everything the capture path
//! needs to know about a device; [`OpenDevice`] pairs that snapshot with the
//! open handle. Dropping an `OpenDevice` closes the handle.

use crate::usb::handle::UsbHandle;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use serde::Serialize;
use tracing::debug;

/// USB interface class for vendor-specific interfaces
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

/// Endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub transfer: TransferKind,
}

/// First alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn is_vendor_specific(&self) -> bool {
        self.class == CLASS_VENDOR_SPECIFIC
    }

    /// First endpoint with the given direction and transfer type
    pub fn find_endpoint(&self, direction: Direction, transfer: TransferKind) -> Option<u8> {
        self.endpoints
            .iter()
            .find(|ep| ep.direction == direction && ep.transfer == transfer)
            .map(|ep| ep.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigInfo {
    /// bConfigurationValue
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Descriptor snapshot taken when a device is opened
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceDescriptors {
    pub bus: u8,
    pub address: u8,
    pub port: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub configurations: Vec<ConfigInfo>,
}

impl DeviceDescriptors {
    /// Read identity and configuration descriptors without opening the device
    ///
    /// String descriptors need an open handle; see [`Self::read_strings`].
    pub fn from_device<T: UsbContext>(device: &Device<T>) -> rusb::Result<Self> {
        let desc = device.device_descriptor()?;

        let mut configurations = Vec::with_capacity(desc.num_configurations() as usize);
        for index in 0..desc.num_configurations() {
            match device.config_descriptor(index) {
                Ok(config) => configurations.push(map_config(&config)),
                Err(e) => debug!(
                    "Could not read configuration {} of {:03}:{:03}: {}",
                    index,
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        Ok(Self {
            bus: device.bus_number(),
            address: device.address(),
            port: device.port_number(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            serial: None,
            product: None,
            manufacturer: None,
            configurations,
        })
    }

    /// Fill in serial, product and manufacturer strings
    pub fn read_strings<T: UsbContext>(
        &mut self,
        device: &Device<T>,
        handle: &DeviceHandle<T>,
    ) -> rusb::Result<()> {
        let desc = device.device_descriptor()?;

        self.serial = desc
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        self.product = desc
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        self.manufacturer = desc
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        Ok(())
    }

    /// Subclasses of every vendor-specific interface, across all configurations
    pub fn vendor_subclasses(&self) -> impl Iterator<Item = u8> + '_ {
        self.configurations
            .iter()
            .flat_map(|config| config.interfaces.iter())
            .filter(|iface| iface.is_vendor_specific())
            .map(|iface| iface.subclass)
    }

    pub fn has_vendor_subclass(&self, subclass: u8) -> bool {
        self.vendor_subclasses().any(|s| s == subclass)
    }

    pub fn configuration(&self, value: u8) -> Option<&ConfigInfo> {
        self.configurations.iter().find(|c| c.value == value)
    }

    /// `bus:address` label used in log lines
    pub fn location(&self) -> String {
        format!("{:03}:{:03}", self.bus, self.address)
    }
}

fn map_config(config: &rusb::ConfigDescriptor) -> ConfigInfo {
    let interfaces = config
        .interfaces()
        .filter_map(|iface| {
            let alt = iface.descriptors().next()?;
            Some(InterfaceInfo {
                number: iface.number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                protocol: alt.protocol_code(),
                endpoints: alt
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        direction: match ep.direction() {
                            rusb::Direction::In => Direction::In,
                            rusb::Direction::Out => Direction::Out,
                        },
                        transfer: match ep.transfer_type() {
                            rusb::TransferType::Control => TransferKind::Control,
                            rusb::TransferType::Isochronous => TransferKind::Isochronous,
                            rusb::TransferType::Bulk => TransferKind::Bulk,
                            rusb::TransferType::Interrupt => TransferKind::Interrupt,
                        },
                    })
                    .collect(),
            })
        })
        .collect();

    ConfigInfo {
        value: config.number(),
        interfaces,
    }
}

/// An opened device and the descriptors read when it was opened
pub struct OpenDevice<H: UsbHandle = DeviceHandle<Context>> {
    handle: H,
    descriptors: DeviceDescriptors,
}

impl<H: UsbHandle> std::fmt::Debug for OpenDevice<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDevice")
            .field("location", &self.descriptors.location())
            .field("serial", &self.descriptors.serial)
            .finish()
    }
}

impl<T: UsbContext + 'static> OpenDevice<DeviceHandle<T>> {
    /// Open a libusb device and snapshot its descriptors
    pub fn open(device: &Device<T>) -> rusb::Result<Self> {
        let mut descriptors = DeviceDescriptors::from_device(device)?;
        let handle = device.open()?;
        descriptors.read_strings(device, &handle)?;
        debug!("Opened device {}", descriptors.location());
        Ok(Self {
            handle,
            descriptors,
        })
    }
}

impl<H: UsbHandle> OpenDevice<H> {
    pub fn new(handle: H, descriptors: DeviceDescriptors) -> Self {
        Self {
            handle,
            descriptors,
        }
    }

    pub fn descriptors(&self) -> &DeviceDescriptors {
        &self.descriptors
    }

    pub fn serial(&self) -> Option<&str> {
        self.descriptors.serial.as_deref()
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn into_parts(self) -> (H, DeviceDescriptors) {
        (self.handle, self.descriptors)
    }
}
