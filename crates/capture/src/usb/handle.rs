//! The slice of `rusb::DeviceHandle` the capture path uses
//!
//! Everything above this trait (activation, session, bulk stream) is generic
//! over it, so the whole claim/stream/teardown path runs against
//! [`crate::test_utils::FakeUsbHandle`] in tests.

use rusb::{DeviceHandle, UsbContext};
use std::time::Duration;

/// Default timeout for control and bulk OUT transfers
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub trait UsbHandle: Send + Sync + 'static {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn active_configuration(&self) -> rusb::Result<u8>;

    fn set_active_configuration(&mut self, config: u8) -> rusb::Result<()>;

    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()>;

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()>;

    fn reset(&mut self) -> rusb::Result<()>;
}

impl<T: UsbContext + 'static> UsbHandle for DeviceHandle<T> {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }

    fn active_configuration(&self) -> rusb::Result<u8> {
        DeviceHandle::active_configuration(self)
    }

    fn set_active_configuration(&mut self, config: u8) -> rusb::Result<()> {
        DeviceHandle::set_active_configuration(self, config)
    }

    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool> {
        DeviceHandle::kernel_driver_active(self, iface)
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, iface)
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, iface)
    }

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, iface)
    }

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, iface)
    }

    fn reset(&mut self) -> rusb::Result<()> {
        DeviceHandle::reset(self)
    }
}
