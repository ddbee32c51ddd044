//! Hardware-free doubles for the capture path
//!
//! [`FakeUsbHandle`] scripts bulk IN data and records every request made on
//! it. Clones are not handed out: [`FakeUsbHandle::view`] returns a
//! non-owning view so a test can inspect a handle after giving it away, and
//! only dropping the owner marks the handle closed.

use crate::sink::{Sink, SinkBackend, SinkError};
use crate::usb::catalog::{ActivationState, CatalogError, DeviceSource, Markers};
use crate::usb::device::{
    CLASS_VENDOR_SPECIFIC, ConfigInfo, DeviceDescriptors, Direction, EndpointInfo, InterfaceInfo,
    OpenDevice, TransferKind,
};
use crate::usb::handle::UsbHandle;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Configuration value the activated device exposes the streaming interface in
pub const STREAMING_CONFIGURATION: u8 = 6;

/// Interface number of the streaming interface in [`activated_descriptors`]
pub const STREAMING_INTERFACE: u8 = 3;

#[derive(Debug)]
struct FakeState {
    bulk_in: VecDeque<Vec<u8>>,
    disconnected: bool,
    active_configuration: u8,
    kernel_driver_active: bool,
    control_error: Option<rusb::Error>,
    claim_error: Option<rusb::Error>,
    bulk_out_error: Option<rusb::Error>,
    release_error: Option<rusb::Error>,
    reset_error: Option<rusb::Error>,
    control_requests: Vec<(u8, u8, u16, u16)>,
    resets: usize,
    detached: Vec<u8>,
    attached: Vec<u8>,
    claimed: Vec<u8>,
    released: Vec<u8>,
    bulk_out: Vec<Vec<u8>>,
    closed: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            bulk_in: VecDeque::new(),
            disconnected: false,
            active_configuration: STREAMING_CONFIGURATION,
            kernel_driver_active: false,
            control_error: None,
            claim_error: None,
            bulk_out_error: None,
            release_error: None,
            reset_error: None,
            control_requests: Vec::new(),
            resets: 0,
            detached: Vec::new(),
            attached: Vec::new(),
            claimed: Vec::new(),
            released: Vec::new(),
            bulk_out: Vec::new(),
            closed: false,
        }
    }
}

/// Scripted [`UsbHandle`]
#[derive(Debug)]
pub struct FakeUsbHandle {
    state: Arc<Mutex<FakeState>>,
    owner: bool,
}

impl Default for FakeUsbHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUsbHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            owner: true,
        }
    }

    /// A view on the same state that does not close the handle when dropped
    pub fn view(&self) -> Self {
        Self {
            state: self.state.clone(),
            owner: false,
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one bulk IN transfer
    pub fn push_bulk_in(&self, chunk: Vec<u8>) {
        self.state().bulk_in.push_back(chunk);
    }

    /// Fail bulk IN with `NoDevice` once the queued data is consumed
    pub fn disconnect_after_data(&self) {
        self.state().disconnected = true;
    }

    pub fn fail_control(&self, error: rusb::Error) {
        self.state().control_error = Some(error);
    }

    pub fn fail_claim(&self, error: rusb::Error) {
        self.state().claim_error = Some(error);
    }

    pub fn fail_bulk_out(&self, error: rusb::Error) {
        self.state().bulk_out_error = Some(error);
    }

    /// Record releases but fail them with `error`
    pub fn fail_release(&self, error: rusb::Error) {
        self.state().release_error = Some(error);
    }

    /// Count resets but fail them with `error`
    pub fn fail_reset(&self, error: rusb::Error) {
        self.state().reset_error = Some(error);
    }

    pub fn set_kernel_driver_active(&self, active: bool) {
        self.state().kernel_driver_active = active;
    }

    pub fn set_active_configuration_value(&self, value: u8) {
        self.state().active_configuration = value;
    }

    /// `(request_type, request, value, index)` of every control transfer
    pub fn control_requests(&self) -> Vec<(u8, u8, u16, u16)> {
        self.state().control_requests.clone()
    }

    pub fn reset_count(&self) -> usize {
        self.state().resets
    }

    pub fn detached(&self) -> Vec<u8> {
        self.state().detached.clone()
    }

    pub fn attached(&self) -> Vec<u8> {
        self.state().attached.clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }

    pub fn released_interfaces(&self) -> Vec<u8> {
        self.state().released.clone()
    }

    pub fn bulk_out(&self) -> Vec<Vec<u8>> {
        self.state().bulk_out.clone()
    }

    pub fn active_configuration_value(&self) -> u8 {
        self.state().active_configuration
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Drop for FakeUsbHandle {
    fn drop(&mut self) {
        if self.owner {
            self.state().closed = true;
        }
    }
}

impl UsbHandle for FakeUsbHandle {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.state();
        state
            .control_requests
            .push((request_type, request, value, index));
        match state.control_error {
            Some(e) => Err(e),
            None => Ok(data.len()),
        }
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        {
            let mut state = self.state();
            if let Some(mut chunk) = state.bulk_in.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.bulk_in.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            if state.disconnected {
                return Err(rusb::Error::NoDevice);
            }
        }

        std::thread::sleep(timeout);
        Err(rusb::Error::Timeout)
    }

    fn write_bulk(&self, _endpoint: u8, buf: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state();
        if let Some(e) = state.bulk_out_error {
            return Err(e);
        }
        state.bulk_out.push(buf.to_vec());
        Ok(buf.len())
    }

    fn active_configuration(&self) -> rusb::Result<u8> {
        Ok(self.state().active_configuration)
    }

    fn set_active_configuration(&mut self, config: u8) -> rusb::Result<()> {
        self.state().active_configuration = config;
        Ok(())
    }

    fn kernel_driver_active(&self, _iface: u8) -> rusb::Result<bool> {
        Ok(self.state().kernel_driver_active)
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.state();
        state.kernel_driver_active = false;
        state.detached.push(iface);
        Ok(())
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.state();
        state.kernel_driver_active = true;
        state.attached.push(iface);
        Ok(())
    }

    fn claim_interface(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.state();
        if let Some(e) = state.claim_error {
            return Err(e);
        }
        state.claimed.push(iface);
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> rusb::Result<()> {
        let mut state = self.state();
        state.released.push(iface);
        match state.release_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn reset(&mut self) -> rusb::Result<()> {
        let mut state = self.state();
        state.resets += 1;
        match state.reset_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// [`DeviceSource`] that answers successive polls from a script
///
/// `None` entries (and polls past the end of the script) report the device
/// as absent.
pub struct FakeDeviceSource {
    script: Mutex<VecDeque<Option<DeviceDescriptors>>>,
    polls: AtomicU32,
    opened: Mutex<Vec<FakeUsbHandle>>,
    markers: Markers,
}

impl FakeDeviceSource {
    pub fn new(script: Vec<Option<DeviceDescriptors>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            polls: AtomicU32::new(0),
            opened: Mutex::new(Vec::new()),
            markers: Markers::default(),
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// How many of the handles handed out have been closed
    pub fn closed(&self) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|view| view.is_closed())
            .count()
    }
}

impl DeviceSource for FakeDeviceSource {
    type Handle = FakeUsbHandle;

    fn open_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<OpenDevice<Self::Handle>>, CatalogError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .flatten();
        let Some(descriptors) = next.filter(|d| d.serial.as_deref() == Some(serial)) else {
            return Ok(None);
        };

        let handle = FakeUsbHandle::new();
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.view());
        Ok(Some(OpenDevice::new(handle, descriptors)))
    }

    fn classify(&self, descriptors: &DeviceDescriptors) -> ActivationState {
        self.markers.classify(descriptors)
    }
}

/// [`Sink`] that keeps every frame in memory
#[derive(Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    stops: Arc<AtomicUsize>,
    fail_writes: bool,
    fail_stop: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every frame with [`SinkError::Closed`]
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Counts stops but fails them with [`SinkError::Closed`]
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Sink for RecordingSink {
    fn write(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        if self.fail_writes {
            return Err(SinkError::Closed);
        }
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame.to_vec());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(SinkError::Closed);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    frames: Vec<Vec<u8>>,
    flushes: usize,
    closed: bool,
}

/// [`SinkBackend`] that keeps every frame in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().frames.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl SinkBackend for MemoryBackend {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.frames.push(frame.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.state().flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.state().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

fn interface(number: u8, class: u8, subclass: u8, endpoints: Vec<EndpointInfo>) -> InterfaceInfo {
    InterfaceInfo {
        number,
        class,
        subclass,
        protocol: 0,
        endpoints,
    }
}

fn bulk(address: u8, direction: Direction) -> EndpointInfo {
    EndpointInfo {
        address,
        direction,
        transfer: TransferKind::Bulk,
    }
}

/// A phone with only its normal configuration
pub fn candidate_descriptors(serial: &str) -> DeviceDescriptors {
    DeviceDescriptors {
        bus: 1,
        address: 12,
        port: 3,
        vendor_id: 0x05AC,
        product_id: 0x12A8,
        serial: Some(serial.to_string()),
        product: Some("iPhone".to_string()),
        manufacturer: Some("Apple Inc.".to_string()),
        configurations: vec![ConfigInfo {
            value: 1,
            interfaces: vec![
                interface(0, 0x06, 0x01, vec![]),
                interface(1, CLASS_VENDOR_SPECIFIC, 0xFE, vec![]),
            ],
        }],
    }
}

/// The same phone after the streaming configuration was enabled
pub fn activated_descriptors(serial: &str) -> DeviceDescriptors {
    let mut descriptors = candidate_descriptors(serial);
    descriptors.configurations.push(ConfigInfo {
        value: STREAMING_CONFIGURATION,
        interfaces: vec![
            interface(1, CLASS_VENDOR_SPECIFIC, 0xFE, vec![]),
            interface(
                STREAMING_INTERFACE,
                CLASS_VENDOR_SPECIFIC,
                0x2A,
                vec![bulk(0x81, Direction::In), bulk(0x02, Direction::Out)],
            ),
        ],
    });
    descriptors
}
