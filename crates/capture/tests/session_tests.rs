//! Streaming session against the fake USB handle
//!
//! Tests:
//! - Deframing the 12-byte reference stream
//! - Cancellation through the stream closer
//! - End-to-end delivery through the sink worker
//! - Teardown with the control-request disable mode

use capture::config::{ActivationSettings, DisableMode, StreamSettings};
use capture::sink::SinkWorker;
use capture::test_utils::{
    FakeUsbHandle, MemoryBackend, RecordingSink, STREAMING_INTERFACE, activated_descriptors,
};
use capture::usb::{ActivationController, OpenDevice, StreamingSession};
use common::ShutdownCoordinator;
use std::time::Duration;

fn settings() -> StreamSettings {
    StreamSettings {
        read_timeout_ms: 10,
        ..Default::default()
    }
}

fn claim(handle: FakeUsbHandle) -> StreamingSession<FakeUsbHandle> {
    StreamingSession::claim(
        OpenDevice::new(handle, activated_descriptors("udid-1")),
        &settings(),
        ActivationController::default(),
    )
    .unwrap()
}

#[test]
fn test_reference_stream_then_cancel() {
    let handle = FakeUsbHandle::new();
    handle.push_bulk_in(vec![0x0C, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 7, 8]);
    let view = handle.view();

    let mut session = claim(handle);
    let closer = session.closer();
    let sink = RecordingSink::new();

    let watcher = {
        let sink = sink.clone();
        std::thread::spawn(move || {
            while sink.frames().is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
            closer.close();
        })
    };

    let summary = session.run(Box::new(sink.clone())).unwrap();
    watcher.join().unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.bytes, 12);
    assert_eq!(sink.frames(), vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);

    drop(session);
    assert_eq!(sink.stop_count(), 1);
    assert_eq!(view.claimed_interfaces(), vec![STREAMING_INTERFACE]);
    assert_eq!(view.released_interfaces(), vec![STREAMING_INTERFACE]);
    assert!(view.is_closed());
}

#[test]
fn test_header_only_frame_is_empty_payload() {
    let handle = FakeUsbHandle::new();
    handle.push_bulk_in(vec![0x04, 0x00, 0x00, 0x00]);
    handle.push_bulk_in(vec![0x05, 0x00, 0x00, 0x00, 0xEE]);
    handle.disconnect_after_data();

    let mut session = claim(handle);
    let sink = RecordingSink::new();
    let err = session.run(Box::new(sink.clone())).unwrap_err();

    assert!(matches!(
        err,
        capture::usb::StreamError::Frame { frames: 2, .. }
    ));
    assert_eq!(sink.frames(), vec![vec![], vec![0xEE]]);
}

#[test]
fn test_closed_before_run_is_cancelled() {
    let mut session = claim(FakeUsbHandle::new());
    session.closer().close();

    let summary = session.run(Box::new(RecordingSink::new())).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.frames, 0);
}

#[test]
fn test_run_after_teardown_fails() {
    let mut session = claim(FakeUsbHandle::new());
    session.teardown();
    assert!(matches!(
        session.run(Box::new(RecordingSink::new())),
        Err(capture::usb::StreamError::TornDown)
    ));
}

#[test]
fn test_claim_selects_configuration() {
    let handle = FakeUsbHandle::new();
    handle.set_active_configuration_value(1);
    let view = handle.view();

    let session = claim(handle);
    assert_eq!(view.active_configuration_value(), 6);
    assert_eq!(session.endpoints(), (0x81, 0x02));
    assert_eq!(session.interface(), STREAMING_INTERFACE);
}

#[test]
fn test_teardown_with_control_disable() {
    let handle = FakeUsbHandle::new();
    handle.set_kernel_driver_active(true);
    let view = handle.view();

    let controller = ActivationController::new(ActivationSettings {
        disable_mode: DisableMode::Control,
        ..Default::default()
    });
    let mut session = StreamingSession::claim(
        OpenDevice::new(handle, activated_descriptors("udid-1")),
        &settings(),
        controller,
    )
    .unwrap();
    session.teardown();

    assert_eq!(view.detached(), vec![STREAMING_INTERFACE]);
    assert_eq!(view.attached(), vec![STREAMING_INTERFACE]);
    assert_eq!(view.reset_count(), 0);
    assert_eq!(view.control_requests(), vec![(0x40, 0x52, 0x00, 0x00)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_reach_backend_through_worker() {
    let coordinator = ShutdownCoordinator::new();
    let backend = MemoryBackend::new();
    let worker = SinkWorker::spawn(
        backend.clone(),
        2,
        Duration::from_millis(10),
        coordinator.subscribe("sink", 2).unwrap(),
    );

    let handle = FakeUsbHandle::new();
    for i in 1..=5u8 {
        handle.push_bulk_in(vec![0x06, 0x00, 0x00, 0x00, i, i]);
    }
    handle.disconnect_after_data();

    let sink = worker.handle();
    let result = tokio::task::spawn_blocking(move || {
        let mut session = claim(handle);
        let result = session.run(Box::new(sink));
        session.teardown();
        result
    })
    .await
    .unwrap();
    assert!(result.is_err());

    let stats = worker.shutdown().await.unwrap();
    assert_eq!(stats.frames, 5);
    assert_eq!(backend.frames()[4], vec![5, 5]);
    assert!(backend.is_closed());
}
