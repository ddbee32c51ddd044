//! One discover → activate → stream attempt
//!
//! The USB work runs on a blocking thread. A watcher task on the runtime holds
//! the `session` shutdown subscription for the duration of the attempt; when a
//! copy arrives it closes whatever bulk stream the attempt has opened, or
//! marks the attempt so the stream is closed as soon as it exists.

use crate::config::CaptureConfig;
use crate::orchestrator::{StartAttempt, StartError};
use crate::sink::{Sink, SinkHandle};
use crate::usb::{
    ActivationController, DeviceCatalog, DeviceSource, Markers, OpenDevice, RunSummary,
    StreamCloser, StreamingSession,
};
use common::ShutdownSubscription;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    closer: Option<StreamCloser>,
}

/// Cancellation point shared between the watcher and the blocking attempt
#[derive(Default)]
pub struct AttemptCancel {
    state: Mutex<CancelState>,
}

impl AttemptCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the attached stream, now or as soon as one is attached
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cancelled = true;
        if let Some(closer) = &state.closer {
            closer.close();
        }
    }

    pub fn attach(&self, closer: StreamCloser) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            closer.close();
        }
        state.closer = Some(closer);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancelled
    }
}

/// Drives attempts for the `--pull` mode
pub struct CapturePipeline {
    config: Arc<CaptureConfig>,
    udid: Option<String>,
    sink: SinkHandle,
    shutdown: ShutdownSubscription,
}

impl CapturePipeline {
    /// `shutdown` is the `session` subscription; each attempt's watcher takes
    /// at most one copy from it
    pub fn new(
        config: Arc<CaptureConfig>,
        udid: Option<String>,
        sink: SinkHandle,
        shutdown: ShutdownSubscription,
    ) -> Self {
        Self {
            config,
            udid,
            sink,
            shutdown,
        }
    }
}

impl StartAttempt for CapturePipeline {
    fn attempt(
        &mut self,
        attempt: u32,
    ) -> impl Future<Output = Result<RunSummary, StartError>> + Send {
        let config = self.config.clone();
        let udid = self.udid.clone();
        let sink = self.sink.clone();
        let shutdown = self.shutdown.clone();

        async move {
            let cancel = Arc::new(AttemptCancel::new());
            let done = CancellationToken::new();

            let watcher = {
                let cancel = cancel.clone();
                let done = done.clone();
                common::logging::spawn(async move {
                    tokio::select! {
                        Some(reason) = shutdown.recv() => {
                            info!(%reason, attempt, "Cancelling streaming attempt");
                            cancel.cancel();
                        }
                        _ = done.cancelled() => {}
                    }
                })
            };

            let result = common::logging::spawn_blocking(move || {
                discover_and_stream(&config, udid.as_deref(), sink, &cancel)
            })
            .await;

            done.cancel();
            let _ = watcher.await;

            result.map_err(|e| StartError::Task(e.to_string()))?
        }
    }
}

/// Blocking body of one attempt against the real bus
pub fn discover_and_stream(
    config: &CaptureConfig,
    udid: Option<&str>,
    sink: SinkHandle,
    cancel: &AttemptCancel,
) -> Result<RunSummary, StartError> {
    let catalog = DeviceCatalog::new(Markers::from(&config.activation))?;

    let device = match udid {
        Some(udid) => catalog.open_by_serial(udid)?,
        None => catalog.open_first(None)?,
    }
    .ok_or_else(|| StartError::NotFound {
        udid: udid.map(str::to_string),
    })?;

    stream_device(&catalog, device, config, sink, cancel)
}

/// Activate `device` if needed, claim it and stream into `sink` until the
/// stream fails or `cancel` fires
///
/// The session is torn down before returning either way.
pub fn stream_device<S, K>(
    source: &S,
    device: OpenDevice<S::Handle>,
    config: &CaptureConfig,
    sink: K,
    cancel: &AttemptCancel,
) -> Result<RunSummary, StartError>
where
    S: DeviceSource,
    K: Sink + 'static,
{
    let controller = ActivationController::new(config.activation.clone());
    let device = controller.ensure_enabled(source, device)?;

    if cancel.is_cancelled() {
        debug!("Attempt cancelled before claiming the device");
        return Ok(RunSummary {
            cancelled: true,
            ..Default::default()
        });
    }

    let mut session = StreamingSession::claim(device, &config.stream, controller)?;
    cancel.attach(session.closer());

    let result = session.run(Box::new(sink));
    session.teardown();
    Ok(result?)
}
