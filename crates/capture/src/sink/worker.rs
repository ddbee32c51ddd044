//! Sink worker
//!
//! Frames cross from the blocking session thread to the async backend through
//! a bounded `async_channel`, the same bridge the bulk reader feeds the
//! session with. The worker owns the `sink` shutdown subscription and consumes
//! both of its copies:
//!
//! - the drain watcher queues [`SinkCommand::Stop`] behind any pending frames,
//! - the flush ticker stops ticking.

use super::{Sink, SinkBackend, SinkError};
use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use common::ShutdownSubscription;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages from sink handles to the worker
#[derive(Debug)]
pub enum SinkCommand {
    Frame(Bytes),
    Flush,
    /// Close the backend after everything queued before it
    Stop,
}

/// Counters reported when the worker finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub frames: u64,
    pub bytes: u64,
    pub flushes: u64,
    pub errors: u64,
}

pub struct SinkWorker {
    tx: Sender<SinkCommand>,
    drain: JoinHandle<Result<SinkStats, SinkError>>,
    watcher: JoinHandle<()>,
    ticker: JoinHandle<()>,
    description: String,
}

impl SinkWorker {
    /// Spawn the worker tasks on the current runtime
    pub fn spawn<B>(
        backend: B,
        queue_depth: usize,
        flush_interval: Duration,
        shutdown: ShutdownSubscription,
    ) -> Self
    where
        B: SinkBackend + 'static,
    {
        let description = backend.describe();
        let (tx, rx) = async_channel::bounded(queue_depth.max(1));

        let drain = common::logging::spawn(drain(backend, rx));

        // First copy: queue the final stop behind pending frames
        let watcher = {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            common::logging::spawn(async move {
                if shutdown.recv().await.is_some() {
                    debug!("Sink received shutdown, queueing stop");
                    let _ = tx.send(SinkCommand::Stop).await;
                }
            })
        };

        // Second copy: stop the periodic flush
        let ticker = {
            let tx = tx.clone();
            common::logging::spawn(async move {
                if flush_interval.is_zero() {
                    return;
                }
                let mut interval = tokio::time::interval(flush_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(TrySendError::Closed(_)) = tx.try_send(SinkCommand::Flush) {
                                break;
                            }
                        }
                        Some(_) = shutdown.recv() => {
                            debug!("Flush ticker stopping");
                            break;
                        }
                    }
                }
            })
        };

        info!("Sink worker started ({})", description);
        Self {
            tx,
            drain,
            watcher,
            ticker,
            description,
        }
    }

    /// A session-facing handle onto the queue
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
            stopped: false,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Stop the backend after the queue drains and wait for it
    pub async fn shutdown(self) -> Result<SinkStats, SinkError> {
        // The drain watcher may already have queued a stop
        let _ = self.tx.send(SinkCommand::Stop).await;

        let result = match self.drain.await {
            Ok(result) => result,
            Err(e) => Err(SinkError::Worker(e.to_string())),
        };
        self.watcher.abort();
        self.ticker.abort();

        if let Ok(stats) = &result {
            info!(
                frames = stats.frames,
                bytes = stats.bytes,
                "Sink worker finished ({})",
                self.description
            );
        }
        result
    }
}

async fn drain<B: SinkBackend>(
    mut backend: B,
    rx: Receiver<SinkCommand>,
) -> Result<SinkStats, SinkError> {
    let mut stats = SinkStats::default();

    while let Ok(command) = rx.recv().await {
        match command {
            SinkCommand::Frame(frame) => {
                let len = frame.len() as u64;
                match backend.send(frame).await {
                    Ok(()) => {
                        stats.frames += 1;
                        stats.bytes += len;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        warn!("Sink write failed: {}", e);
                    }
                }
            }
            SinkCommand::Flush => {
                stats.flushes += 1;
                if let Err(e) = backend.flush().await {
                    stats.errors += 1;
                    warn!("Sink flush failed: {}", e);
                }
            }
            SinkCommand::Stop => break,
        }
    }

    rx.close();
    backend.close().await?;
    Ok(stats)
}

/// Blocking [`Sink`] for a streaming session
///
/// Stopping a handle only detaches it and requests a flush; the worker keeps
/// running for the next session.
#[derive(Clone)]
pub struct SinkHandle {
    tx: Sender<SinkCommand>,
    stopped: bool,
}

impl Sink for SinkHandle {
    fn write(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        if self.stopped {
            return Err(SinkError::Closed);
        }
        self.tx
            .send_blocking(SinkCommand::Frame(Bytes::copy_from_slice(frame)))
            .map_err(|_| SinkError::Closed)
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        match self.tx.try_send(SinkCommand::Flush) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}
