//! Frame sinks
//!
//! The streaming session only sees [`Sink`]: a blocking `write` per frame and
//! a final `stop`. Behind it, [`SinkHandle`] forwards frames over a bounded
//! queue to a [`SinkWorker`] task, which drives one [`Backend`]: a file opened
//! in append mode or an SP PUSH socket.

pub mod file;
pub mod push;
pub mod worker;

pub use file::FileSink;
pub use push::PushSink;
pub use worker::{SinkCommand, SinkHandle, SinkStats, SinkWorker};

use crate::config::{SinkSettings, SinkTarget};
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Push handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: protocol::ProtocolError,
    },

    #[error("Sink is closed")]
    Closed,

    #[error("Sink worker failed: {0}")]
    Worker(String),
}

/// What a streaming session writes frames into
pub trait Sink: Send {
    fn write(&mut self, frame: &[u8]) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<(), SinkError>;
}

/// Async destination driven by the sink worker
pub trait SinkBackend: Send {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn flush(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn describe(&self) -> String;
}

/// The concrete backends
pub enum Backend {
    File(FileSink),
    Push(PushSink),
}

impl Backend {
    /// Open the backend for `settings`
    ///
    /// For the push sink this dials and handshakes once; failing here is
    /// fatal to the caller.
    pub async fn open(settings: &SinkSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        match settings.target()? {
            SinkTarget::File(path) => {
                let sink = FileSink::open(&path)
                    .await
                    .with_context(|| format!("Failed to open output file {}", path.display()))?;
                Ok(Backend::File(sink))
            }
            SinkTarget::Push(addr) => {
                let sink = PushSink::connect(&addr, settings.reconnect_delay())
                    .await
                    .with_context(|| {
                        format!("Failed to set up push socket {}", settings.push_spec)
                    })?;
                Ok(Backend::Push(sink))
            }
        }
    }
}

impl SinkBackend for Backend {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError> {
        match self {
            Backend::File(sink) => sink.send(frame).await,
            Backend::Push(sink) => sink.send(frame).await,
        }
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        match self {
            Backend::File(sink) => sink.flush().await,
            Backend::Push(sink) => sink.flush().await,
        }
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        match self {
            Backend::File(sink) => sink.close().await,
            Backend::Push(sink) => sink.close().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Backend::File(sink) => sink.describe(),
            Backend::Push(sink) => sink.describe(),
        }
    }
}
