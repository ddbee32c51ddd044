//! SP PUSH socket sink
//!
//! Dials a PULL peer over TCP and sends each frame as one SP message. Push
//! semantics: a message that cannot be delivered after one reconnect is
//! dropped with a warning and streaming carries on.

use super::{SinkBackend, SinkError};
use bytes::Bytes;
use protocol::sp::{self, PROTO_PULL, PROTO_PUSH};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub struct PushSink {
    addr: String,
    stream: Option<TcpStream>,
    reconnect_delay: Duration,
    sent: u64,
    dropped: u64,
}

impl PushSink {
    /// Dial `addr` (`host:port`) and complete the SP handshake
    pub async fn connect(addr: &str, reconnect_delay: Duration) -> Result<Self, SinkError> {
        let stream = dial(addr).await?;
        info!("Pushing frames to tcp://{}", addr);
        Ok(Self {
            addr: addr.to_string(),
            stream: Some(stream),
            reconnect_delay,
            sent: 0,
            dropped: 0,
        })
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn try_send(&mut self, message: &[u8]) -> Result<(), SinkError> {
        if self.stream.is_none() {
            tokio::time::sleep(self.reconnect_delay).await;
            self.stream = Some(dial(&self.addr).await?);
            info!("Reconnected to tcp://{}", self.addr);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(SinkError::Closed);
        };
        if let Err(e) = stream.write_all(message).await {
            self.stream = None;
            return Err(SinkError::Io(e));
        }
        Ok(())
    }
}

async fn dial(addr: &str) -> Result<TcpStream, SinkError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| SinkError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }

    sp::handshake_async(&mut stream, PROTO_PUSH, PROTO_PULL)
        .await
        .map_err(|source| SinkError::Handshake {
            addr: addr.to_string(),
            source,
        })?;
    Ok(stream)
}

impl SinkBackend for PushSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError> {
        let message = sp::encode_message(&frame);

        // One reconnect per failed message
        for attempt in 0..2 {
            match self.try_send(&message).await {
                Ok(()) => {
                    self.sent += 1;
                    return Ok(());
                }
                Err(e) if attempt == 0 => debug!("Push send failed, reconnecting: {}", e),
                Err(e) => {
                    self.dropped += 1;
                    warn!(
                        dropped = self.dropped,
                        bytes = frame.len(),
                        "Dropping frame for tcp://{}: {}",
                        self.addr,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(stream) = self.stream.as_mut()
            && let Err(e) = stream.flush().await
        {
            warn!("Flushing push socket failed: {}", e);
            self.stream = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut stream) = self.stream.take() {
            stream.flush().await?;
            if let Err(e) = stream.shutdown().await {
                debug!("Push socket shutdown: {}", e);
            }
        }
        debug!(
            sent = self.sent,
            dropped = self.dropped,
            "Closed push socket tcp://{}",
            self.addr
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("push tcp://{}", self.addr)
    }
}
