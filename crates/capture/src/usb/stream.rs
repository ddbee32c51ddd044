//! Buffered bulk IN stream
//!
//! A dedicated `bulk-in` thread keeps up to `depth` transfers of
//! `transfer_size` bytes queued ahead of the consumer, which reads them back
//! through [`std::io::Read`]. The thread and the consumer meet in a bounded
//! `async_channel`.
//!
//! [`StreamCloser::close`] closes that channel: a consumer blocked in `read`
//! wakes with an error and the thread exits within one read timeout.

use crate::usb::handle::UsbHandle;
use async_channel::{Receiver, Sender};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

type Chunk = Result<Vec<u8>, rusb::Error>;

#[derive(Debug, Clone, Copy)]
pub struct BulkStreamConfig {
    pub endpoint: u8,
    pub transfer_size: usize,
    pub depth: usize,
    pub read_timeout: Duration,
}

/// Cancels a [`BulkStream`] from any thread
#[derive(Clone)]
pub struct StreamCloser {
    closed: Arc<AtomicBool>,
    tx: Sender<Chunk>,
}

impl StreamCloser {
    /// Close the stream; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing bulk stream");
        }
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct BulkStream {
    rx: Receiver<Chunk>,
    closer: StreamCloser,
    pending: Vec<u8>,
    pos: usize,
    thread: Option<JoinHandle<()>>,
}

impl BulkStream {
    /// Start the reader thread on `handle`
    pub fn start<H: UsbHandle>(handle: Arc<H>, config: BulkStreamConfig) -> io::Result<Self> {
        let (tx, rx) = async_channel::bounded(config.depth.max(1));
        let closed = Arc::new(AtomicBool::new(false));

        let thread = {
            let tx = tx.clone();
            let closed = closed.clone();
            common::logging::spawn_thread("bulk-in", move || {
                read_loop(handle.as_ref(), config, &tx, &closed);
                tx.close();
            })?
        };

        Ok(Self {
            rx,
            closer: StreamCloser { closed, tx },
            pending: Vec::new(),
            pos: 0,
            thread: Some(thread),
        })
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Wait for the reader thread to exit; the stream must be closed first
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("bulk-in thread panicked");
        }
    }
}

impl Drop for BulkStream {
    fn drop(&mut self) {
        self.close();
        self.join();
    }
}

fn read_loop<H: UsbHandle>(
    handle: &H,
    config: BulkStreamConfig,
    tx: &Sender<Chunk>,
    closed: &AtomicBool,
) {
    debug!(
        endpoint = config.endpoint,
        transfer_size = config.transfer_size,
        depth = config.depth,
        "bulk-in reader started"
    );

    let mut transfers: u64 = 0;
    while !closed.load(Ordering::SeqCst) {
        let mut buf = vec![0u8; config.transfer_size];
        match handle.read_bulk(config.endpoint, &mut buf, config.read_timeout) {
            Ok(0) => continue,
            Ok(n) => {
                buf.truncate(n);
                transfers += 1;
                trace!(bytes = n, "bulk-in transfer complete");
                if tx.send_blocking(Ok(buf)).is_err() {
                    break;
                }
            }
            Err(rusb::Error::Timeout) => continue,
            Err(rusb::Error::Interrupted) => continue,
            Err(e) => {
                if !closed.load(Ordering::SeqCst) {
                    warn!("Bulk IN transfer failed: {}", e);
                }
                let _ = tx.send_blocking(Err(e));
                break;
            }
        }
    }

    debug!(transfers, "bulk-in reader stopped");
}

impl Read for BulkStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        // Bytes already buffered are handed out even after close
        if self.pos >= self.pending.len() {
            if self.closer.is_closed() {
                return Err(stream_closed());
            }

            match self.rx.recv_blocking() {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(io::Error::other(e)),
                Err(_) if self.closer.is_closed() => return Err(stream_closed()),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "bulk-in reader stopped",
                    ));
                }
            }
        }

        let n = out.len().min(self.pending.len() - self.pos);
        out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "bulk stream closed")
}
