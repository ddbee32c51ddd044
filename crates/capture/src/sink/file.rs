//! Append-only file sink
//!
//! Payloads are written back to back with no delimiters, so the file is the
//! raw concatenation of everything the device sent.

use super::{SinkBackend, SinkError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl FileSink {
    /// Open `path` for appending, creating it if missing
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        info!("Writing frames to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl SinkBackend for FileSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkError> {
        self.writer.write_all(&frame).await?;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        debug!(
            bytes = self.bytes_written,
            "Closed output file {}",
            self.path.display()
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_without_delimiters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");

        let mut sink = FileSink::open(&path).await.unwrap();
        sink.send(Bytes::from_static(b"abc")).await.unwrap();
        sink.send(Bytes::from_static(b"")).await.unwrap();
        sink.send(Bytes::from_static(b"def")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        assert_eq!(sink.bytes_written(), 6);
    }

    #[tokio::test]
    async fn test_existing_content_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        std::fs::write(&path, b"old").unwrap();

        let mut sink = FileSink::open(&path).await.unwrap();
        sink.send(Bytes::from_static(b"new")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"oldnew");
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.bin");

        let mut sink = FileSink::open(&path).await.unwrap();
        sink.close().await.unwrap();
        assert!(path.exists());
        assert_eq!(sink.describe(), format!("file {}", path.display()));
    }
}
