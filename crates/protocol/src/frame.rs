//! Bulk stream deframing
//!
//! Once the hidden configuration is active, the device writes a continuous
//! sequence of length-prefixed frames to its bulk IN endpoint:
//!
//! ```text
//! [Length: u32 (little-endian, counts these 4 bytes too)][Payload: Length - 4 bytes]
//! ```
//!
//! A short read at either stage means the stream is unrecoverable; there is no
//! resynchronisation marker to scan for.

use crate::error::{ProtocolError, ReadStage, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read};

/// Size of the length prefix, which is included in the length it carries
pub const HEADER_LEN: usize = 4;

/// Largest frame accepted from the device (32 MiB)
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Turn a raw length field into the payload length that follows it
///
/// Rejects lengths below the header size before subtracting, so a corrupt
/// length can never underflow.
pub fn payload_len(length: u32, max_frame_len: usize) -> Result<usize> {
    let total = length as usize;
    if total < HEADER_LEN {
        return Err(ProtocolError::InvalidLength { length });
    }
    if total > max_frame_len {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: max_frame_len,
        });
    }
    Ok(total - HEADER_LEN)
}

/// Encode a payload the way the device frames it
///
/// # Example
/// ```
/// use protocol::encode_frame;
///
/// let frame = encode_frame(&[1, 2, 3]).unwrap();
/// assert_eq!(frame, vec![7, 0, 0, 0, 1, 2, 3]);
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let total = payload.len() + HEADER_LEN;
    if total > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: u32::MAX as usize,
        });
    }

    let mut frame = vec![0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut frame, total as u32);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a single frame held entirely in memory, returning its payload
///
/// # Example
/// ```
/// use protocol::decode_frame;
///
/// let payload = decode_frame(&[6, 0, 0, 0, 0xAA, 0xBB]).unwrap();
/// assert_eq!(payload, &[0xAA, 0xBB]);
/// ```
pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }

    let length = LittleEndian::read_u32(&frame[..HEADER_LEN]);
    let payload = payload_len(length, MAX_FRAME_LEN)?;

    if frame.len() < HEADER_LEN + payload {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_LEN + payload,
            actual: frame.len(),
        });
    }

    Ok(&frame[HEADER_LEN..HEADER_LEN + payload])
}

/// Pulls frames out of a byte stream
///
/// Reads are blocking and there is deliberately no cancellation check in
/// here: the owner cancels by closing the underlying reader, which makes the
/// next read fail with a [`ProtocolError::ShortRead`].
pub struct FrameReader<R> {
    reader: R,
    max_frame_len: usize,
    frames_read: u64,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader with the default [`MAX_FRAME_LEN`] limit
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, MAX_FRAME_LEN)
    }

    /// Create a reader with a custom frame size limit
    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            max_frame_len,
            frames_read: 0,
            bytes_read: 0,
        }
    }

    /// Read the next frame and return its payload
    ///
    /// # Example
    /// ```
    /// use protocol::FrameReader;
    /// use std::io::Cursor;
    ///
    /// let stream = [0x0C, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
    /// let mut reader = FrameReader::new(Cursor::new(stream));
    /// assert_eq!(reader.read_frame().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    /// assert!(reader.read_frame().is_err());
    /// ```
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        fill(&mut self.reader, &mut header, ReadStage::Header)?;

        let length = LittleEndian::read_u32(&header);
        let len = payload_len(length, self.max_frame_len)?;

        let mut payload = vec![0u8; len];
        fill(&mut self.reader, &mut payload, ReadStage::Payload)?;

        self.frames_read += 1;
        self.bytes_read += (HEADER_LEN + len) as u64;
        Ok(payload)
    }

    /// Number of complete frames read so far
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Number of stream bytes consumed by complete frames
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Fill `buf` completely or report how far we got
fn fill<R: Read>(reader: &mut R, buf: &mut [u8], stage: ReadStage) -> Result<()> {
    let mut received = 0;
    while received < buf.len() {
        match reader.read(&mut buf[received..]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ProtocolError::ShortRead {
                    stage,
                    expected: buf.len(),
                    received,
                    source: Some(e),
                });
            }
        }
    }

    if received < buf.len() {
        return Err(ProtocolError::ShortRead {
            stage,
            expected: buf.len(),
            received,
            source: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `chunk` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_twelve_byte_stream() {
        let stream = vec![0x0C, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        let mut reader = FrameReader::new(Cursor::new(stream));

        let payload = reader.read_frame().unwrap();
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.frames_read(), 1);
        assert_eq!(reader.bytes_read(), 12);
    }

    #[test]
    fn test_header_only_frame_is_empty_payload() {
        let mut reader = FrameReader::new(Cursor::new(vec![4, 0, 0, 0]));
        assert!(reader.read_frame().unwrap().is_empty());
    }

    #[test]
    fn test_length_below_header_rejected() {
        for length in 0u8..4 {
            let mut reader = FrameReader::new(Cursor::new(vec![length, 0, 0, 0, 9, 9, 9]));
            let err = reader.read_frame().unwrap_err();
            assert!(
                matches!(err, ProtocolError::InvalidLength { length: l } if l == length as u32)
            );
        }
    }

    #[test]
    fn test_short_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x0C, 0]));
        let Err(ProtocolError::ShortRead {
            stage, received, ..
        }) = reader.read_frame()
        else {
            panic!("Expected ShortRead");
        };
        assert_eq!(stage, ReadStage::Header);
        assert_eq!(received, 2);
    }

    #[test]
    fn test_short_payload() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x0C, 0, 0, 0, 1, 2, 3]));
        let Err(ProtocolError::ShortRead {
            stage,
            expected,
            received,
            ..
        }) = reader.read_frame()
        else {
            panic!("Expected ShortRead");
        };
        assert_eq!(stage, ReadStage::Payload);
        assert_eq!(expected, 8);
        assert_eq!(received, 3);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut data = encode_frame(b"hello").unwrap();
        data.extend(encode_frame(b"").unwrap());
        data.extend(encode_frame(&[0xAB; 300]).unwrap());

        let mut reader = FrameReader::new(Trickle {
            data,
            pos: 0,
            chunk: 3,
        });

        assert_eq!(reader.read_frame().unwrap(), b"hello");
        assert!(reader.read_frame().unwrap().is_empty());
        assert_eq!(reader.read_frame().unwrap(), vec![0xAB; 300]);
        assert!(reader.read_frame().unwrap_err().is_short_read());
    }

    #[test]
    fn test_frame_too_large() {
        let mut reader =
            FrameReader::with_max_frame_len(Cursor::new(vec![0xFF, 0xFF, 0, 0]), 1024);
        assert!(matches!(
            reader.read_frame(),
            Err(ProtocolError::FrameTooLarge { size: 0xFFFF, max: 1024 })
        ));
    }

    #[test]
    fn test_read_error_is_short_read_with_source() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "closed"))
            }
        }

        let mut reader = FrameReader::new(Broken);
        let Err(ProtocolError::ShortRead { source, .. }) = reader.read_frame() else {
            panic!("Expected ShortRead");
        };
        assert_eq!(
            source.map(|e| e.kind()),
            Some(io::ErrorKind::ConnectionAborted)
        );
    }

    #[test]
    fn test_decode_frame_incomplete() {
        let result = decode_frame(&[10, 0, 0, 0, 1]);
        let Err(ProtocolError::IncompleteFrame { expected, actual }) = result else {
            panic!("Expected IncompleteFrame error, got {:?}", result);
        };
        assert_eq!(expected, 10);
        assert_eq!(actual, 5);
    }

    #[test]
    fn test_payload_len_boundaries() {
        assert_eq!(payload_len(4, MAX_FRAME_LEN).unwrap(), 0);
        assert_eq!(payload_len(5, MAX_FRAME_LEN).unwrap(), 1);
        assert!(payload_len(3, MAX_FRAME_LEN).is_err());
        assert!(payload_len(0, MAX_FRAME_LEN).is_err());
    }
}
