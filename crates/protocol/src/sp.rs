//! Scalability-protocol framing for the push sink
//!
//! The push sink speaks the nanomsg/NNG "SP over TCP" wire format so a nanomsg, NNG or
//! mangos PULL socket can consume frames directly.
//!
//! ```text
//! Handshake (each side, once): 00 'S' 'P' 00 [protocol: u16 BE] 00 00
//! Message:                     [Length: u64 (big-endian)][Body]
//! ```

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Length of the connection header exchanged by both peers
pub const SP_HEADER_LEN: usize = 8;

/// Length of the per-message size prefix
pub const SP_LENGTH_LEN: usize = 8;

/// SP protocol number of a PUSH socket
pub const PROTO_PUSH: u16 = 0x0050;

/// SP protocol number of a PULL socket
pub const PROTO_PULL: u16 = 0x0051;

/// Largest message accepted by [`read_message_async`] (32 MiB)
pub const MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Build the connection header announcing `protocol`
pub fn handshake_header(protocol: u16) -> [u8; SP_HEADER_LEN] {
    let [hi, lo] = protocol.to_be_bytes();
    [0x00, b'S', b'P', 0x00, hi, lo, 0x00, 0x00]
}

/// Validate a peer's connection header and return the protocol it announced
pub fn parse_handshake(header: &[u8; SP_HEADER_LEN]) -> Result<u16> {
    let magic_ok = header[0] == 0x00 && header[1] == b'S' && header[2] == b'P' && header[3] == 0x00;
    let reserved_ok = header[6] == 0x00 && header[7] == 0x00;
    if !magic_ok || !reserved_ok {
        return Err(ProtocolError::InvalidHandshake { header: *header });
    }
    Ok(u16::from_be_bytes([header[4], header[5]]))
}

/// Encode one message with its size prefix
///
/// # Example
/// ```
/// use protocol::sp::encode_message;
///
/// let msg = encode_message(b"abc");
/// assert_eq!(&msg[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
/// assert_eq!(&msg[8..], b"abc");
/// ```
pub fn encode_message(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SP_LENGTH_LEN + body.len());
    buf.put_u64(body.len() as u64);
    buf.put_slice(body);
    buf.freeze()
}

/// Async: exchange connection headers and check that the peer can pair with us
#[cfg(feature = "async")]
pub async fn handshake_async<S>(stream: &mut S, local: u16, expected_peer: u16) -> Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_all(&handshake_header(local)).await?;
    stream.flush().await?;

    let mut header = [0u8; SP_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let peer = parse_handshake(&header)?;
    if peer != expected_peer {
        return Err(ProtocolError::IncompatiblePeer {
            actual: peer,
            expected: expected_peer,
        });
    }
    Ok(())
}

/// Async: write one size-prefixed message
#[cfg(feature = "async")]
pub async fn write_message_async<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(&(body.len() as u64).to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Async: read one size-prefixed message
#[cfg(feature = "async")]
pub async fn read_message_async<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; SP_LENGTH_LEN];
    reader.read_exact(&mut len_bytes).await?;
    let length = u64::from_be_bytes(len_bytes) as usize;

    if length > MAX_MESSAGE_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_MESSAGE_LEN,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
