//! Wire formats for qt-pull
//!
//! This crate holds the two byte-level formats the capture tool deals with:
//!
//! - the length-prefixed frames the device writes to its bulk IN endpoint
//!   ([`frame`]), and
//! - the scalability-protocol framing used by the push sink ([`sp`]).
//!
//! Neither needs a device, so both are tested here in isolation.
//!
//! # Example
//!
//! ```
//! use protocol::{FrameReader, encode_frame};
//! use std::io::Cursor;
//!
//! let mut stream = encode_frame(b"first").unwrap();
//! stream.extend(encode_frame(b"second").unwrap());
//!
//! let mut reader = FrameReader::new(Cursor::new(stream));
//! assert_eq!(reader.read_frame().unwrap(), b"first");
//! assert_eq!(reader.read_frame().unwrap(), b"second");
//! ```

pub mod error;
pub mod frame;
pub mod sp;

pub use error::{ProtocolError, ReadStage, Result};
pub use frame::{
    FrameReader, HEADER_LEN, MAX_FRAME_LEN, decode_frame, encode_frame, payload_len,
};
