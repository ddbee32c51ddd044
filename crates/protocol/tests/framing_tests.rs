//! Integration tests for bulk stream deframing
//!
//! Covers the frame format the device writes to its bulk IN endpoint:
//! - encode/decode round trips for every payload size the device can emit
//! - header boundary cases (length 4, length < 4)
//! - stream-level behaviour across many frames and truncated streams

use proptest::prelude::*;
use protocol::{FrameReader, HEADER_LEN, ProtocolError, ReadStage, decode_frame, encode_frame};
use std::io::Cursor;

proptest! {
    #[test]
    fn prop_frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..=65531)) {
        let encoded = encode_frame(&payload).unwrap();
        prop_assert_eq!(encoded.len(), payload.len() + HEADER_LEN);

        let mut reader = FrameReader::new(Cursor::new(encoded.clone()));
        prop_assert_eq!(&reader.read_frame().unwrap(), &payload);
        prop_assert_eq!(decode_frame(&encoded).unwrap(), payload.as_slice());
    }

    #[test]
    fn prop_stream_of_frames(payloads in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..512), 1..20)
    ) {
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend(encode_frame(payload).unwrap());
        }

        let mut reader = FrameReader::new(Cursor::new(stream));
        for payload in &payloads {
            prop_assert_eq!(&reader.read_frame().unwrap(), payload);
        }
        prop_assert_eq!(reader.frames_read(), payloads.len() as u64);
    }
}

mod boundaries {
    use super::*;

    #[test]
    fn test_single_eight_byte_payload() {
        let stream = [0x0C, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut reader = FrameReader::new(Cursor::new(stream));

        assert_eq!(
            reader.read_frame().unwrap(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );

        // Nothing left: the next read is a short header with zero bytes
        let Err(ProtocolError::ShortRead {
            stage, received, ..
        }) = reader.read_frame()
        else {
            panic!("Expected ShortRead at end of stream");
        };
        assert_eq!(stage, ReadStage::Header);
        assert_eq!(received, 0);
    }

    #[test]
    fn test_length_four_yields_empty_payload() {
        let mut reader = FrameReader::new(Cursor::new([
            4u8, 0, 0, 0, 8, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD,
        ]));
        assert!(reader.read_frame().unwrap().is_empty());
        assert_eq!(reader.read_frame().unwrap(), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_length_three_rejected_before_payload_read() {
        let mut reader = FrameReader::new(Cursor::new([3u8, 0, 0, 0]));
        assert!(matches!(
            reader.read_frame(),
            Err(ProtocolError::InvalidLength { length: 3 })
        ));
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            decode_frame(&[0, 0, 0, 0]),
            Err(ProtocolError::InvalidLength { length: 0 })
        ));
    }

    #[test]
    fn test_max_u16_payload() {
        let payload = vec![0x5A; 65531];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[..4], &[0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(decode_frame(&frame).unwrap().len(), 65531);
    }
}

mod truncation {
    use super::*;

    #[test]
    fn test_truncated_payload_reports_progress() {
        let mut stream = encode_frame(&[1; 100]).unwrap();
        stream.truncate(4 + 40);

        let mut reader = FrameReader::new(Cursor::new(stream));
        let Err(ProtocolError::ShortRead {
            stage,
            expected,
            received,
            source,
        }) = reader.read_frame()
        else {
            panic!("Expected ShortRead");
        };
        assert_eq!(stage, ReadStage::Payload);
        assert_eq!(expected, 100);
        assert_eq!(received, 40);
        assert!(source.is_none());
        assert_eq!(reader.frames_read(), 0);
    }

    #[test]
    fn test_good_frames_before_truncation_are_delivered() {
        let mut stream = encode_frame(b"one").unwrap();
        stream.extend(encode_frame(b"two").unwrap());
        stream.extend(&[0x20, 0x00]);

        let mut reader = FrameReader::new(Cursor::new(stream));
        assert_eq!(reader.read_frame().unwrap(), b"one");
        assert_eq!(reader.read_frame().unwrap(), b"two");
        assert!(reader.read_frame().unwrap_err().is_short_read());
        assert_eq!(reader.bytes_read(), 14);
    }
}
