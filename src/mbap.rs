//! MBAP framing for Modbus TCP.
//!
//! Every Modbus TCP frame is a 7-byte MBAP header followed by the PDU:
//!
//! ```text
//! +----------------+--------------+------------+---------+-----------+
//! | transaction id | protocol id  | length     | unit id | PDU       |
//! | u16 BE         | u16 BE (=0)  | u16 BE     | u8      | 1..=253 B |
//! +----------------+--------------+------------+---------+-----------+
//! ```
//!
//! The length field counts the unit-id byte plus the PDU, so it ranges
//! 2..=254 and the whole frame never exceeds 260 bytes.
//!
//! [`MbapDecoder`] is a streaming decoder: it accepts bytes in whatever
//! chunks the socket delivers them and emits complete frames. Feeding the
//! same byte sequence in different splits yields the same frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;

use crate::error::DecodeErrorKind;

/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_SIZE: usize = 7;

/// Protocol identifier for Modbus; anything else marks the frame suspect.
pub const MBAP_PROTOCOL_ID: u16 = 0x0000;

/// Largest admissible value of the MBAP length field (unit id + max PDU).
const MAX_LENGTH_FIELD: usize = 1 + crate::MAX_PDU_SIZE;

/// A decoded Modbus TCP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
    /// Set when the protocol identifier was not 0x0000. The frame is still
    /// delivered; a client correlates by transaction id and ignores frames
    /// it did not ask for.
    pub suspect: bool,
}

/// Encode one MBAP frame into `dst`.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8], dst: &mut BytesMut) {
    dst.reserve(MBAP_HEADER_SIZE + pdu.len());
    dst.put_u16(transaction_id);
    dst.put_u16(MBAP_PROTOCOL_ID);
    dst.put_u16((1 + pdu.len()) as u16);
    dst.put_u8(unit_id);
    dst.put_slice(pdu);
}

/// Streaming MBAP frame decoder.
///
/// Internally a two-state machine: accumulate the 7-byte header, then
/// accumulate the body announced by the length field, then emit and repeat.
/// A length field outside 2..=254 means the byte stream is desynchronized;
/// the decoder reports a fatal decode error and the connection must be torn
/// down.
#[derive(Debug, Default)]
pub struct MbapDecoder {
    buf: BytesMut,
}

impl MbapDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(crate::MAX_TCP_FRAME_SIZE * 2) }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partial frame, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A returned error is
    /// fatal for the stream.
    pub fn next_frame(&mut self) -> Result<Option<MbapFrame>, DecodeErrorKind> {
        if self.buf.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
        if length > MAX_LENGTH_FIELD {
            return Err(DecodeErrorKind::OversizedFrame { length });
        }
        if length < 2 {
            // A frame with no PDU byte cannot occur; the stream is broken.
            return Err(DecodeErrorKind::Truncated);
        }
        if self.buf.len() < 6 + length {
            return Ok(None);
        }

        let transaction_id = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let protocol_id = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        let unit_id = self.buf[6];
        self.buf.advance(MBAP_HEADER_SIZE);
        let pdu = self.buf.split_to(length - 1).freeze();

        let suspect = protocol_id != MBAP_PROTOCOL_ID;
        if suspect {
            warn!(
                "MBAP frame tid={transaction_id} carries protocol id 0x{protocol_id:04X}, \
                 treating as suspect"
            );
        }
        Ok(Some(MbapFrame { transaction_id, unit_id, pdu, suspect }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(tid: u16, uid: u8, pdu: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(tid, uid, pdu, &mut buf);
        buf
    }

    #[test]
    fn test_encode_read_request_frame() {
        // FC 0x03 to unit 1, tid 0x0001, address 0, quantity 10.
        let buf = frame_bytes(0x0001, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(
            &buf[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = MbapDecoder::new();
        decoder.extend(&frame_bytes(0x1234, 0x11, &[0x03, 0x02, 0x00, 0x2A]));
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.transaction_id, 0x1234);
        assert_eq!(frame.unit_id, 0x11);
        assert_eq!(&frame.pdu[..], &[0x03, 0x02, 0x00, 0x2A]);
        assert!(!frame.suspect);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_round_trip() {
        let cases: Vec<(u16, u8, Vec<u8>)> = vec![
            (0x0000, 0x00, vec![0x01]),
            (0x0001, 0x01, vec![0x03, 0x00, 0x00, 0x00, 0x0A]),
            (0xFFFF, 0xF7, vec![0u8; crate::MAX_PDU_SIZE]),
        ];
        for (tid, uid, pdu) in cases {
            let mut decoder = MbapDecoder::new();
            decoder.extend(&frame_bytes(tid, uid, &pdu));
            let frame = decoder.next_frame().unwrap().unwrap();
            assert_eq!((frame.transaction_id, frame.unit_id), (tid, uid));
            assert_eq!(&frame.pdu[..], &pdu[..]);
        }
    }

    #[test]
    fn test_decode_is_split_invariant() {
        // Two frames back to back, fed in every possible chunk size: the
        // decoder must always produce the same two frames.
        let mut stream = BytesMut::new();
        encode_frame(0x0001, 0x01, &[0x03, 0x00, 0x6B, 0x00, 0x03], &mut stream);
        encode_frame(0x0002, 0x02, &[0x01, 0x00, 0x13, 0x00, 0x25], &mut stream);

        let mut whole = MbapDecoder::new();
        whole.extend(&stream);
        let expected = [
            whole.next_frame().unwrap().unwrap(),
            whole.next_frame().unwrap().unwrap(),
        ];

        for chunk_size in 1..=stream.len() {
            let mut decoder = MbapDecoder::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.extend(chunk);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 2, "chunk size {chunk_size}");
            assert_eq!(frames[0], expected[0]);
            assert_eq!(frames[1], expected[1]);
        }
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let mut decoder = MbapDecoder::new();
        let frame = frame_bytes(0x0001, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        decoder.extend(&frame[..6]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[6..8]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[8..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_suspect_protocol_id() {
        let mut raw = frame_bytes(0x0001, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        raw[2] = 0x00;
        raw[3] = 0x01;
        let mut decoder = MbapDecoder::new();
        decoder.extend(&raw);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.suspect);
        assert_eq!(frame.transaction_id, 0x0001);
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut decoder = MbapDecoder::new();
        // Length field 0x0100 = 256 > 254.
        decoder.extend(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(
            decoder.next_frame(),
            Err(DecodeErrorKind::OversizedFrame { length: 256 })
        );
    }

    #[test]
    fn test_undersized_length_is_fatal() {
        let mut decoder = MbapDecoder::new();
        decoder.extend(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01]);
        assert_eq!(decoder.next_frame(), Err(DecodeErrorKind::Truncated));
    }
}
