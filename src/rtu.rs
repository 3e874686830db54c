//! RTU framing for Modbus over asynchronous serial lines.
//!
//! An RTU frame is `unit_id ‖ PDU ‖ CRC-16/Modbus (little-endian)`, at most
//! 256 bytes. There is no length field: frame boundaries are defined by
//! line silence. With 11 bit-times per character (start + 8 data + parity +
//! stop; a no-parity configuration is timed the same way):
//!
//! - a gap of at least 3.5 character times (`t3.5`) ends a frame,
//! - a gap between 1.5 (`t1.5`) and 3.5 character times inside a frame
//!   makes it malformed and the accumulated bytes are discarded.
//!
//! At 19200 baud and above the thresholds are fixed at 750 µs and 1750 µs.
//!
//! [`RtuDecoder`] implements the receive state machine. It is driven with
//! explicit timestamps so the caller (and the tests) control the clock: the
//! event loop feeds bytes as they arrive and arms a timer at
//! [`RtuDecoder::silence_deadline`] to detect end-of-frame.
//!
//! [`TurnaroundGate`] implements the transmit side of the same rule: a new
//! frame may not be sent until the line has been quiet for `t3.5` after the
//! last inbound or outbound byte, whichever is later.

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use log::{debug, trace};
use std::time::{Duration, Instant};

use crate::error::DecodeErrorKind;

/// CRC calculator for RTU frames (poly 0xA001 reflected, init 0xFFFF).
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Bit-times per serial character: start + 8 data + parity + stop.
const BITS_PER_CHAR: u64 = 11;

/// Compute the CRC-16/Modbus checksum of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Duration of one serial character at the given baud rate.
pub fn char_time(baud_rate: u32) -> Duration {
    Duration::from_micros(BITS_PER_CHAR * 1_000_000 / baud_rate as u64)
}

/// Maximum in-frame inter-character gap (`t1.5`).
pub fn inter_char_timeout(baud_rate: u32) -> Duration {
    if baud_rate >= 19_200 {
        Duration::from_micros(750)
    } else {
        char_time(baud_rate) * 3 / 2
    }
}

/// Minimum inter-frame silence (`t3.5`).
pub fn inter_frame_timeout(baud_rate: u32) -> Duration {
    if baud_rate >= 19_200 {
        Duration::from_micros(1_750)
    } else {
        char_time(baud_rate) * 7 / 2
    }
}

/// A decoded RTU frame: unit identifier plus PDU, checksum already
/// verified and stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: Bytes,
}

/// Encode one RTU frame into `dst`.
pub fn encode_frame(unit_id: u8, pdu: &[u8], dst: &mut BytesMut) {
    dst.reserve(1 + pdu.len() + 2);
    let start = dst.len();
    dst.extend_from_slice(&[unit_id]);
    dst.extend_from_slice(pdu);
    let crc = crc16(&dst[start..]);
    dst.extend_from_slice(&crc.to_le_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Idle,
    Receiving,
}

/// Silence-delimited RTU frame decoder.
pub struct RtuDecoder {
    state: FramerState,
    buf: BytesMut,
    last_byte_at: Option<Instant>,
    t1_5: Duration,
    t3_5: Duration,
    discarded: u64,
}

impl RtuDecoder {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            state: FramerState::Idle,
            buf: BytesMut::with_capacity(crate::MAX_RTU_FRAME_SIZE),
            last_byte_at: None,
            t1_5: inter_char_timeout(baud_rate),
            t3_5: inter_frame_timeout(baud_rate),
            discarded: 0,
        }
    }

    /// Feed bytes observed on the line at `now`.
    ///
    /// If the gap since the previous byte already closed the frame, the
    /// completed (or corrupt) frame is returned and the new bytes start the
    /// next one. A gap in `[t1.5, t3.5)` poisons the partial frame: the
    /// buffer is discarded and accumulation restarts with the late bytes.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        now: Instant,
    ) -> Option<Result<RtuFrame, DecodeErrorKind>> {
        if bytes.is_empty() {
            return None;
        }
        let mut completed = None;
        if self.state == FramerState::Receiving {
            let gap = self
                .last_byte_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO);
            if gap >= self.t3_5 {
                // The timer should normally have closed this frame already.
                completed = Some(self.finalize());
            } else if gap >= self.t1_5 {
                trace!("RTU inter-character gap {gap:?} >= t1.5, discarding partial frame");
                self.discard_partial();
            }
        }

        self.state = FramerState::Receiving;
        self.last_byte_at = Some(now);
        if self.buf.len() + bytes.len() > crate::MAX_RTU_FRAME_SIZE {
            debug!(
                "RTU frame exceeded {} bytes, discarding buffer",
                crate::MAX_RTU_FRAME_SIZE
            );
            self.discard_partial();
        } else {
            self.buf.extend_from_slice(bytes);
        }
        completed
    }

    /// Close the current frame if the line has been silent for `t3.5`.
    pub fn poll_complete(&mut self, now: Instant) -> Option<Result<RtuFrame, DecodeErrorKind>> {
        if self.state != FramerState::Receiving {
            return None;
        }
        let idle = self
            .last_byte_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);
        if idle >= self.t3_5 {
            Some(self.finalize())
        } else {
            None
        }
    }

    /// When the currently accumulating frame will be considered complete,
    /// absent further bytes. `None` while idle.
    pub fn silence_deadline(&self) -> Option<Instant> {
        match self.state {
            FramerState::Receiving => self.last_byte_at.map(|t| t + self.t3_5),
            FramerState::Idle => None,
        }
    }

    /// Partial frames discarded due to timing violations or overflow.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop any partial state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.state = FramerState::Idle;
        self.buf.clear();
        self.last_byte_at = None;
    }

    fn discard_partial(&mut self) {
        if !self.buf.is_empty() {
            self.discarded += 1;
        }
        self.buf.clear();
    }

    fn finalize(&mut self) -> Result<RtuFrame, DecodeErrorKind> {
        self.state = FramerState::Idle;
        self.last_byte_at = None;
        let frame = self.buf.split().freeze();
        if frame.len() < 4 {
            return Err(DecodeErrorKind::Truncated);
        }
        let payload_len = frame.len() - 2;
        let expected = crc16(&frame[..payload_len]);
        let actual = u16::from_le_bytes([frame[payload_len], frame[payload_len + 1]]);
        if expected != actual {
            return Err(DecodeErrorKind::CrcMismatch { expected, actual });
        }
        Ok(RtuFrame {
            unit_id: frame[0],
            pdu: frame.slice(1..payload_len),
        })
    }
}

/// Transmit hold-off: a new frame may only be sent after the line has been
/// idle for `t3.5`, counting both received and transmitted bytes.
#[derive(Debug)]
pub struct TurnaroundGate {
    last_activity: Option<Instant>,
    t3_5: Duration,
}

impl TurnaroundGate {
    pub fn new(baud_rate: u32) -> Self {
        Self { last_activity: None, t3_5: inter_frame_timeout(baud_rate) }
    }

    /// Record line activity (either direction) at `now`.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Earliest instant at which transmitting is allowed. `None` means the
    /// line has never been active and transmission may start immediately.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_activity.map(|t| t + self.t3_5)
    }

    /// Whether a transmit may start at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        match self.ready_at() {
            Some(at) => now >= at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_vectors() {
        let cases: Vec<(&[u8], u16)> = vec![
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], 0x0BC4),
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A], 0xCDC5),
            (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], 0xCA31),
            (&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03], 0x0B98),
            (&[0x01, 0x01, 0x00, 0x13, 0x00, 0x25], 0x140C),
            (&[0x02, 0x03, 0x00, 0x00, 0x00, 0x01], 0x3984),
        ];
        for (data, expected) in cases {
            assert_eq!(crc16(data), expected, "CRC mismatch for {data:02X?}");
        }
    }

    #[test]
    fn test_crc_residue_is_zero() {
        // Appending the little-endian CRC makes the checksum of the whole
        // run zero, for any prefix.
        let prefixes: Vec<Vec<u8>> = vec![
            vec![0x00],
            vec![0x01, 0x03],
            vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03],
            (0u8..=0xFF).collect(),
        ];
        for prefix in prefixes {
            let mut whole = prefix.clone();
            whole.extend_from_slice(&crc16(&prefix).to_le_bytes());
            assert_eq!(crc16(&whole), 0, "residue for {prefix:02X?}");
        }
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A], &mut buf);
        assert_eq!(&buf[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_char_timing_thresholds() {
        // 9600 baud: one character is 11/9600 s ≈ 1146 µs.
        assert_eq!(char_time(9600), Duration::from_micros(1145));
        assert_eq!(inter_char_timeout(9600), Duration::from_nanos(1_717_500));
        assert_eq!(inter_frame_timeout(9600), Duration::from_nanos(4_007_500));

        // At and above 19200 baud the thresholds are fixed.
        for baud in [19_200, 38_400, 115_200] {
            assert_eq!(inter_char_timeout(baud), Duration::from_micros(750));
            assert_eq!(inter_frame_timeout(baud), Duration::from_micros(1750));
        }
    }

    fn decoder_at_9600() -> (RtuDecoder, Instant, Duration) {
        let decoder = RtuDecoder::new(9600);
        let t3_5 = inter_frame_timeout(9600);
        (decoder, Instant::now(), t3_5)
    }

    #[test]
    fn test_decoder_complete_after_silence() {
        let (mut decoder, start, t3_5) = decoder_at_9600();
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        assert!(decoder.feed(&frame, start).is_none());
        // Not yet silent long enough.
        assert!(decoder.poll_complete(start + t3_5 / 2).is_none());
        let decoded = decoder.poll_complete(start + t3_5).unwrap().unwrap();
        assert_eq!(decoded.unit_id, 0x01);
        assert_eq!(&decoded.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert!(decoder.silence_deadline().is_none());
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let (mut decoder, start, t3_5) = decoder_at_9600();
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        let char_gap = char_time(9600);
        let mut now = start;
        for &byte in &frame {
            assert!(decoder.feed(&[byte], now).is_none());
            now += char_gap;
        }
        let decoded = decoder.poll_complete(now + t3_5).unwrap().unwrap();
        assert_eq!(decoded.unit_id, 0x01);
    }

    #[test]
    fn test_decoder_crc_mismatch_any_flipped_byte() {
        let good = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        for i in 0..good.len() {
            let (mut decoder, start, t3_5) = decoder_at_9600();
            let mut corrupted = good;
            corrupted[i] ^= 0x01;
            decoder.feed(&corrupted, start);
            let result = decoder.poll_complete(start + t3_5).unwrap();
            assert!(
                matches!(result, Err(DecodeErrorKind::CrcMismatch { .. })),
                "flipping byte {i} should fail CRC"
            );
        }
    }

    #[test]
    fn test_decoder_runt_frame() {
        let (mut decoder, start, t3_5) = decoder_at_9600();
        decoder.feed(&[0x01, 0x03, 0xFF], start);
        assert_eq!(
            decoder.poll_complete(start + t3_5),
            Some(Err(DecodeErrorKind::Truncated))
        );
    }

    #[test]
    fn test_decoder_discards_on_inter_char_gap() {
        let (mut decoder, start, t3_5) = decoder_at_9600();
        let t1_5 = inter_char_timeout(9600);
        decoder.feed(&[0x01, 0x03, 0x00], start);
        // A gap between t1.5 and t3.5 invalidates the partial frame; the
        // late bytes begin a new one.
        let late = start + t1_5 + Duration::from_micros(100);
        assert!(decoder.feed(&[0x55], late).is_none());
        assert_eq!(decoder.discarded(), 1);
        // The replacement accumulation completes (and fails CRC as garbage).
        let result = decoder.poll_complete(late + t3_5).unwrap();
        assert!(matches!(result, Err(DecodeErrorKind::Truncated)));
    }

    #[test]
    fn test_decoder_completes_stale_frame_on_feed() {
        let (mut decoder, start, t3_5) = decoder_at_9600();
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        decoder.feed(&frame, start);
        // Next frame starts without poll_complete having run; feed returns
        // the finished frame.
        let completed = decoder
            .feed(&[0x02], start + t3_5 * 2)
            .expect("stale frame should complete")
            .expect("stale frame is valid");
        assert_eq!(completed.unit_id, 0x01);
        assert!(decoder.silence_deadline().is_some());
    }

    #[test]
    fn test_turnaround_gate() {
        let mut gate = TurnaroundGate::new(19_200);
        let start = Instant::now();
        assert!(gate.is_ready(start));
        gate.record_activity(start);
        assert!(!gate.is_ready(start + Duration::from_micros(1_000)));
        assert!(gate.is_ready(start + Duration::from_micros(1_750)));
        assert_eq!(gate.ready_at(), Some(start + Duration::from_micros(1_750)));
    }
}
