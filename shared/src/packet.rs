//! Packet framing: `| 0xAA | type | length | seq | payload (0-32) | crc16 |`.

use heapless::Vec;

use crate::crc::crc16;

/// Sync byte that starts every frame.
pub const SYNC: u8 = 0xAA;
/// Largest legal payload, in bytes.
pub const MAX_PAYLOAD: usize = 32;
/// Largest legal frame on the wire (sync + type + length + seq + payload + crc16).
pub const MAX_FRAME: usize = 1 + 1 + 1 + 1 + MAX_PAYLOAD + 2;

/// A fully decoded, CRC-verified packet.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packet {
    pub msg_type: u8,
    pub seq: u8,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl Packet {
    pub fn new(msg_type: u8, seq: u8, payload: &[u8]) -> Result<Self, EncodeError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(payload).map_err(|_| EncodeError::PayloadTooLong)?;
        Ok(Self {
            msg_type,
            seq,
            payload: buf,
        })
    }

    /// Serialise into `out`, returning the number of bytes written.
    ///
    /// `out` must be at least [`MAX_FRAME`] bytes.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(EncodeError::PayloadTooLong);
        }
        if out.len() < 4 + len + 2 {
            return Err(EncodeError::BufferTooSmall);
        }
        out[0] = SYNC;
        out[1] = self.msg_type;
        out[2] = len as u8;
        out[3] = self.seq;
        out[4..4 + len].copy_from_slice(&self.payload);
        let crc = crc16(&out[1..4 + len]);
        out[4 + len..4 + len + 2].copy_from_slice(&crc.to_le_bytes());
        Ok(4 + len + 2)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    PayloadTooLong,
    BufferTooSmall,
}

/// Reason a candidate frame was discarded by [`FrameDecoder`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// `length` exceeded [`MAX_PAYLOAD`].
    LengthOverflow,
    /// The trailing CRC did not match the computed one.
    CrcMismatch,
    /// No complete frame arrived within the parser timeout.
    Timeout,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    WaitSync,
    GotType,
    GotLength,
    GotSeq,
    ReadingPayload,
    ReadingCrc,
}

/// Streaming byte-at-a-time parser for the framed protocol.
///
/// Drives the state machine `WAIT_SYNC -> TYPE -> LENGTH -> SEQ -> PAYLOAD ->
/// CRC` described in spec §4.1. Any failure (length overflow, CRC mismatch,
/// or a caller-detected timeout via [`FrameDecoder::check_timeout`]) discards
/// only the in-flight candidate and returns the parser to `WAIT_SYNC` — sync
/// is never lost beyond the offending packet.
pub struct FrameDecoder {
    state: RxState,
    msg_type: u8,
    length: u8,
    seq: u8,
    payload: Vec<u8, MAX_PAYLOAD>,
    crc_bytes: [u8; 2],
    crc_idx: usize,
    first_byte_time_ms: u64,
    pub crc_errors: u32,
    pub packet_errors: u32,
    pub timeout_errors: u32,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: RxState::WaitSync,
            msg_type: 0,
            length: 0,
            seq: 0,
            payload: Vec::new(),
            crc_bytes: [0; 2],
            crc_idx: 0,
            first_byte_time_ms: 0,
            crc_errors: 0,
            packet_errors: 0,
            timeout_errors: 0,
        }
    }

    fn reset(&mut self) {
        self.state = RxState::WaitSync;
        self.payload.clear();
        self.crc_idx = 0;
    }

    /// Parser timeout: if a frame has been in flight longer than this many
    /// milliseconds with no completion, the candidate is discarded.
    pub const TIMEOUT_MS: u64 = 500;

    /// Call periodically with the current time; discards a stalled in-flight
    /// frame and counts it as a timeout error.
    pub fn check_timeout(&mut self, now_ms: u64) -> Option<FrameError> {
        if self.state != RxState::WaitSync && now_ms.saturating_sub(self.first_byte_time_ms) > Self::TIMEOUT_MS {
            self.reset();
            self.timeout_errors += 1;
            return Some(FrameError::Timeout);
        }
        None
    }

    /// Feed one received byte. Returns `Ok(Some(packet))` on a complete,
    /// CRC-valid frame, `Err(e)` on a discarded candidate, or `Ok(None)` while
    /// still assembling.
    pub fn push_byte(&mut self, b: u8, now_ms: u64) -> Result<Option<Packet>, FrameError> {
        match self.state {
            RxState::WaitSync => {
                if b == SYNC {
                    self.first_byte_time_ms = now_ms;
                    self.state = RxState::GotType;
                }
                Ok(None)
            }
            RxState::GotType => {
                self.msg_type = b;
                self.state = RxState::GotLength;
                Ok(None)
            }
            RxState::GotLength => {
                if b as usize > MAX_PAYLOAD {
                    self.reset();
                    self.packet_errors += 1;
                    return Err(FrameError::LengthOverflow);
                }
                self.length = b;
                self.state = RxState::GotSeq;
                Ok(None)
            }
            RxState::GotSeq => {
                self.seq = b;
                self.payload.clear();
                self.state = if self.length == 0 {
                    RxState::ReadingCrc
                } else {
                    RxState::ReadingPayload
                };
                Ok(None)
            }
            RxState::ReadingPayload => {
                // unwrap: length was bounds-checked against MAX_PAYLOAD above.
                let _ = self.payload.push(b);
                if self.payload.len() == self.length as usize {
                    self.state = RxState::ReadingCrc;
                }
                Ok(None)
            }
            RxState::ReadingCrc => {
                self.crc_bytes[self.crc_idx] = b;
                self.crc_idx += 1;
                if self.crc_idx < 2 {
                    return Ok(None);
                }
                let received = u16::from_le_bytes(self.crc_bytes);
                let mut header = Vec::<u8, { 3 + MAX_PAYLOAD }>::new();
                let _ = header.push(self.msg_type);
                let _ = header.push(self.length);
                let _ = header.push(self.seq);
                let _ = header.extend_from_slice(&self.payload);
                let expected = crc16(&header);
                let result = if expected == received {
                    Ok(Some(Packet {
                        msg_type: self.msg_type,
                        seq: self.seq,
                        payload: self.payload.clone(),
                    }))
                } else {
                    self.crc_errors += 1;
                    Err(FrameError::CrcMismatch)
                };
                self.reset();
                result
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(dec: &mut FrameDecoder, bytes: &[u8]) -> Option<Result<Packet, FrameError>> {
        let mut last = None;
        for &b in bytes {
            match dec.push_byte(b, 0) {
                Ok(Some(p)) => last = Some(Ok(p)),
                Err(e) => last = Some(Err(e)),
                Ok(None) => {}
            }
        }
        last
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let pkt = Packet::new(0x01, 7, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        let n = pkt.encode(&mut buf).unwrap();

        let mut dec = FrameDecoder::new();
        let got = feed(&mut dec, &buf[..n]).unwrap().unwrap();
        assert_eq!(got.msg_type, 0x01);
        assert_eq!(got.seq, 7);
        assert_eq!(&got.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn max_payload_32_accepted_33_rejected() {
        let payload32 = [0x42u8; 32];
        let pkt = Packet::new(0x01, 0, &payload32).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        let n = pkt.encode(&mut buf).unwrap();
        let mut dec = FrameDecoder::new();
        assert!(feed(&mut dec, &buf[..n]).unwrap().is_ok());

        // A hand-built frame claiming length 33 must be rejected at the
        // length byte itself, before any payload is read.
        let mut dec2 = FrameDecoder::new();
        let bad = [SYNC, 0x01, 33, 0];
        assert_eq!(feed(&mut dec2, &bad), Some(Err(FrameError::LengthOverflow)));
    }

    #[test]
    fn corrupted_payload_byte_is_rejected_and_resyncs() {
        let pkt = Packet::new(0x01, 1, &[0xAB; 4]).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        let n = pkt.encode(&mut buf).unwrap();
        buf[5] ^= 0x01; // flip a payload bit

        let mut dec = FrameDecoder::new();
        let result = feed(&mut dec, &buf[..n]);
        assert_eq!(result, Some(Err(FrameError::CrcMismatch)));
        assert_eq!(dec.crc_errors, 1);

        // Parser must have returned to WAIT_SYNC and accept the next good frame.
        let good = Packet::new(0x02, 2, &[1]).unwrap();
        let mut buf2 = [0u8; MAX_FRAME];
        let n2 = good.encode(&mut buf2).unwrap();
        let got = feed(&mut dec, &buf2[..n2]).unwrap().unwrap();
        assert_eq!(got.msg_type, 0x02);
    }

    #[test]
    fn resync_skips_garbage_before_next_sync_byte() {
        let mut dec = FrameDecoder::new();
        let garbage = [0x00u8, 0xFF, 0x7E, 0x01];
        assert_eq!(feed(&mut dec, &garbage), None);

        let pkt = Packet::new(0x00, 9, &[]).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        let n = pkt.encode(&mut buf).unwrap();
        let got = feed(&mut dec, &buf[..n]).unwrap().unwrap();
        assert_eq!(got.seq, 9);
    }
}
