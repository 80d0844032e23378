//! The reliability layer that sits on top of [`crate::packet`]: pending-command
//! retry table, ACK/NACK matching, backpressure backoff, and handshake
//! gating. Identical on both MCUs in the original firmware (each side hand-rolled
//! its own copy); here it is one generic implementation each firmware
//! instantiates, since the contract in spec §4.1/§5 is symmetric by design.

use heapless::Vec;

use crate::packet::{FrameDecoder, FrameError, Packet};
use crate::payload::{AckPayload, HandshakePayload};
use crate::types::MessageType;

/// ACK timeout, matching the original's `PROTOCOL_ACK_TIMEOUT_MS`.
pub const ACK_TIMEOUT_MS: u64 = 1000;
/// Retries before a pending command is dropped and surfaced as a fault.
pub const RETRY_COUNT: u8 = 3;
/// Default size of the pending-command table.
pub const MAX_PENDING: usize = 4;
/// In-flight dispatched-command count at which the receiver starts NACKing.
pub const BACKPRESSURE_THRESHOLD: u8 = 3;
/// Window in which repeated NACKs accumulate before resetting.
const NACK_QUIET_PERIOD_MS: u64 = 5000;
/// NACK count above which the overload warning fires and the counter resets.
const NACK_OVERLOAD_COUNT: u32 = 10;
/// Handshake must complete within this long after boot.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Byte sink the link writes encoded frames to.
pub trait FrameSink {
    type Error;
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError<E> {
    PayloadTooLong,
    /// Link not yet past handshake; only status/boot/log/handshake are legal.
    NotReady,
    /// Pending table is full.
    Full,
    /// Backoff deadline has not elapsed yet.
    Deferred,
    Sink(E),
}

struct PendingCommand {
    msg_type: u8,
    seq: u8,
    payload: Vec<u8, { crate::packet::MAX_PAYLOAD }>,
    retry_count: u8,
    sent_time_ms: u64,
}

/// Events produced by [`ProtocolLink::tick`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickEvent {
    Retried { msg_type: u8, seq: u8, retry_count: u8 },
    Exhausted { msg_type: u8, seq: u8 },
}

/// Events produced by [`ProtocolLink::on_packet`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// A pending command was matched and cleared.
    AckMatched { msg_type: u8, seq: u8 },
    /// An ACK arrived with no matching pending entry (late retry, reboot, ...).
    AckUnmatched { msg_type: u8, seq: u8 },
    /// Peer asked us to back off.
    NackReceived { offending_type: u8, offending_seq: u8, reason: u8, overload: bool },
    /// Peer's handshake record, handshake now (or still) complete from our side.
    HandshakeReceived { remote: HandshakePayloadCopy, complete: bool },
    /// Anything else: status/alarm/boot/log/debug/commands for the caller to act on.
    Dispatch(Packet),
}

/// Plain-data copy of [`HandshakePayload`] so `LinkEvent` can derive `PartialEq`
/// without pulling payload encode/decode machinery into the match arm.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandshakePayloadCopy {
    pub protocol_version_major: u8,
    pub protocol_version_minor: u8,
    pub capabilities: u8,
    pub max_retry_count: u8,
    pub ack_timeout_ms: u16,
}

impl From<HandshakePayload> for HandshakePayloadCopy {
    fn from(h: HandshakePayload) -> Self {
        Self {
            protocol_version_major: h.protocol_version_major,
            protocol_version_minor: h.protocol_version_minor,
            capabilities: h.capabilities,
            max_retry_count: h.max_retry_count,
            ack_timeout_ms: h.ack_timeout_ms,
        }
    }
}

/// Message types that may be coalesced in the pending table: sending a newer
/// instance of the same idempotent config command supersedes any still
/// awaiting ACK instead of occupying a second slot (spec §5 "Cancellation").
fn is_coalescible(msg_type: u8) -> bool {
    matches!(
        MessageType::from_u8(msg_type),
        Some(
            MessageType::CmdSetTemp
                | MessageType::CmdSetPid
                | MessageType::CmdConfig
                | MessageType::CmdSetEco
                | MessageType::CmdCleaningSetThreshold
        )
    )
}

/// The reliability layer. `N` is the pending-table capacity (spec default 4).
pub struct ProtocolLink<const N: usize = MAX_PENDING> {
    decoder: FrameDecoder,
    next_seq: u8,
    pending: Vec<PendingCommand, N>,
    in_flight: u8,
    nack_count: u32,
    last_nack_time_ms: u64,
    backoff_until_ms: u64,
    local_handshake: Option<HandshakePayload>,
    remote_handshake: Option<HandshakePayload>,
    handshake_sent_at_ms: Option<u64>,
    pub acks_matched: u32,
    pub acks_unmatched: u32,
    pub nacks_sent: u32,
    pub nacks_received: u32,
}

impl<const N: usize> ProtocolLink<N> {
    pub const fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            next_seq: 0,
            pending: Vec::new(),
            in_flight: 0,
            nack_count: 0,
            last_nack_time_ms: 0,
            backoff_until_ms: 0,
            local_handshake: None,
            remote_handshake: None,
            handshake_sent_at_ms: None,
            acks_matched: 0,
            acks_unmatched: 0,
            nacks_sent: 0,
            nacks_received: 0,
        }
    }

    pub fn crc_errors(&self) -> u32 {
        self.decoder.crc_errors
    }

    pub fn packet_errors(&self) -> u32 {
        self.decoder.packet_errors
    }

    pub fn handshake_complete(&self) -> bool {
        self.local_handshake.is_some() && self.remote_handshake.is_some()
    }

    /// Announce ourselves; only legal once, at boot.
    pub fn begin_handshake<S: FrameSink>(
        &mut self,
        sink: &mut S,
        local: HandshakePayload,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        self.local_handshake = Some(local);
        self.handshake_sent_at_ms = Some(now_ms);
        let mut buf = [0u8; HandshakePayload::SIZE];
        local.encode(&mut buf);
        self.send_raw(sink, MessageType::Handshake as u8, &buf)
    }

    /// `true` once [`HANDSHAKE_TIMEOUT_MS`] has elapsed since our own
    /// announcement with no remote record observed — a fault condition the
    /// caller should escalate.
    pub fn handshake_timed_out(&self, now_ms: u64) -> bool {
        match self.handshake_sent_at_ms {
            Some(t) if self.remote_handshake.is_none() => now_ms.saturating_sub(t) > HANDSHAKE_TIMEOUT_MS,
            _ => false,
        }
    }

    /// Frame and queue one message. Status/boot/log/debug/ack/nack/handshake
    /// are fire-and-forget; command-class types occupy a pending slot and are
    /// retried by [`Self::tick`] until ACKed or the retry cap is hit.
    pub fn send<S: FrameSink>(
        &mut self,
        sink: &mut S,
        msg_type: u8,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        let is_command = MessageType::from_u8(msg_type).map(MessageType::is_command).unwrap_or(false);
        let is_handshake = msg_type == MessageType::Handshake as u8;

        if is_command && !self.handshake_complete() {
            return Err(SendError::NotReady);
        }
        if is_command && now_ms < self.backoff_until_ms {
            return Err(SendError::Deferred);
        }

        if is_command {
            if is_coalescible(msg_type) {
                if let Some(existing) = self.pending.iter_mut().find(|p| p.msg_type == msg_type) {
                    existing.payload.clear();
                    existing
                        .payload
                        .extend_from_slice(payload)
                        .map_err(|_| SendError::PayloadTooLong)?;
                    existing.retry_count = 0;
                    existing.sent_time_ms = now_ms;
                    let seq = existing.seq;
                    return self.send_raw_with_seq(sink, msg_type, payload, seq);
                }
            }
            if self.pending.is_full() {
                return Err(SendError::Full);
            }
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        if is_command {
            let mut buf: Vec<u8, { crate::packet::MAX_PAYLOAD }> = Vec::new();
            buf.extend_from_slice(payload).map_err(|_| SendError::PayloadTooLong)?;
            let _ = self.pending.push(PendingCommand {
                msg_type,
                seq,
                payload: buf,
                retry_count: 0,
                sent_time_ms: now_ms,
            });
        }
        let _ = is_handshake;

        self.send_raw_with_seq(sink, msg_type, payload, seq)
    }

    fn send_raw<S: FrameSink>(&mut self, sink: &mut S, msg_type: u8, payload: &[u8]) -> Result<(), SendError<S::Error>> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.send_raw_with_seq(sink, msg_type, payload, seq)
    }

    fn send_raw_with_seq<S: FrameSink>(
        &mut self,
        sink: &mut S,
        msg_type: u8,
        payload: &[u8],
        seq: u8,
    ) -> Result<(), SendError<S::Error>> {
        let pkt = Packet::new(msg_type, seq, payload).map_err(|_| SendError::PayloadTooLong)?;
        let mut buf = [0u8; crate::packet::MAX_FRAME];
        let n = pkt.encode(&mut buf).map_err(|_| SendError::PayloadTooLong)?;
        sink.send_frame(&buf[..n]).map_err(SendError::Sink)
    }

    /// Reply to a command with an ACK. Decrements the in-flight backpressure
    /// counter incremented when the command was dispatched.
    pub fn send_ack<S: FrameSink>(
        &mut self,
        sink: &mut S,
        for_type: u8,
        for_seq: u8,
        result: u8,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let payload = AckPayload {
            cmd_type: for_type,
            cmd_seq: for_seq,
            result,
            reserved: 0,
        };
        let mut buf = [0u8; AckPayload::SIZE];
        payload.encode(&mut buf);
        let _ = now_ms;
        self.send_raw(sink, MessageType::Ack as u8, &buf)
    }

    /// `true` once this side should start NACKing new commands instead of
    /// dispatching them (spec §4.1 backpressure policy).
    pub fn should_backpressure(&self) -> bool {
        self.in_flight >= BACKPRESSURE_THRESHOLD
    }

    /// Emit a backpressure NACK referencing the command that tipped us over
    /// the threshold.
    pub fn send_nack<S: FrameSink>(
        &mut self,
        sink: &mut S,
        offending_type: u8,
        offending_seq: u8,
        reason: u8,
    ) -> Result<(), SendError<S::Error>> {
        self.nacks_sent += 1;
        let payload = [offending_type, offending_seq, reason];
        self.send_raw(sink, MessageType::Nack as u8, &payload)
    }

    /// Feed one received byte into the frame parser.
    pub fn on_byte(&mut self, b: u8, now_ms: u64) -> Result<Option<Packet>, FrameError> {
        self.decoder.push_byte(b, now_ms)
    }

    /// Discard a stalled in-flight frame; call this periodically.
    pub fn check_parser_timeout(&mut self, now_ms: u64) -> Option<FrameError> {
        self.decoder.check_timeout(now_ms)
    }

    /// Apply the exact backoff recurrence from the original NACK handler:
    /// counts reset after a quiet period, and an "overload" burst (more than
    /// [`NACK_OVERLOAD_COUNT`] NACKs inside the quiet window) resets the
    /// counter to avoid unbounded backoff growth while still logging once.
    fn record_nack(&mut self, now_ms: u64) -> bool {
        let mut overload = false;
        if self.last_nack_time_ms == 0 {
            self.nack_count = 1;
        } else if now_ms.saturating_sub(self.last_nack_time_ms) < NACK_QUIET_PERIOD_MS {
            self.nack_count += 1;
            if self.nack_count > NACK_OVERLOAD_COUNT {
                overload = true;
                self.nack_count = 0;
            }
        } else {
            self.nack_count = 1;
        }
        self.last_nack_time_ms = now_ms;
        let backoff_ms = core::cmp::min(100 * self.nack_count, 500);
        self.backoff_until_ms = now_ms + backoff_ms as u64;
        overload
    }

    /// Process one fully parsed, CRC-valid packet.
    pub fn on_packet<S: FrameSink>(
        &mut self,
        sink: &mut S,
        pkt: Packet,
        now_ms: u64,
    ) -> Result<LinkEvent, SendError<S::Error>> {
        match MessageType::from_u8(pkt.msg_type) {
            Some(MessageType::Ack) => {
                if let Some(ack) = AckPayload::decode(&pkt.payload) {
                    if let Some(idx) = self
                        .pending
                        .iter()
                        .position(|p| p.msg_type == ack.cmd_type && p.seq == ack.cmd_seq)
                    {
                        self.pending.swap_remove(idx);
                        self.acks_matched += 1;
                        return Ok(LinkEvent::AckMatched {
                            msg_type: ack.cmd_type,
                            seq: ack.cmd_seq,
                        });
                    }
                    self.acks_unmatched += 1;
                    return Ok(LinkEvent::AckUnmatched {
                        msg_type: ack.cmd_type,
                        seq: ack.cmd_seq,
                    });
                }
                self.acks_unmatched += 1;
                Ok(LinkEvent::AckUnmatched {
                    msg_type: 0,
                    seq: pkt.seq,
                })
            }
            Some(MessageType::Nack) => {
                self.nacks_received += 1;
                let offending_type = pkt.payload.first().copied().unwrap_or(0);
                let offending_seq = pkt.payload.get(1).copied().unwrap_or(0);
                let reason = pkt.payload.get(2).copied().unwrap_or(0);
                let overload = self.record_nack(now_ms);
                Ok(LinkEvent::NackReceived {
                    offending_type,
                    offending_seq,
                    reason,
                    overload,
                })
            }
            Some(MessageType::Handshake) => {
                if let Some(remote) = HandshakePayload::decode(&pkt.payload) {
                    self.remote_handshake = Some(remote);
                    if self.local_handshake.is_none() {
                        // Symmetric announce-back if we haven't sent ours yet.
                        let local = HandshakePayload {
                            protocol_version_major: 1,
                            protocol_version_minor: 1,
                            capabilities: 0,
                            max_retry_count: RETRY_COUNT,
                            ack_timeout_ms: ACK_TIMEOUT_MS as u16,
                        };
                        self.begin_handshake(sink, local, now_ms)?;
                    }
                    return Ok(LinkEvent::HandshakeReceived {
                        remote: remote.into(),
                        complete: self.handshake_complete(),
                    });
                }
                Ok(LinkEvent::Dispatch(pkt))
            }
            Some(mt) if mt.is_command() => {
                self.in_flight = self.in_flight.saturating_add(1);
                Ok(LinkEvent::Dispatch(pkt))
            }
            _ => Ok(LinkEvent::Dispatch(pkt)),
        }
    }

    /// Walk the pending table; retransmit anything past [`ACK_TIMEOUT_MS`],
    /// drop and report anything past [`RETRY_COUNT`].
    pub fn tick<S: FrameSink>(&mut self, sink: &mut S, now_ms: u64) -> Vec<TickEvent, N> {
        let mut events = Vec::new();
        let mut to_drop: Vec<usize, N> = Vec::new();

        for (idx, entry) in self.pending.iter_mut().enumerate() {
            if now_ms.saturating_sub(entry.sent_time_ms) < ACK_TIMEOUT_MS {
                continue;
            }
            if entry.retry_count >= RETRY_COUNT {
                let _ = to_drop.push(idx);
                let _ = events.push(TickEvent::Exhausted {
                    msg_type: entry.msg_type,
                    seq: entry.seq,
                });
                continue;
            }
            entry.retry_count += 1;
            entry.sent_time_ms = now_ms;
            if let Ok(pkt) = Packet::new(entry.msg_type, entry.seq, &entry.payload) {
                let mut buf = [0u8; crate::packet::MAX_FRAME];
                if let Ok(n) = pkt.encode(&mut buf) {
                    let _ = sink.send_frame(&buf[..n]);
                }
            }
            let _ = events.push(TickEvent::Retried {
                msg_type: entry.msg_type,
                seq: entry.seq,
                retry_count: entry.retry_count,
            });
        }

        for &idx in to_drop.iter().rev() {
            self.pending.swap_remove(idx);
        }
        events
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl<const N: usize> Default for ProtocolLink<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink {
        frames: std::vec::Vec<std::vec::Vec<u8>>,
    }
    impl FrameSink for VecSink {
        type Error = core::convert::Infallible;
        fn send_frame(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
            self.frames.push(frame.to_vec());
            Ok(())
        }
    }

    fn complete_handshake(link: &mut ProtocolLink<4>, sink: &mut VecSink) {
        let local = HandshakePayload {
            protocol_version_major: 1,
            protocol_version_minor: 1,
            capabilities: 0,
            max_retry_count: 3,
            ack_timeout_ms: 1000,
        };
        link.begin_handshake(sink, local, 0).unwrap();
        let remote = HandshakePayload {
            protocol_version_major: 1,
            protocol_version_minor: 1,
            capabilities: 0,
            max_retry_count: 3,
            ack_timeout_ms: 1000,
        };
        let mut buf = [0u8; HandshakePayload::SIZE];
        remote.encode(&mut buf);
        let pkt = Packet::new(MessageType::Handshake as u8, 0, &buf).unwrap();
        link.on_packet(sink, pkt, 0).unwrap();
        assert!(link.handshake_complete());
    }

    #[test]
    fn command_round_trip_ack_clears_pending() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        link.send(&mut sink, MessageType::CmdSetTemp as u8, &[0, 0xA2, 0x03], 100).unwrap();
        assert_eq!(link.pending_count(), 1);

        let ack = AckPayload {
            cmd_type: MessageType::CmdSetTemp as u8,
            cmd_seq: 1, // seq 0 was consumed by handshake
            result: 0,
            reserved: 0,
        };
        let mut buf = [0u8; AckPayload::SIZE];
        ack.encode(&mut buf);
        let pkt = Packet::new(MessageType::Ack as u8, 99, &buf).unwrap();
        let event = link.on_packet(&mut sink, pkt, 150).unwrap();
        assert_eq!(
            event,
            LinkEvent::AckMatched {
                msg_type: MessageType::CmdSetTemp as u8,
                seq: 1
            }
        );
        assert_eq!(link.pending_count(), 0);
    }

    #[test]
    fn retry_then_exhaustion() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        link.send(&mut sink, MessageType::CmdBrew as u8, &[1], 0).unwrap();
        assert_eq!(link.pending_count(), 1);

        let mut now = 0u64;
        for _ in 0..RETRY_COUNT {
            now += ACK_TIMEOUT_MS + 1;
            let events = link.tick(&mut sink, now);
            assert!(matches!(events[0], TickEvent::Retried { .. }));
        }
        now += ACK_TIMEOUT_MS + 1;
        let events = link.tick(&mut sink, now);
        assert!(matches!(events[0], TickEvent::Exhausted { .. }));
        assert_eq!(link.pending_count(), 0);
    }

    #[test]
    fn pending_cap_enforced() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        link.send(&mut sink, MessageType::CmdBrew as u8, &[1], 0).unwrap();
        link.send(&mut sink, MessageType::CmdMode as u8, &[1], 0).unwrap();
        link.send(&mut sink, MessageType::CmdCleaningStart as u8, &[], 0).unwrap();
        link.send(&mut sink, MessageType::CmdCleaningStop as u8, &[], 0).unwrap();
        assert_eq!(link.pending_count(), 4);

        let err = link.send(&mut sink, MessageType::CmdCleaningReset as u8, &[], 0).unwrap_err();
        assert_eq!(err, SendError::Full);
    }

    #[test]
    fn coalescible_command_replaces_pending_slot() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        link.send(&mut sink, MessageType::CmdSetTemp as u8, &[0, 1, 0], 0).unwrap();
        link.send(&mut sink, MessageType::CmdSetTemp as u8, &[0, 2, 0], 10).unwrap();
        assert_eq!(link.pending_count(), 1);
    }

    #[test]
    fn backpressure_nack_sets_backoff_deadline() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        let nack_payload = [MessageType::CmdSetTemp as u8, 5, 0];
        let pkt = Packet::new(MessageType::Nack as u8, 1, &nack_payload).unwrap();
        link.on_packet(&mut sink, pkt, 1000).unwrap();

        let err = link
            .send(&mut sink, MessageType::CmdSetTemp as u8, &[0, 1, 0], 1000)
            .unwrap_err();
        assert_eq!(err, SendError::Deferred);

        // Past the backoff window the send succeeds.
        link.send(&mut sink, MessageType::CmdSetTemp as u8, &[0, 1, 0], 1200).unwrap();
    }

    #[test]
    fn in_flight_backpressure_threshold() {
        let mut link: ProtocolLink<4> = ProtocolLink::new();
        let mut sink = VecSink::default();
        complete_handshake(&mut link, &mut sink);

        for i in 0..BACKPRESSURE_THRESHOLD {
            let pkt = Packet::new(MessageType::CmdSetTemp as u8, i, &[0, 1, 0]).unwrap();
            link.on_packet(&mut sink, pkt, 0).unwrap();
        }
        assert!(link.should_backpressure());
    }
}
