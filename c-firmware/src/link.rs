//! C-MCU side of the framed inter-MCU protocol (spec §4.1): thin client over
//! [`brewos_shared::link::ProtocolLink`], adding the handful of things only
//! the C-MCU side ever does — request boot info / config from the RT-MCU,
//! drive the WEIGHT_STOP GPIO, and push the command-encoding helpers the
//! original split across `PicoUART`'s convenience methods and
//! `PicoProtocolHandler`'s packet routing. Grounded in
//! `pico_uart.{h,cpp}` and `pico_protocol_handler.{h,cpp}`; both classes
//! collapse into one client here since `brewos_shared::link::ProtocolLink`
//! already owns the NACK-backoff and handshake bookkeeping they hand-rolled.

use brewos_shared::link::{FrameSink, LinkEvent, ProtocolLink, SendError};
use brewos_shared::payload::{CmdSetPid, CmdSetTemp, ConfigEnvironmental, ConfigPreinfusion, HandshakePayload};
use brewos_shared::types::MessageType;
use brewos_shared::Packet;

/// GPIO line the original drives directly from `PicoUART::setWeightStop`
/// (spec §3 "Brew-by-weight... a dedicated GPIO line, not a protocol
/// message, stops the shot"). A board crate wires a concrete output pin to
/// this; this module only tracks the last commanded level so callers can
/// read it back without a round trip to the pin driver.
pub trait WeightStopLine {
    fn set(&mut self, active: bool);
}

/// Outcome of feeding one received packet through the C-MCU's link client,
/// mirroring [`brewos_shared::link::LinkEvent`] but folding in the two
/// C-MCU-specific reply types (boot info, config echo) that the RT-MCU
/// emits unprompted in response to a request this client sent earlier.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientEvent {
    Link(LinkEvent),
    BootInfo(Packet),
    Config(Packet),
    Status(Packet),
    Alarm(Packet),
    Log(Packet),
}

/// C-MCU protocol client: owns a [`ProtocolLink`] instance and the
/// WEIGHT_STOP line, and narrows the generic [`LinkEvent::Dispatch`] variant
/// down to the packet kinds this side actually cares about.
pub struct PicoLink<const N: usize, W: WeightStopLine> {
    link: ProtocolLink<N>,
    weight_stop: W,
    weight_stop_active: bool,
}

impl<const N: usize, W: WeightStopLine> PicoLink<N, W> {
    pub const fn new(weight_stop: W) -> Self {
        Self {
            link: ProtocolLink::new(),
            weight_stop,
            weight_stop_active: false,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.link.handshake_complete()
    }

    pub fn handshake_timed_out(&self, now_ms: u64) -> bool {
        self.link.handshake_timed_out(now_ms)
    }

    /// Announce protocol version 1.1, no optional capabilities (spec §4.1:
    /// the C-MCU always initiates when it boots after the RT-MCU).
    pub fn begin_handshake<S: FrameSink>(&mut self, sink: &mut S, now_ms: u64) -> Result<(), SendError<S::Error>> {
        let local = HandshakePayload {
            protocol_version_major: 1,
            protocol_version_minor: 1,
            capabilities: 0,
            max_retry_count: brewos_shared::link::RETRY_COUNT,
            ack_timeout_ms: brewos_shared::link::ACK_TIMEOUT_MS as u16,
        };
        self.link.begin_handshake(sink, local, now_ms)
    }

    pub fn request_boot_info<S: FrameSink>(&mut self, sink: &mut S, now_ms: u64) -> Result<(), SendError<S::Error>> {
        self.link.send(sink, MessageType::CmdGetBoot as u8, &[], now_ms)
    }

    pub fn request_config<S: FrameSink>(&mut self, sink: &mut S, now_ms: u64) -> Result<(), SendError<S::Error>> {
        self.link.send(sink, MessageType::CmdGetConfig as u8, &[], now_ms)
    }

    pub fn send_set_temp<S: FrameSink>(
        &mut self,
        sink: &mut S,
        target: u8,
        temperature_c10: i16,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        let mut buf = [0u8; CmdSetTemp::SIZE];
        CmdSetTemp { target, temperature: temperature_c10 }.encode(&mut buf);
        self.link.send(sink, MessageType::CmdSetTemp as u8, &buf, now_ms)
    }

    pub fn send_set_pid<S: FrameSink>(
        &mut self,
        sink: &mut S,
        target: u8,
        kp: u16,
        ki: u16,
        kd: u16,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        let mut buf = [0u8; CmdSetPid::SIZE];
        CmdSetPid { target, kp, ki, kd }.encode(&mut buf);
        self.link.send(sink, MessageType::CmdSetPid as u8, &buf, now_ms)
    }

    pub fn send_brew<S: FrameSink>(&mut self, sink: &mut S, start: bool, now_ms: u64) -> Result<(), SendError<S::Error>> {
        self.link.send(sink, MessageType::CmdBrew as u8, &[start as u8], now_ms)
    }

    pub fn send_mode<S: FrameSink>(&mut self, sink: &mut S, mode: u8, now_ms: u64) -> Result<(), SendError<S::Error>> {
        self.link.send(sink, MessageType::CmdMode as u8, &[mode], now_ms)
    }

    pub fn send_config_environmental<S: FrameSink>(
        &mut self,
        sink: &mut S,
        cfg: ConfigEnvironmental,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        let mut buf = [0u8; 1 + ConfigEnvironmental::SIZE];
        buf[0] = brewos_shared::types::ConfigType::Environmental as u8;
        cfg.encode((&mut buf[1..]).try_into().unwrap());
        self.link.send(sink, MessageType::CmdConfig as u8, &buf, now_ms)
    }

    pub fn send_config_preinfusion<S: FrameSink>(
        &mut self,
        sink: &mut S,
        cfg: ConfigPreinfusion,
        now_ms: u64,
    ) -> Result<(), SendError<S::Error>> {
        let mut buf = [0u8; 1 + ConfigPreinfusion::SIZE];
        buf[0] = brewos_shared::types::ConfigType::Preinfusion as u8;
        cfg.encode((&mut buf[1..]).try_into().unwrap());
        self.link.send(sink, MessageType::CmdConfig as u8, &buf, now_ms)
    }

    /// Drive WEIGHT_STOP directly (spec §3: a dedicated GPIO, not a wire
    /// message) and remember the commanded level.
    pub fn set_weight_stop(&mut self, active: bool) {
        self.weight_stop.set(active);
        self.weight_stop_active = active;
    }

    pub fn weight_stop_active(&self) -> bool {
        self.weight_stop_active
    }

    pub fn on_byte(&mut self, b: u8, now_ms: u64) -> Result<Option<Packet>, brewos_shared::packet::FrameError> {
        self.link.on_byte(b, now_ms)
    }

    pub fn tick<S: FrameSink>(&mut self, sink: &mut S, now_ms: u64) -> heapless::Vec<brewos_shared::link::TickEvent, N> {
        self.link.tick(sink, now_ms)
    }

    /// Route one parsed packet. Narrows the generic `Dispatch` variant down
    /// to the message types this side actually consumes unprompted
    /// (status/alarm/log/boot/config), mirroring
    /// `PicoProtocolHandler::handlePacket`'s switch over `packet.type`.
    pub fn on_packet<S: FrameSink>(
        &mut self,
        sink: &mut S,
        pkt: Packet,
        now_ms: u64,
    ) -> Result<ClientEvent, SendError<S::Error>> {
        let event = self.link.on_packet(sink, pkt, now_ms)?;
        match event {
            LinkEvent::Dispatch(p) => Ok(match MessageType::from_u8(p.msg_type) {
                Some(MessageType::Boot) => ClientEvent::BootInfo(p),
                Some(MessageType::Status) => ClientEvent::Status(p),
                Some(MessageType::Alarm) => ClientEvent::Alarm(p),
                Some(MessageType::Log) => ClientEvent::Log(p),
                Some(MessageType::Config) | Some(MessageType::EnvConfig) => ClientEvent::Config(p),
                _ => ClientEvent::Link(LinkEvent::Dispatch(p)),
            }),
            other => Ok(ClientEvent::Link(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(heapless::Vec<u8, 256>);
    impl FrameSink for VecSink {
        type Error = ();
        fn send_frame(&mut self, frame: &[u8]) -> Result<(), ()> {
            self.0.extend_from_slice(frame).map_err(|_| ())
        }
    }

    struct TrackedPin {
        active: bool,
    }
    impl WeightStopLine for TrackedPin {
        fn set(&mut self, active: bool) {
            self.active = active;
        }
    }

    #[test]
    fn weight_stop_is_tracked_locally() {
        let mut client = PicoLink::<4, _>::new(TrackedPin { active: false });
        assert!(!client.weight_stop_active());
        client.set_weight_stop(true);
        assert!(client.weight_stop_active());
        assert!(client.weight_stop.active);
    }

    #[test]
    fn set_temp_is_rejected_before_handshake() {
        let mut client = PicoLink::<4, _>::new(TrackedPin { active: false });
        let mut sink = VecSink(heapless::Vec::new());
        let err = client.send_set_temp(&mut sink, 0, 930, 0).unwrap_err();
        assert!(matches!(err, SendError::NotReady));
    }

    #[test]
    fn boot_info_packet_is_classified() {
        let mut client = PicoLink::<4, _>::new(TrackedPin { active: false });
        let mut sink = VecSink(heapless::Vec::new());
        let pkt = Packet::new(MessageType::Boot as u8, 0, &[1, 2, 3]).unwrap();
        let event = client.on_packet(&mut sink, pkt, 0).unwrap();
        assert!(matches!(event, ClientEvent::BootInfo(_)));
    }
}
