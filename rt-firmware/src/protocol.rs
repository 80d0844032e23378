//! RT-MCU side of the framed inter-MCU protocol (spec §4.1): decodes
//! command-class payloads into [`RtCommand`]s for Core A to apply, and
//! drives [`brewos_shared::link::ProtocolLink`] over UART1 on Core B.

use brewos_shared::link::{LinkEvent, ProtocolLink};
use brewos_shared::payload::{
    CmdSetPid, CmdSetTemp, ConfigEnvironmental, ConfigPreinfusion, DiagHeaderPayload, DiagResultPayload,
};
use brewos_shared::types::{AckResult, ConfigType, DiagTestId, HeatingStrategy, MachineMode, MessageType};
use brewos_shared::Packet;

/// Commands dispatched to Core A after a command-class packet is decoded.
/// Mirrors the sub-type space in spec §6 (`CmdConfig`'s leading
/// `config_type` byte is folded into the `Config*` variants here).
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RtCommand {
    SetTemp { target: u8, temperature_c10: i16 },
    SetPid { target: u8, kp: u16, ki: u16, kd: u16 },
    Brew { start: bool },
    Mode(MachineMode),
    ConfigEnvironmental(ConfigEnvironmental),
    ConfigPreinfusion(ConfigPreinfusion),
    ConfigHeatingStrategy(HeatingStrategy),
    GetConfig,
    GetEnvConfig,
    CleaningStart,
    CleaningStop,
    CleaningReset,
    CleaningSetThreshold(u16),
    SetEco { enabled: bool, brew_temp_c10: i16, timeout_min: u8 },
    Diagnostics(DiagTestId),
    EnterBootloader,
}

/// Decode one command-class packet's payload. Returns `None` for a
/// malformed payload (wrong length, unknown sub-type, unknown enum value);
/// the caller ACKs with [`AckResult::ErrorInvalid`] in that case.
pub fn decode_command(msg_type: u8, payload: &[u8]) -> Option<RtCommand> {
    match MessageType::from_u8(msg_type)? {
        MessageType::CmdSetTemp => {
            let p = CmdSetTemp::decode(payload)?;
            Some(RtCommand::SetTemp {
                target: p.target,
                temperature_c10: p.temperature,
            })
        }
        MessageType::CmdSetPid => {
            let p = CmdSetPid::decode(payload)?;
            Some(RtCommand::SetPid {
                target: p.target,
                kp: p.kp,
                ki: p.ki,
                kd: p.kd,
            })
        }
        MessageType::CmdBrew => payload.first().map(|&a| RtCommand::Brew { start: a != 0 }),
        MessageType::CmdMode => payload.first().and_then(|&m| MachineMode::from_u8(m)).map(RtCommand::Mode),
        MessageType::CmdConfig => decode_config_command(payload),
        MessageType::CmdGetConfig => Some(RtCommand::GetConfig),
        MessageType::CmdGetEnvConfig => Some(RtCommand::GetEnvConfig),
        MessageType::CmdCleaningStart => Some(RtCommand::CleaningStart),
        MessageType::CmdCleaningStop => Some(RtCommand::CleaningStop),
        MessageType::CmdCleaningReset => Some(RtCommand::CleaningReset),
        MessageType::CmdCleaningSetThreshold => {
            if payload.len() < 2 {
                return None;
            }
            Some(RtCommand::CleaningSetThreshold(u16::from_le_bytes([payload[0], payload[1]])))
        }
        MessageType::CmdSetEco => {
            if payload.len() < 4 {
                return None;
            }
            Some(RtCommand::SetEco {
                enabled: payload[0] != 0,
                brew_temp_c10: i16::from_le_bytes([payload[1], payload[2]]),
                timeout_min: payload[3],
            })
        }
        MessageType::CmdDiagnostics => {
            let id = *payload.first()?;
            let test = match id {
                0 => DiagTestId::Sensors,
                1 => DiagTestId::Outputs,
                2 => DiagTestId::ClassB,
                0xFF => DiagTestId::All,
                _ => return None,
            };
            Some(RtCommand::Diagnostics(test))
        }
        MessageType::CmdBootloader => Some(RtCommand::EnterBootloader),
        _ => None,
    }
}

fn decode_config_command(payload: &[u8]) -> Option<RtCommand> {
    let config_type = ConfigType::from_u8(*payload.first()?)?;
    let body = &payload[1..];
    match config_type {
        ConfigType::Environmental => ConfigEnvironmental::decode(body).map(RtCommand::ConfigEnvironmental),
        ConfigType::Preinfusion => ConfigPreinfusion::decode(body).map(RtCommand::ConfigPreinfusion),
        ConfigType::HeatingStrategy => body.first().and_then(|&v| HeatingStrategy::from_u8(v)).map(RtCommand::ConfigHeatingStrategy),
        ConfigType::MachineInfo => None, // write-only from RT-MCU's perspective, never a config command here
    }
}

/// Encode a `DIAGNOSTICS` header frame into `out`; returns the byte count.
pub fn encode_diag_header(header: &DiagHeaderPayload, out: &mut [u8; DiagHeaderPayload::SIZE]) {
    header.encode(out);
}

/// Encode a `DIAGNOSTICS` result frame into `out`; returns the byte count.
pub fn encode_diag_result(result: &DiagResultPayload, out: &mut [u8; DiagResultPayload::SIZE]) {
    result.encode(out);
}

/// Outcome of processing one received packet through the link and dispatch
/// layer together, for the caller (Core B's comms task) to act on.
pub enum ProcessOutcome {
    /// A command was decoded; caller should apply it and ACK with `result`.
    Command { cmd_type: u8, seq: u8, cmd: RtCommand },
    /// A command-class packet failed to decode; caller should ACK with
    /// [`AckResult::ErrorInvalid`].
    InvalidCommand { cmd_type: u8, seq: u8 },
    /// Link-layer event with no application-level command (ACK/NACK/handshake).
    Link(LinkEvent),
    /// Nothing to do this call.
    None,
}

/// Feed one parsed packet through dispatch. Does not itself send the ACK —
/// that is the caller's job once it has applied (or rejected) the command,
/// since the result code depends on whether the command was also accepted
/// by the subsystem it targets (e.g. preinfusion bounds).
pub fn process_packet<const N: usize, S: brewos_shared::link::FrameSink>(
    link: &mut ProtocolLink<N>,
    sink: &mut S,
    pkt: Packet,
    now_ms: u64,
) -> Result<ProcessOutcome, brewos_shared::link::SendError<S::Error>> {
    let msg_type = pkt.msg_type;
    let seq = pkt.seq;
    let event = link.on_packet(sink, pkt, now_ms)?;
    match event {
        LinkEvent::Dispatch(ref p) if MessageType::from_u8(p.msg_type).map(|m| m.is_command()).unwrap_or(false) => {
            match decode_command(msg_type, &p.payload) {
                Some(cmd) => Ok(ProcessOutcome::Command { cmd_type: msg_type, seq, cmd }),
                None => Ok(ProcessOutcome::InvalidCommand { cmd_type: msg_type, seq }),
            }
        }
        LinkEvent::Dispatch(_) => Ok(ProcessOutcome::None),
        other => Ok(ProcessOutcome::Link(other)),
    }
}

/// Maps a command-application result to the wire [`AckResult`].
pub fn ack_result_for(applied: bool) -> AckResult {
    if applied {
        AckResult::Success
    } else {
        AckResult::ErrorRejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewos_shared::payload::{CmdSetPid, CmdSetTemp};

    #[test]
    fn set_temp_round_trips_through_decode() {
        let mut buf = [0u8; CmdSetTemp::SIZE];
        CmdSetTemp { target: 0, temperature: 930 }.encode(&mut buf);
        let cmd = decode_command(MessageType::CmdSetTemp as u8, &buf).unwrap();
        assert_eq!(cmd, RtCommand::SetTemp { target: 0, temperature_c10: 930 });
    }

    #[test]
    fn set_pid_round_trips_through_decode() {
        let mut buf = [0u8; CmdSetPid::SIZE];
        CmdSetPid { target: 1, kp: 1200, ki: 80, kd: 320 }.encode(&mut buf);
        let cmd = decode_command(MessageType::CmdSetPid as u8, &buf).unwrap();
        assert_eq!(
            cmd,
            RtCommand::SetPid {
                target: 1,
                kp: 1200,
                ki: 80,
                kd: 320
            }
        );
    }

    #[test]
    fn config_command_dispatches_on_leading_subtype() {
        let mut env_buf = [0u8; ConfigEnvironmental::SIZE];
        ConfigEnvironmental {
            nominal_voltage: 230,
            max_current_draw: 13.0,
        }
        .encode(&mut env_buf);
        let mut payload = heapless::Vec::<u8, 32>::new();
        payload.push(ConfigType::Environmental as u8).unwrap();
        payload.extend_from_slice(&env_buf).unwrap();
        let cmd = decode_command(MessageType::CmdConfig as u8, &payload).unwrap();
        assert!(matches!(cmd, RtCommand::ConfigEnvironmental(_)));
    }

    #[test]
    fn unknown_diag_test_id_is_rejected() {
        assert!(decode_command(MessageType::CmdDiagnostics as u8, &[0x42]).is_none());
    }

    #[test]
    fn empty_payload_for_brew_is_rejected() {
        assert!(decode_command(MessageType::CmdBrew as u8, &[]).is_none());
    }
}
