//! Message type space and small value enums carried in packet payloads.
//!
//! The numeric values below are bit-exact where the protocol explicitly
//! names them; a handful of command types (0x12, 0x17-0x1E) and all of the
//! sub-enums are not pinned down anywhere retrievable, so they are assigned
//! here in the order the machine's own command dispatch uses them. See
//! `DESIGN.md` for the reasoning.

/// Top-level message type, carried in the packet's `type` byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe, payload is an echoed timestamp.
    Ping = 0x00,
    /// Periodic machine status, RT-MCU to C-MCU.
    Status = 0x01,
    /// Alarm notification.
    Alarm = 0x02,
    /// Boot announcement, sent once after reset and periodically re-sent.
    Boot = 0x03,
    /// Command acknowledgement.
    Ack = 0x04,
    /// Current brew/steam/PID config snapshot.
    Config = 0x05,
    /// Free-form debug string.
    Debug = 0x06,
    /// Forwarded log line.
    Log = 0x07,
    /// Environmental config snapshot (voltage, current limits).
    EnvConfig = 0x08,
    /// Deprecated brew statistics; retained for wire compatibility.
    Statistics = 0x09,
    /// Diagnostics header or result (sub-typed by payload shape).
    Diagnostics = 0x0A,
    /// Backpressure signal.
    Nack = 0x0B,
    /// Protocol handshake announcement.
    Handshake = 0x0C,
    /// Set brew or steam target temperature.
    CmdSetTemp = 0x10,
    /// Set PID gains for a controlled boiler.
    CmdSetPid = 0x11,
    /// Request a fresh `Boot` announcement without a reset.
    CmdGetBoot = 0x12,
    /// Start or stop a brew.
    CmdBrew = 0x13,
    /// Switch machine mode (idle/brew/steam).
    CmdMode = 0x14,
    /// Sub-typed configuration write, see [`ConfigType`].
    CmdConfig = 0x15,
    /// Request a `Config` snapshot.
    CmdGetConfig = 0x16,
    /// Request an `EnvConfig` snapshot.
    CmdGetEnvConfig = 0x17,
    /// Begin a cleaning cycle.
    CmdCleaningStart = 0x18,
    /// End a cleaning cycle early.
    CmdCleaningStop = 0x19,
    /// Reset the cleaning brew counter.
    CmdCleaningReset = 0x1A,
    /// Set the cleaning reminder threshold.
    CmdCleaningSetThreshold = 0x1B,
    /// Enter/exit eco mode or reconfigure it.
    CmdSetEco = 0x1C,
    /// Run the diagnostics self-test catalogue (all tests or one by id).
    CmdDiagnostics = 0x1D,
    /// Enter the in-band serial bootloader.
    CmdBootloader = 0x1F,
}

impl MessageType {
    /// `true` for message types that are ACKed by the receiver.
    pub const fn is_command(self) -> bool {
        matches!(self as u8, 0x10..=0x1F)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0x00 => Ping,
            0x01 => Status,
            0x02 => Alarm,
            0x03 => Boot,
            0x04 => Ack,
            0x05 => Config,
            0x06 => Debug,
            0x07 => Log,
            0x08 => EnvConfig,
            0x09 => Statistics,
            0x0A => Diagnostics,
            0x0B => Nack,
            0x0C => Handshake,
            0x10 => CmdSetTemp,
            0x11 => CmdSetPid,
            0x12 => CmdGetBoot,
            0x13 => CmdBrew,
            0x14 => CmdMode,
            0x15 => CmdConfig,
            0x16 => CmdGetConfig,
            0x17 => CmdGetEnvConfig,
            0x18 => CmdCleaningStart,
            0x19 => CmdCleaningStop,
            0x1A => CmdCleaningReset,
            0x1B => CmdCleaningSetThreshold,
            0x1C => CmdSetEco,
            0x1D => CmdDiagnostics,
            0x1F => CmdBootloader,
            _ => return None,
        })
    }
}

/// Machine state machine states, see spec §4.2's transition table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MachineState {
    Idle = 0,
    Heating = 1,
    Ready = 2,
    Brewing = 3,
    Steam = 4,
    Eco = 5,
    Cleaning = 6,
    Fault = 7,
}

impl MachineState {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MachineState::*;
        Some(match v {
            0 => Idle,
            1 => Heating,
            2 => Ready,
            3 => Brewing,
            4 => Steam,
            5 => Eco,
            6 => Cleaning,
            7 => Fault,
            _ => return None,
        })
    }
}

/// `cmd_mode_t` target for [`MessageType::CmdMode`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MachineMode {
    Idle = 0,
    Brew = 1,
    Steam = 2,
}

impl MachineMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MachineMode::*;
        Some(match v {
            0 => Idle,
            1 => Brew,
            2 => Steam,
            _ => return None,
        })
    }
}

/// Physical boiler arrangement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MachineType {
    DualBoiler = 0,
    SingleBoiler = 1,
    HeatExchanger = 2,
}

impl MachineType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MachineType::*;
        Some(match v {
            0 => DualBoiler,
            1 => SingleBoiler,
            2 => HeatExchanger,
            _ => return None,
        })
    }
}

/// Heat-exchanger sub-mode, only meaningful when `MachineType::HeatExchanger`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HxSubMode {
    Temperature = 0,
    Pressure = 1,
    PressurestatMonitor = 2,
}

/// Dual-boiler heating schedule policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HeatingStrategy {
    BothOn = 0,
    BrewPriority = 1,
    SteamPriority = 2,
    Alternating = 3,
}

impl HeatingStrategy {
    pub fn from_u8(v: u8) -> Option<Self> {
        use HeatingStrategy::*;
        Some(match v {
            0 => BothOn,
            1 => BrewPriority,
            2 => SteamPriority,
            3 => Alternating,
            _ => return None,
        })
    }
}

/// `config_type` leading byte of `CmdConfig` payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConfigType {
    HeatingStrategy = 0x01,
    Preinfusion = 0x02,
    Environmental = 0x05,
    MachineInfo = 0x07,
}

impl ConfigType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ConfigType::*;
        Some(match v {
            0x01 => HeatingStrategy,
            0x02 => Preinfusion,
            0x05 => Environmental,
            0x07 => MachineInfo,
            _ => return None,
        })
    }
}

/// Result code carried in `ack_payload_t.result`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AckResult {
    Success = 0x00,
    ErrorInvalid = 0x01,
    ErrorRejected = 0x02,
    ErrorUnknownType = 0x03,
}

/// `alarm_payload_t.severity`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AlarmSeverity {
    Warning = 0,
    Error = 1,
    Critical = 2,
}

/// `alarm_payload_t.code`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AlarmCode {
    OverTemperature = 0,
    DryBoiler = 1,
    LeakDetected = 2,
    HeartbeatLost = 3,
    ClassBFailure = 4,
    MissingEnvironmentalConfig = 5,
    BootloaderFailed = 6,
    SensorFault = 7,
    BrewCompleted = 8,
}

/// `diag_result_payload_t.status`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DiagStatus {
    Pass = 0,
    Fail = 1,
    Warn = 2,
    Skip = 3,
}

/// `diag_result_payload_t.test_id`; `All` requests the whole catalogue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DiagTestId {
    Sensors = 0,
    Outputs = 1,
    ClassB = 2,
    All = 0xFF,
}

/// Bit positions within `status_payload_t.flags`.
pub mod status_flags {
    pub const BREWING: u8 = 1 << 0;
    pub const PUMP_ON: u8 = 1 << 1;
    pub const HEATING: u8 = 1 << 2;
    pub const WATER_LOW: u8 = 1 << 3;
    pub const ALARM: u8 = 1 << 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips() {
        for raw in [0x00u8, 0x0C, 0x10, 0x17, 0x1D, 0x1F] {
            let mt = MessageType::from_u8(raw).unwrap();
            assert_eq!(mt as u8, raw);
        }
    }

    #[test]
    fn reserved_gap_is_rejected() {
        assert!(MessageType::from_u8(0x1E).is_none());
        assert!(MessageType::from_u8(0x0D).is_none());
    }

    #[test]
    fn command_range_flags_is_command() {
        assert!(MessageType::CmdSetTemp.is_command());
        assert!(MessageType::CmdBootloader.is_command());
        assert!(!MessageType::Status.is_command());
        assert!(!MessageType::Handshake.is_command());
    }
}
