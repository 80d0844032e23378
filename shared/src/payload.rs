//! Wire payload layouts. All multi-byte fields are little-endian; fixed-point
//! fields use the scale noted on each struct. Encoding is done by hand
//! (rather than a `#[repr(C, packed)]` transmute) so the layout is independent
//! of target endianness and struct-packing rules.

macro_rules! le_field {
    ($buf:expr, $off:expr, u8) => {
        $buf[$off]
    };
    ($buf:expr, $off:expr, i16) => {
        i16::from_le_bytes([$buf[$off], $buf[$off + 1]])
    };
    ($buf:expr, $off:expr, u16) => {
        u16::from_le_bytes([$buf[$off], $buf[$off + 1]])
    };
    ($buf:expr, $off:expr, u32) => {
        u32::from_le_bytes([$buf[$off], $buf[$off + 1], $buf[$off + 2], $buf[$off + 3]])
    };
    ($buf:expr, $off:expr, f32) => {
        f32::from_le_bytes([$buf[$off], $buf[$off + 1], $buf[$off + 2], $buf[$off + 3]])
    };
}

/// Periodic machine status, RT-MCU to C-MCU. 32 bytes on the wire.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusPayload {
    /// Celsius * 10.
    pub brew_temp: i16,
    pub steam_temp: i16,
    pub group_temp: i16,
    /// Bar * 100.
    pub pressure: u16,
    pub brew_setpoint: i16,
    pub steam_setpoint: i16,
    /// 0-100%.
    pub brew_output: u8,
    pub steam_output: u8,
    pub pump_output: u8,
    pub state: u8,
    pub flags: u8,
    pub water_level: u8,
    pub power_watts: u16,
    pub uptime_ms: u32,
    /// 0 when not brewing.
    pub shot_start_timestamp_ms: u32,
    pub heating_strategy: u8,
    pub cleaning_reminder: u8,
    pub brew_count: u16,
}

impl StatusPayload {
    pub const SIZE: usize = 32;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..2].copy_from_slice(&self.brew_temp.to_le_bytes());
        buf[2..4].copy_from_slice(&self.steam_temp.to_le_bytes());
        buf[4..6].copy_from_slice(&self.group_temp.to_le_bytes());
        buf[6..8].copy_from_slice(&self.pressure.to_le_bytes());
        buf[8..10].copy_from_slice(&self.brew_setpoint.to_le_bytes());
        buf[10..12].copy_from_slice(&self.steam_setpoint.to_le_bytes());
        buf[12] = self.brew_output;
        buf[13] = self.steam_output;
        buf[14] = self.pump_output;
        buf[15] = self.state;
        buf[16] = self.flags;
        buf[17] = self.water_level;
        buf[18..20].copy_from_slice(&self.power_watts.to_le_bytes());
        buf[20..24].copy_from_slice(&self.uptime_ms.to_le_bytes());
        buf[24..28].copy_from_slice(&self.shot_start_timestamp_ms.to_le_bytes());
        buf[28] = self.heating_strategy;
        buf[29] = self.cleaning_reminder;
        buf[30..32].copy_from_slice(&self.brew_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            brew_temp: le_field!(buf, 0, i16),
            steam_temp: le_field!(buf, 2, i16),
            group_temp: le_field!(buf, 4, i16),
            pressure: le_field!(buf, 6, u16),
            brew_setpoint: le_field!(buf, 8, i16),
            steam_setpoint: le_field!(buf, 10, i16),
            brew_output: buf[12],
            steam_output: buf[13],
            pump_output: buf[14],
            state: buf[15],
            flags: buf[16],
            water_level: buf[17],
            power_watts: le_field!(buf, 18, u16),
            uptime_ms: le_field!(buf, 20, u32),
            shot_start_timestamp_ms: le_field!(buf, 24, u32),
            heating_strategy: buf[28],
            cleaning_reminder: buf[29],
            brew_count: le_field!(buf, 30, u16),
        })
    }
}

/// 4 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmPayload {
    pub code: u8,
    /// 0=warning, 1=error, 2=critical.
    pub severity: u8,
    pub value: u16,
}

impl AlarmPayload {
    pub const SIZE: usize = 4;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.code;
        buf[1] = self.severity;
        buf[2..4].copy_from_slice(&self.value.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            code: buf[0],
            severity: buf[1],
            value: le_field!(buf, 2, u16),
        })
    }
}

/// 32 bytes. `build_date`/`build_time` are ASCII, space-padded, not
/// null-terminated on the wire (matches the original compiler-emitted
/// `__DATE__`/`__TIME__` strings).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootPayload {
    pub version_major: u8,
    pub version_minor: u8,
    pub version_patch: u8,
    pub machine_type: u8,
    pub pcb_type: u8,
    pub pcb_version_major: u8,
    pub pcb_version_minor: u8,
    pub reset_reason: u32,
    pub build_date: [u8; 12],
    pub build_time: [u8; 7],
    pub protocol_version_major: u8,
    pub protocol_version_minor: u8,
}

impl BootPayload {
    pub const SIZE: usize = 32;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.version_major;
        buf[1] = self.version_minor;
        buf[2] = self.version_patch;
        buf[3] = self.machine_type;
        buf[4] = self.pcb_type;
        buf[5] = self.pcb_version_major;
        buf[6] = self.pcb_version_minor;
        buf[7..11].copy_from_slice(&self.reset_reason.to_le_bytes());
        buf[11..23].copy_from_slice(&self.build_date);
        buf[23..30].copy_from_slice(&self.build_time);
        buf[30] = self.protocol_version_major;
        buf[31] = self.protocol_version_minor;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut build_date = [0u8; 12];
        build_date.copy_from_slice(&buf[11..23]);
        let mut build_time = [0u8; 7];
        build_time.copy_from_slice(&buf[23..30]);
        Some(Self {
            version_major: buf[0],
            version_minor: buf[1],
            version_patch: buf[2],
            machine_type: buf[3],
            pcb_type: buf[4],
            pcb_version_major: buf[5],
            pcb_version_minor: buf[6],
            reset_reason: le_field!(buf, 7, u32),
            build_date,
            build_time,
            protocol_version_major: buf[30],
            protocol_version_minor: buf[31],
        })
    }
}

/// 6 bytes. Both sides announce one of these after reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandshakePayload {
    pub protocol_version_major: u8,
    pub protocol_version_minor: u8,
    pub capabilities: u8,
    pub max_retry_count: u8,
    pub ack_timeout_ms: u16,
}

impl HandshakePayload {
    pub const SIZE: usize = 6;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.protocol_version_major;
        buf[1] = self.protocol_version_minor;
        buf[2] = self.capabilities;
        buf[3] = self.max_retry_count;
        buf[4..6].copy_from_slice(&self.ack_timeout_ms.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            protocol_version_major: buf[0],
            protocol_version_minor: buf[1],
            capabilities: buf[2],
            max_retry_count: buf[3],
            ack_timeout_ms: le_field!(buf, 4, u16),
        })
    }
}

/// 14 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigPayload {
    pub brew_setpoint: i16,
    pub steam_setpoint: i16,
    pub temp_offset: i16,
    /// Gain * 100.
    pub pid_kp: u16,
    pub pid_ki: u16,
    pub pid_kd: u16,
    pub heating_strategy: u8,
    pub machine_type: u8,
}

impl ConfigPayload {
    pub const SIZE: usize = 14;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..2].copy_from_slice(&self.brew_setpoint.to_le_bytes());
        buf[2..4].copy_from_slice(&self.steam_setpoint.to_le_bytes());
        buf[4..6].copy_from_slice(&self.temp_offset.to_le_bytes());
        buf[6..8].copy_from_slice(&self.pid_kp.to_le_bytes());
        buf[8..10].copy_from_slice(&self.pid_ki.to_le_bytes());
        buf[10..12].copy_from_slice(&self.pid_kd.to_le_bytes());
        buf[12] = self.heating_strategy;
        buf[13] = self.machine_type;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            brew_setpoint: le_field!(buf, 0, i16),
            steam_setpoint: le_field!(buf, 2, i16),
            temp_offset: le_field!(buf, 4, i16),
            pid_kp: le_field!(buf, 6, u16),
            pid_ki: le_field!(buf, 8, u16),
            pid_kd: le_field!(buf, 10, u16),
            heating_strategy: buf[12],
            machine_type: buf[13],
        })
    }
}

/// 3 bytes. `CmdSetTemp`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmdSetTemp {
    /// 0=brew, 1=steam.
    pub target: u8,
    pub temperature: i16,
}

impl CmdSetTemp {
    pub const SIZE: usize = 3;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.target;
        buf[1..3].copy_from_slice(&self.temperature.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            target: buf[0],
            temperature: le_field!(buf, 1, i16),
        })
    }
}

/// 7 bytes. `CmdSetPid`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmdSetPid {
    pub target: u8,
    pub kp: u16,
    pub ki: u16,
    pub kd: u16,
}

impl CmdSetPid {
    pub const SIZE: usize = 7;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.target;
        buf[1..3].copy_from_slice(&self.kp.to_le_bytes());
        buf[3..5].copy_from_slice(&self.ki.to_le_bytes());
        buf[5..7].copy_from_slice(&self.kd.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            target: buf[0],
            kp: le_field!(buf, 1, u16),
            ki: le_field!(buf, 3, u16),
            kd: le_field!(buf, 5, u16),
        })
    }
}

/// 1 byte. `CmdBrew`. 0=stop, 1=start.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmdBrew {
    pub action: u8,
}

/// 1 byte. `CmdMode`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmdMode {
    pub mode: u8,
}

/// 6 bytes. `ConfigType::Environmental` sub-payload of `CmdConfig`.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigEnvironmental {
    pub nominal_voltage: u16,
    pub max_current_draw: f32,
}

impl ConfigEnvironmental {
    pub const SIZE: usize = 6;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..2].copy_from_slice(&self.nominal_voltage.to_le_bytes());
        buf[2..6].copy_from_slice(&self.max_current_draw.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            nominal_voltage: le_field!(buf, 0, u16),
            max_current_draw: le_field!(buf, 2, f32),
        })
    }
}

/// 5 bytes. `ConfigType::Preinfusion` sub-payload of `CmdConfig`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigPreinfusion {
    pub enabled: u8,
    pub on_time_ms: u16,
    pub pause_time_ms: u16,
}

impl ConfigPreinfusion {
    pub const SIZE: usize = 5;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.enabled;
        buf[1..3].copy_from_slice(&self.on_time_ms.to_le_bytes());
        buf[3..5].copy_from_slice(&self.pause_time_ms.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            enabled: buf[0],
            on_time_ms: le_field!(buf, 1, u16),
            pause_time_ms: le_field!(buf, 3, u16),
        })
    }
}

/// 32 bytes. `ConfigType::MachineInfo` sub-payload of `CmdConfig`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConfigMachineInfo {
    pub brand: [u8; 16],
    pub model: [u8; 16],
}

impl ConfigMachineInfo {
    pub const SIZE: usize = 32;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut brand = [0u8; 16];
        brand.copy_from_slice(&buf[0..16]);
        let mut model = [0u8; 16];
        model.copy_from_slice(&buf[16..32]);
        Some(Self { brand, model })
    }
}

/// 18 bytes. Environmental config snapshot broadcast by the RT-MCU.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnvConfigPayload {
    pub nominal_voltage: u16,
    pub max_current_draw: f32,
    pub brew_heater_current: f32,
    pub steam_heater_current: f32,
    pub max_combined_current: f32,
}

impl EnvConfigPayload {
    pub const SIZE: usize = 18;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..2].copy_from_slice(&self.nominal_voltage.to_le_bytes());
        buf[2..6].copy_from_slice(&self.max_current_draw.to_le_bytes());
        buf[6..10].copy_from_slice(&self.brew_heater_current.to_le_bytes());
        buf[10..14].copy_from_slice(&self.steam_heater_current.to_le_bytes());
        buf[14..18].copy_from_slice(&self.max_combined_current.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            nominal_voltage: le_field!(buf, 0, u16),
            max_current_draw: le_field!(buf, 2, f32),
            brew_heater_current: le_field!(buf, 6, f32),
            steam_heater_current: le_field!(buf, 10, f32),
            max_combined_current: le_field!(buf, 14, f32),
        })
    }
}

/// 32 bytes. One self-test result, streamed after a `DiagHeaderPayload`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DiagResultPayload {
    pub test_id: u8,
    pub status: u8,
    pub raw_value: i16,
    pub expected_min: i16,
    pub expected_max: i16,
    pub message: [u8; 24],
}

impl DiagResultPayload {
    pub const SIZE: usize = 32;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.test_id;
        buf[1] = self.status;
        buf[2..4].copy_from_slice(&self.raw_value.to_le_bytes());
        buf[4..6].copy_from_slice(&self.expected_min.to_le_bytes());
        buf[6..8].copy_from_slice(&self.expected_max.to_le_bytes());
        buf[8..32].copy_from_slice(&self.message);
    }
}

/// 8 bytes. Precedes a stream of `DiagResultPayload`s.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DiagHeaderPayload {
    pub test_count: u8,
    pub pass_count: u8,
    pub fail_count: u8,
    pub warn_count: u8,
    pub skip_count: u8,
    pub is_complete: u8,
    pub duration_ms: u16,
}

impl DiagHeaderPayload {
    pub const SIZE: usize = 8;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.test_count;
        buf[1] = self.pass_count;
        buf[2] = self.fail_count;
        buf[3] = self.warn_count;
        buf[4] = self.skip_count;
        buf[5] = self.is_complete;
        buf[6..8].copy_from_slice(&self.duration_ms.to_le_bytes());
    }
}

/// 4 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AckPayload {
    pub cmd_type: u8,
    pub cmd_seq: u8,
    pub result: u8,
    pub reserved: u8,
}

impl AckPayload {
    pub const SIZE: usize = 4;

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = self.cmd_type;
        buf[1] = self.cmd_seq;
        buf[2] = self.result;
        buf[3] = self.reserved;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            cmd_type: buf[0],
            cmd_seq: buf[1],
            result: buf[2],
            reserved: buf[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_payload_round_trips() {
        let s = StatusPayload {
            brew_temp: 930,
            steam_temp: 1450,
            group_temp: -10,
            pressure: 900,
            brew_setpoint: 930,
            steam_setpoint: 1450,
            brew_output: 50,
            steam_output: 0,
            pump_output: 100,
            state: 3,
            flags: 0b0000_0111,
            water_level: 80,
            power_watts: 1500,
            uptime_ms: 123_456,
            shot_start_timestamp_ms: 120_000,
            heating_strategy: 1,
            cleaning_reminder: 0,
            brew_count: 42,
        };
        let mut buf = [0u8; StatusPayload::SIZE];
        s.encode(&mut buf);
        assert_eq!(StatusPayload::decode(&buf), Some(s));
    }

    #[test]
    fn ack_payload_round_trips() {
        let a = AckPayload {
            cmd_type: 0x10,
            cmd_seq: 7,
            result: 0,
            reserved: 0,
        };
        let mut buf = [0u8; AckPayload::SIZE];
        a.encode(&mut buf);
        assert_eq!(AckPayload::decode(&buf), Some(a));
    }

    #[test]
    fn cmd_set_temp_round_trips_negative_not_expected_but_full_range() {
        let c = CmdSetTemp {
            target: 1,
            temperature: 2000,
        };
        let mut buf = [0u8; CmdSetTemp::SIZE];
        c.encode(&mut buf);
        assert_eq!(CmdSetTemp::decode(&buf), Some(c));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(StatusPayload::decode(&[0u8; 10]), None);
        assert_eq!(AckPayload::decode(&[0u8; 2]), None);
    }
}
