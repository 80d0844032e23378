//! Electrical/PID/preinfusion/cleaning-threshold persistence (spec §4.2,
//! §6 "Persistence (RT-MCU flash)"). A dedicated flash sector stores one
//! [`ConfigRecord`] guarded by a version marker and CRC; a record that
//! fails either check is treated as wholly absent rather than partially
//! trusted, and the machine refuses to heat until a valid one is written.

use brewos_shared::crc::crc32;
use brewos_shared::types::HeatingStrategy;

use crate::state::PreinfusionConfig;

pub const CONFIG_VERSION: u8 = 1;

/// Environmental config: required for operation (spec §3 "Environmental
/// config"). Bounds mirror spec §8's boundary table.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ElectricalConfig {
    pub nominal_voltage: u16,
    pub max_current_draw_a: f32,
}

pub const MIN_MAX_CURRENT_A: f32 = 1.0;
pub const MAX_MAX_CURRENT_A: f32 = 50.0;

impl ElectricalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_current_draw_a < MIN_MAX_CURRENT_A || self.max_current_draw_a > MAX_MAX_CURRENT_A {
            return Err(ConfigError::MaxCurrentOutOfRange);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PidTune {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidTune {
    fn default() -> Self {
        Self { kp: 0.0, ki: 0.0, kd: 0.0 }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CleaningConfig {
    pub threshold: u16,
    pub count: u16,
}

pub const MIN_CLEANING_THRESHOLD: u16 = 10;
pub const MAX_CLEANING_THRESHOLD: u16 = 1000;

/// The persisted record. Fixed layout, little-endian, encoded by hand like
/// the wire payloads so it is independent of in-memory struct layout.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigRecord {
    pub electrical: ElectricalConfig,
    pub brew_pid: PidTune,
    pub steam_pid: PidTune,
    pub heating_strategy: HeatingStrategy,
    pub preinfusion: PreinfusionConfig,
    pub cleaning: CleaningConfig,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    MaxCurrentOutOfRange,
    PreinfusionOutOfRange,
    CleaningThresholdOutOfRange,
}

/// Body bytes (everything after the version byte, before the CRC trailer).
const BODY_SIZE: usize = 2 + 4 // electrical
    + 4 * 3 // brew pid
    + 4 * 3 // steam pid
    + 1 // heating strategy
    + 1 + 2 + 2 // preinfusion
    + 2 + 2; // cleaning
/// Version byte + body + CRC32 trailer.
pub const RECORD_SIZE: usize = 1 + BODY_SIZE + 4;

impl ConfigRecord {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.electrical.validate().map_err(|_| ConfigError::MaxCurrentOutOfRange)?;
        self.preinfusion
            .validate()
            .map_err(|_| ConfigError::PreinfusionOutOfRange)?;
        if self.cleaning.threshold < MIN_CLEANING_THRESHOLD || self.cleaning.threshold > MAX_CLEANING_THRESHOLD {
            return Err(ConfigError::CleaningThresholdOutOfRange);
        }
        Ok(())
    }

    pub fn encode(&self, out: &mut [u8; RECORD_SIZE]) {
        out[0] = CONFIG_VERSION;
        let body = &mut out[1..1 + BODY_SIZE];
        body[0..2].copy_from_slice(&self.electrical.nominal_voltage.to_le_bytes());
        body[2..6].copy_from_slice(&self.electrical.max_current_draw_a.to_le_bytes());
        body[6..10].copy_from_slice(&self.brew_pid.kp.to_le_bytes());
        body[10..14].copy_from_slice(&self.brew_pid.ki.to_le_bytes());
        body[14..18].copy_from_slice(&self.brew_pid.kd.to_le_bytes());
        body[18..22].copy_from_slice(&self.steam_pid.kp.to_le_bytes());
        body[22..26].copy_from_slice(&self.steam_pid.ki.to_le_bytes());
        body[26..30].copy_from_slice(&self.steam_pid.kd.to_le_bytes());
        body[30] = self.heating_strategy as u8;
        body[31] = self.preinfusion.enabled as u8;
        body[32..34].copy_from_slice(&self.preinfusion.on_time_ms.to_le_bytes());
        body[34..36].copy_from_slice(&self.preinfusion.pause_time_ms.to_le_bytes());
        body[36..38].copy_from_slice(&self.cleaning.threshold.to_le_bytes());
        body[38..40].copy_from_slice(&self.cleaning.count.to_le_bytes());

        let crc = crc32(&out[0..1 + BODY_SIZE]);
        out[1 + BODY_SIZE..RECORD_SIZE].copy_from_slice(&crc.to_le_bytes());
    }

    /// Decode and CRC-check a raw flash sector image. An invalid version,
    /// truncated buffer, or CRC mismatch is treated as "no config present"
    /// rather than propagating a partially-trusted record.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_SIZE || buf[0] != CONFIG_VERSION {
            return None;
        }
        let expected_crc = u32::from_le_bytes(buf[1 + BODY_SIZE..RECORD_SIZE].try_into().ok()?);
        if crc32(&buf[0..1 + BODY_SIZE]) != expected_crc {
            return None;
        }
        let body = &buf[1..1 + BODY_SIZE];
        let f32_at = |o: usize| f32::from_le_bytes(body[o..o + 4].try_into().unwrap());
        Some(Self {
            electrical: ElectricalConfig {
                nominal_voltage: u16::from_le_bytes([body[0], body[1]]),
                max_current_draw_a: f32_at(2),
            },
            brew_pid: PidTune {
                kp: f32_at(6),
                ki: f32_at(10),
                kd: f32_at(14),
            },
            steam_pid: PidTune {
                kp: f32_at(18),
                ki: f32_at(22),
                kd: f32_at(26),
            },
            heating_strategy: HeatingStrategy::from_u8(body[30])?,
            preinfusion: PreinfusionConfig {
                enabled: body[31] != 0,
                on_time_ms: u16::from_le_bytes([body[32], body[33]]),
                pause_time_ms: u16::from_le_bytes([body[34], body[35]]),
            },
            cleaning: CleaningConfig {
                threshold: u16::from_le_bytes([body[36], body[37]]),
                count: u16::from_le_bytes([body[38], body[39]]),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigRecord {
        ConfigRecord {
            electrical: ElectricalConfig {
                nominal_voltage: 230,
                max_current_draw_a: 13.0,
            },
            brew_pid: PidTune { kp: 12.5, ki: 0.8, kd: 3.2 },
            steam_pid: PidTune { kp: 10.0, ki: 0.5, kd: 1.5 },
            heating_strategy: HeatingStrategy::BrewPriority,
            preinfusion: PreinfusionConfig {
                enabled: true,
                on_time_ms: 2000,
                pause_time_ms: 5000,
            },
            cleaning: CleaningConfig { threshold: 200, count: 42 },
        }
    }

    #[test]
    fn save_then_load_round_trips_modulo_crc() {
        let rec = sample();
        let mut buf = [0u8; RECORD_SIZE];
        rec.encode(&mut buf);
        let loaded = ConfigRecord::decode(&buf).unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn corrupted_record_is_treated_as_absent() {
        let rec = sample();
        let mut buf = [0u8; RECORD_SIZE];
        rec.encode(&mut buf);
        buf[10] ^= 0xFF;
        assert!(ConfigRecord::decode(&buf).is_none());
    }

    #[test]
    fn wrong_version_is_treated_as_absent() {
        let rec = sample();
        let mut buf = [0u8; RECORD_SIZE];
        rec.encode(&mut buf);
        buf[0] = 0xFF;
        assert!(ConfigRecord::decode(&buf).is_none());
    }

    #[test]
    fn max_current_boundaries() {
        let mut e = ElectricalConfig {
            nominal_voltage: 230,
            max_current_draw_a: 1.0,
        };
        assert!(e.validate().is_ok());
        e.max_current_draw_a = 50.0;
        assert!(e.validate().is_ok());
        e.max_current_draw_a = 0.9;
        assert!(e.validate().is_err());
        e.max_current_draw_a = 50.1;
        assert!(e.validate().is_err());
    }
}
