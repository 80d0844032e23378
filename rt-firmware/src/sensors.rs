//! NTC/thermocouple/pressure/level acquisition: rolling-median filtering,
//! range checking, and fault debounce. Machine-type-aware — a sensor absent
//! on a given machine variant is never sampled and therefore can never
//! fault (spec §3 "Sensor reading").

use brewos_shared::types::MachineType;

/// Physical quantity a [`SensorChannel`] reads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SensorKind {
    BrewTemp,
    SteamTemp,
    GroupTemp,
    Pressure,
    WaterLevel,
}

impl SensorKind {
    /// `true` if this machine variant has the physical sensor wired up.
    /// Dual-boiler machines carry independent brew/steam thermowells;
    /// single-boiler machines share one boiler temp for both roles; HX
    /// machines expose the HX outlet as `BrewTemp` and the boiler itself as
    /// `GroupTemp`, with steam regulated off the same boiler reading.
    pub const fn is_present(self, machine: MachineType) -> bool {
        match (self, machine) {
            (SensorKind::Pressure | SensorKind::WaterLevel | SensorKind::BrewTemp, _) => true,
            (SensorKind::SteamTemp, MachineType::DualBoiler) => true,
            (SensorKind::SteamTemp, MachineType::SingleBoiler | MachineType::HeatExchanger) => false,
            (SensorKind::GroupTemp, MachineType::HeatExchanger) => true,
            (SensorKind::GroupTemp, MachineType::DualBoiler | MachineType::SingleBoiler) => false,
        }
    }
}

/// Valid range for a raw reading, in the sensor's native fixed-point units.
/// Readings outside this band count toward the fault debounce.
#[derive(Clone, Copy, Debug)]
pub struct Range {
    pub min: i32,
    pub max: i32,
}

impl Range {
    pub const fn contains(self, value: i32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// 0.1 degC, plausible range for any boiler/group thermowell on this machine family.
pub const TEMP_RANGE: Range = Range { min: -50, max: 2500 };
/// 0.01 bar.
pub const PRESSURE_RANGE: Range = Range { min: 0, max: 1500 };
/// 0-100 %.
pub const WATER_LEVEL_RANGE: Range = Range { min: 0, max: 100 };

/// Consecutive out-of-range (or flatlined) samples before a channel is
/// escalated to the safety gate as stuck/out-of-range.
const FAULT_DEBOUNCE_COUNT: u8 = 5;

/// Rolling-median filter window.
const FILTER_WINDOW: usize = 5;

/// One physical channel: raw-sample ring buffer, median filter, and a
/// debounce counter for persistent faults.
pub struct SensorChannel {
    kind: SensorKind,
    range: Range,
    window: [i32; FILTER_WINDOW],
    filled: usize,
    next_slot: usize,
    bad_count: u8,
    pub last_filtered: i32,
    pub valid: bool,
}

impl SensorChannel {
    pub const fn new(kind: SensorKind, range: Range) -> Self {
        Self {
            kind,
            range,
            window: [0; FILTER_WINDOW],
            filled: 0,
            next_slot: 0,
            bad_count: 0,
            last_filtered: 0,
            valid: false,
        }
    }

    pub const fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Feed one raw sample. Updates the median filter and the fault
    /// debounce; `valid` reflects whether the filtered value is currently
    /// trustworthy (in range and not stuck).
    pub fn push(&mut self, raw: i32) {
        self.window[self.next_slot] = raw;
        self.next_slot = (self.next_slot + 1) % FILTER_WINDOW;
        self.filled = core::cmp::min(self.filled + 1, FILTER_WINDOW);

        let filtered = median(&self.window[..self.filled]);
        self.last_filtered = filtered;

        let in_range = self.range.contains(filtered);
        let stuck = self.filled == FILTER_WINDOW && self.window.iter().all(|&v| v == self.window[0]);

        if in_range && !stuck {
            self.bad_count = 0;
            self.valid = true;
        } else {
            self.bad_count = self.bad_count.saturating_add(1);
            if self.bad_count >= FAULT_DEBOUNCE_COUNT {
                self.valid = false;
            }
        }
    }

    /// `true` once the debounce threshold has been crossed: a persistent
    /// fault the safety gate should escalate to CRITICAL.
    pub fn is_faulted(&self) -> bool {
        self.bad_count >= FAULT_DEBOUNCE_COUNT
    }
}

/// Insertion-sort median over a small fixed window; no allocation, no_std.
fn median(samples: &[i32]) -> i32 {
    let mut sorted = [0i32; FILTER_WINDOW];
    sorted[..samples.len()].copy_from_slice(samples);
    let slice = &mut sorted[..samples.len()];
    for i in 1..slice.len() {
        let key = slice[i];
        let mut j = i;
        while j > 0 && slice[j - 1] > key {
            slice[j] = slice[j - 1];
            j -= 1;
        }
        slice[j] = key;
    }
    slice[slice.len() / 2]
}

/// The full set of channels for one machine, filtered through
/// [`SensorKind::is_present`] so absent sensors are simply never touched.
pub struct SensorSet {
    pub brew_temp: SensorChannel,
    pub steam_temp: SensorChannel,
    pub group_temp: SensorChannel,
    pub pressure: SensorChannel,
    pub water_level: SensorChannel,
    machine: MachineType,
}

impl SensorSet {
    pub const fn new(machine: MachineType) -> Self {
        Self {
            brew_temp: SensorChannel::new(SensorKind::BrewTemp, TEMP_RANGE),
            steam_temp: SensorChannel::new(SensorKind::SteamTemp, TEMP_RANGE),
            group_temp: SensorChannel::new(SensorKind::GroupTemp, TEMP_RANGE),
            pressure: SensorChannel::new(SensorKind::Pressure, PRESSURE_RANGE),
            water_level: SensorChannel::new(SensorKind::WaterLevel, WATER_LEVEL_RANGE),
            machine,
        }
    }

    /// Sample one channel if (and only if) it is physically present on this
    /// machine; a no-op for absent sensors, so they never accumulate faults.
    pub fn update(&mut self, kind: SensorKind, raw: i32) {
        if !kind.is_present(self.machine) {
            return;
        }
        match kind {
            SensorKind::BrewTemp => self.brew_temp.push(raw),
            SensorKind::SteamTemp => self.steam_temp.push(raw),
            SensorKind::GroupTemp => self.group_temp.push(raw),
            SensorKind::Pressure => self.pressure.push(raw),
            SensorKind::WaterLevel => self.water_level.push(raw),
        }
    }

    /// `true` if any present sensor has crossed the fault debounce.
    pub fn any_faulted(&self) -> bool {
        let present = |k: SensorKind| k.is_present(self.machine);
        (present(SensorKind::BrewTemp) && self.brew_temp.is_faulted())
            || (present(SensorKind::SteamTemp) && self.steam_temp.is_faulted())
            || (present(SensorKind::GroupTemp) && self.group_temp.is_faulted())
            || (present(SensorKind::Pressure) && self.pressure.is_faulted())
            || (present(SensorKind::WaterLevel) && self.water_level.is_faulted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_filter_rejects_single_spike() {
        let mut ch = SensorChannel::new(SensorKind::BrewTemp, TEMP_RANGE);
        for v in [900, 901, 902, 903, 904] {
            ch.push(v);
        }
        // A single huge spike should not move the median much.
        ch.push(2400);
        assert!(ch.last_filtered < 1000);
    }

    #[test]
    fn out_of_range_debounces_before_faulting() {
        let mut ch = SensorChannel::new(SensorKind::BrewTemp, TEMP_RANGE);
        for _ in 0..FAULT_DEBOUNCE_COUNT - 1 {
            ch.push(9999);
        }
        assert!(!ch.is_faulted());
        ch.push(9999);
        assert!(ch.is_faulted());
    }

    #[test]
    fn absent_sensor_on_single_boiler_is_never_touched() {
        let mut set = SensorSet::new(MachineType::SingleBoiler);
        for _ in 0..20 {
            set.update(SensorKind::SteamTemp, 99999);
        }
        assert!(!set.steam_temp.is_faulted());
        assert!(!set.any_faulted());
    }

    #[test]
    fn stuck_reading_is_detected_as_fault() {
        let mut ch = SensorChannel::new(SensorKind::Pressure, PRESSURE_RANGE);
        for _ in 0..FAULT_DEBOUNCE_COUNT + FILTER_WINDOW {
            ch.push(500);
        }
        assert!(ch.is_faulted());
    }
}
