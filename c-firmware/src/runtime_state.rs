//! Double-buffered runtime snapshot (spec §4.5, §3 "Runtime UI state") and
//! the change detector that drives delta broadcast. Grounded in
//! `original_source/src/esp32/{include,src}/runtime_state.{h,cpp}`: two
//! full-size records, an atomically swapped active pointer, a mutex guarding
//! only the copy+swap critical section so readers never block and never see
//! a half-updated record.
//!
//! The original's `volatile ui_state_t*` pointer swap is realized here as an
//! `AtomicBool` selecting which of two fixed slots is active — the same
//! linearisation point (spec §5: "the runtime snapshot's active-pointer swap
//! is the linearisation point for a readable state"), expressed without raw
//! pointers.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

/// Everything a display, WebSocket client, or cloud listener needs to render
/// the live machine. Mirrors `ui_state_t` plus the WiFi/Pico/scale
/// connection flags the original updates through dedicated helpers.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RuntimeSnapshot {
    pub brew_temp_c10: i16,
    pub steam_temp_c10: i16,
    pub group_temp_c10: i16,
    pub pressure_bar100: u16,
    pub brew_setpoint_c10: i16,
    pub steam_setpoint_c10: i16,
    pub brew_output_pct: u8,
    pub steam_output_pct: u8,
    pub pump_output_pct: u8,
    pub machine_state: u8,
    pub flags: u8,
    pub water_level_pct: u8,
    pub power_watts: u16,
    pub uptime_ms: u32,
    pub brew_count: u16,
    pub cleaning_reminder: bool,
    pub scale_weight_g: f32,
    pub scale_flow_g_per_s: f32,
    pub scale_stable: bool,
    pub wifi_connected: bool,
    pub wifi_ap_mode: bool,
    pub wifi_rssi: i8,
    pub pico_connected: bool,
}

/// Bitset returned by [`detect_changes`]; one bit per field group, matching
/// the thresholds spec §4.5 names.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChangedFields(u16);

impl ChangedFields {
    pub const TEMPERATURE: u16 = 1 << 0;
    pub const PRESSURE: u16 = 1 << 1;
    pub const OUTPUTS: u16 = 1 << 2;
    pub const MACHINE_STATE: u16 = 1 << 3;
    pub const FLAGS: u16 = 1 << 4;
    pub const WEIGHT: u16 = 1 << 5;
    pub const POWER: u16 = 1 << 6;
    pub const CONNECTIVITY: u16 = 1 << 7;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }
}

/// Per-field-group thresholds a change must exceed to be reported, spec
/// §4.5: "temperature 0.1°C, pressure 0.05 bar, weight 0.1 g".
const TEMP_THRESHOLD_C10: i16 = 1;
const PRESSURE_THRESHOLD_BAR100: u16 = 5;
const WEIGHT_THRESHOLD_G: f32 = 0.1;

/// Compare `new` against `prev`, returning the field groups that moved
/// beyond their threshold. Grounded in `status_change_detector.cpp`'s
/// per-field comparison, generalised to the full snapshot rather than just
/// `StatusPayload`.
pub fn detect_changes(prev: &RuntimeSnapshot, new: &RuntimeSnapshot) -> ChangedFields {
    let mut changed = ChangedFields::empty();

    let temp_delta = |a: i16, b: i16| (a as i32 - b as i32).unsigned_abs();
    if temp_delta(new.brew_temp_c10, prev.brew_temp_c10) >= TEMP_THRESHOLD_C10 as u32
        || temp_delta(new.steam_temp_c10, prev.steam_temp_c10) >= TEMP_THRESHOLD_C10 as u32
        || temp_delta(new.group_temp_c10, prev.group_temp_c10) >= TEMP_THRESHOLD_C10 as u32
    {
        changed.set(ChangedFields::TEMPERATURE);
    }
    if new.pressure_bar100.abs_diff(prev.pressure_bar100) >= PRESSURE_THRESHOLD_BAR100 {
        changed.set(ChangedFields::PRESSURE);
    }
    if new.brew_output_pct != prev.brew_output_pct
        || new.steam_output_pct != prev.steam_output_pct
        || new.pump_output_pct != prev.pump_output_pct
    {
        changed.set(ChangedFields::OUTPUTS);
    }
    if new.machine_state != prev.machine_state {
        changed.set(ChangedFields::MACHINE_STATE);
    }
    if new.flags != prev.flags || new.cleaning_reminder != prev.cleaning_reminder {
        changed.set(ChangedFields::FLAGS);
    }
    if libm_abs(new.scale_weight_g - prev.scale_weight_g) >= WEIGHT_THRESHOLD_G
        || new.scale_stable != prev.scale_stable
    {
        changed.set(ChangedFields::WEIGHT);
    }
    if new.power_watts != prev.power_watts {
        changed.set(ChangedFields::POWER);
    }
    if new.wifi_connected != prev.wifi_connected
        || new.wifi_ap_mode != prev.wifi_ap_mode
        || new.pico_connected != prev.pico_connected
    {
        changed.set(ChangedFields::CONNECTIVITY);
    }

    changed
}

/// `f32::abs` without pulling in `std`; `core` has no float intrinsics.
fn libm_abs(x: f32) -> f32 {
    if x < 0.0 {
        -x
    } else {
        x
    }
}

/// Double-buffered snapshot store. Readers call [`Self::get`] lock-free;
/// writers go through [`Self::update`], which takes the mutex, copies the
/// active buffer into the inactive one so untouched fields survive, lets the
/// caller mutate, then flips the active slot.
pub struct RuntimeState {
    buffers: Mutex<CriticalSectionRawMutex, [RuntimeSnapshot; 2]>,
    active: AtomicBool,
}

impl RuntimeState {
    pub const fn new() -> Self {
        Self {
            buffers: Mutex::new([zeroed_snapshot(), zeroed_snapshot()]),
            active: AtomicBool::new(false),
        }
    }

    /// Lock-free read of the currently active buffer. Never observes a
    /// half-updated record: the active slot only ever names a buffer whose
    /// writer has already released the mutex (spec §8: "After endUpdate(),
    /// every subsequent reader observes exactly one consistent record").
    pub async fn get(&self) -> RuntimeSnapshot {
        let idx = self.active.load(Ordering::Acquire) as usize;
        let buffers = self.buffers.lock().await;
        buffers[idx]
    }

    /// Begin-mutate-end-swap in one call: copies the active buffer into the
    /// inactive slot, runs `f` against it, then flips the active pointer.
    /// Returns whatever `f` returns (typically the field groups that
    /// changed, computed by the caller via [`detect_changes`] against the
    /// snapshot this returns).
    pub async fn update<R>(&self, f: impl FnOnce(&mut RuntimeSnapshot) -> R) -> R {
        let mut buffers = self.buffers.lock().await;
        let active_idx = self.active.load(Ordering::Acquire) as usize;
        let inactive_idx = 1 - active_idx;
        buffers[inactive_idx] = buffers[active_idx];
        let result = f(&mut buffers[inactive_idx]);
        self.active.store(inactive_idx != 0, Ordering::Release);
        result
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

const fn zeroed_snapshot() -> RuntimeSnapshot {
    RuntimeSnapshot {
        brew_temp_c10: 0,
        steam_temp_c10: 0,
        group_temp_c10: 0,
        pressure_bar100: 0,
        brew_setpoint_c10: 0,
        steam_setpoint_c10: 0,
        brew_output_pct: 0,
        steam_output_pct: 0,
        pump_output_pct: 0,
        machine_state: 0,
        flags: 0,
        water_level_pct: 0,
        power_watts: 0,
        uptime_ms: 0,
        brew_count: 0,
        cleaning_reminder: false,
        scale_weight_g: 0.0,
        scale_flow_g_per_s: 0.0,
        scale_stable: false,
        wifi_connected: false,
        wifi_ap_mode: false,
        wifi_rssi: 0,
        pico_connected: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_change_below_threshold() {
        let prev = RuntimeSnapshot {
            brew_temp_c10: 900,
            ..zeroed_snapshot()
        };
        let new = RuntimeSnapshot {
            brew_temp_c10: 900,
            ..zeroed_snapshot()
        };
        assert!(detect_changes(&prev, &new).is_empty());
    }

    #[test]
    fn temperature_change_above_threshold_detected() {
        let prev = RuntimeSnapshot {
            brew_temp_c10: 900,
            ..zeroed_snapshot()
        };
        let new = RuntimeSnapshot {
            brew_temp_c10: 902,
            ..zeroed_snapshot()
        };
        let changed = detect_changes(&prev, &new);
        assert!(changed.contains(ChangedFields::TEMPERATURE));
        assert!(!changed.contains(ChangedFields::PRESSURE));
    }

    #[test]
    fn weight_change_detected_via_float_threshold() {
        let prev = RuntimeSnapshot {
            scale_weight_g: 18.0,
            ..zeroed_snapshot()
        };
        let new = RuntimeSnapshot {
            scale_weight_g: 18.2,
            ..zeroed_snapshot()
        };
        assert!(detect_changes(&prev, &new).contains(ChangedFields::WEIGHT));
    }

    #[test]
    fn update_is_observed_as_one_consistent_record() {
        let state = RuntimeState::new();
        crate::block_on(state.update(|s| {
            s.brew_temp_c10 = 930;
            s.machine_state = 3;
        }));
        let snap = crate::block_on(state.get());
        assert_eq!(snap.brew_temp_c10, 930);
        assert_eq!(snap.machine_state, 3);
    }

    #[test]
    fn unrelated_fields_survive_a_targeted_update() {
        let state = RuntimeState::new();
        crate::block_on(state.update(|s| s.brew_temp_c10 = 930));
        crate::block_on(state.update(|s| s.wifi_connected = true));
        let snap = crate::block_on(state.get());
        assert_eq!(snap.brew_temp_c10, 930);
        assert!(snap.wifi_connected);
    }
}
