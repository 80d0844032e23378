//! BrewOS RT-MCU firmware: the safety-critical half of the two-MCU espresso
//! controller. Drives heaters, pump, and safety interlocks; exposes the
//! serial bootloader the C-MCU uses to push new firmware in-band.
//!
//! Pure-logic modules build under `std` in `#[cfg(test)]` so they carry unit
//! tests without a target; the crate itself stays `no_std` for firmware
//! builds.

#![cfg_attr(not(test), no_std)]

pub mod bootloader;
pub mod class_b;
pub mod config_persistence;
pub mod control;
pub mod diagnostics;
pub mod power_meter;
pub mod protocol;
pub mod safety;
pub mod sensors;
pub mod state;
pub mod tasks;

/// Control loop cadence, spec §4.2: Core A runs safety/sensors/state/control
/// at this rate.
pub const CONTROL_TICK_HZ: u32 = 10;
/// Sensor sampling cadence, twice the control rate.
pub const SENSOR_TICK_HZ: u32 = 20;
/// Watchdog window: if Core B's alive flag goes unset for this long, Core A
/// stops kicking the watchdog and lets it reset the system.
pub const WATCHDOG_ALIVE_TIMEOUT_MS: u64 = 2000;
