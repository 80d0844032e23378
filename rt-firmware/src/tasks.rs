//! Embassy task wiring for the RT-MCU: Core A's control loop and Core B's
//! comms loop, modelled as cooperative async tasks sharing state behind a
//! `Mutex<CriticalSectionRawMutex, _>` the way a single-executor Embassy
//! application shares state between tasks rather than across real cores
//! (spec §4.2 "two logical cores"). A concrete board crate supplies the
//! peripherals (ADC sampler, leak/heartbeat lines, UART, flash) and spawns
//! these from its own `#[embassy_executor::main]`.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Ticker};

use brewos_shared::types::{HeatingStrategy, MachineMode};

use crate::class_b::{self, ClassB, ClassBTest, StackCanary};
use crate::config_persistence::{ConfigRecord, ElectricalConfig, MIN_CLEANING_THRESHOLD, MAX_CLEANING_THRESHOLD};
use crate::control::{dispatch_dual_boiler, Alternator, Pid, PowerBudget};
use crate::diagnostics::{self, DiagInputs, DiagResult};
use crate::protocol::RtCommand;
use crate::safety::{SafetyGate, SafetyInputs, SafetyLevel};
use crate::sensors::{SensorKind, SensorSet};
use crate::state::{PreinfusionConfig, StateEvent, StateMachine};
use crate::{CONTROL_TICK_HZ, WATCHDOG_ALIVE_TIMEOUT_MS};

/// Hard over-temperature limit independent of any PID setpoint (spec §4.2
/// "hard limit", distinct from the regulated setpoint band).
const HARD_TEMP_LIMIT_C10: i32 = 1550;

/// Clock-sanity tolerance fed to `class_b::clock_sanity` each time the
/// class-B scheduler lands on `ClockCheck`.
const CLASS_B_CLOCK_TOLERANCE_PPM: u32 = 500;

/// Snapshot Core B reads to build `StatusPayload`/answer `CMD_GET_CONFIG`;
/// Core A is the only writer.
#[derive(Clone, Copy, Default, Debug)]
pub struct SharedStatus {
    pub state: u8,
    pub brew_temp_c10: i32,
    pub steam_temp_c10: i32,
    pub pressure: i32,
    pub brew_output: u8,
    pub steam_output: u8,
    pub flags: u8,
    pub water_level: i32,
    pub brew_setpoint_c10: i16,
    pub steam_setpoint_c10: i16,
    pub power_watts: u16,
    pub uptime_ms: u32,
    pub brew_count: u16,
}

pub type SharedStatusCell = Mutex<CriticalSectionRawMutex, SharedStatus>;

/// One outstanding decoded command at a time: Core B signals it in after
/// `protocol::process_packet` resolves a command-class packet, Core A
/// consumes and applies it on its next tick.
pub type CommandSignal = Signal<CriticalSectionRawMutex, RtCommand>;

/// Latest `CMD_DIAGNOSTICS` run's results, for Core B to drain and stream out
/// as `DIAGNOSTICS` header/result frames.
pub type DiagOutbox = Signal<CriticalSectionRawMutex, heapless::Vec<DiagResult, 4>>;

/// Core A pets this every control tick; Core B's comms loop treats a stale
/// flag as a lost-heartbeat fault (spec §4.2 "inter-core heartbeat").
pub static CORE_A_ALIVE: AtomicBool = AtomicBool::new(false);

/// Core B's comms loop pets this whenever it observes live traffic on the
/// wire; Core A clears it every control tick and counts consecutive misses
/// against [`WATCHDOG_ALIVE_TIMEOUT_MS`] to decide `heartbeat_lost`.
pub static CORE_B_ALIVE: AtomicBool = AtomicBool::new(false);

/// Set by `CMD_BOOTLOADER`; a concrete board crate's main loop polls this
/// between ticks and, once true, tears down the application tasks and jumps
/// to [`crate::bootloader`].
pub static BOOTLOADER_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Supplies one raw ADC-scale sample per channel per tick, plus the discrete
/// inputs the safety gate and class-B self-tests need that aren't sensor
/// channels in their own right. A concrete board crate implements this over
/// its own ADC, GPIO, and timers; this crate only consumes the readings.
pub trait RawInputs {
    fn sample(&mut self, kind: SensorKind) -> i32;
    fn leak_detected(&mut self) -> bool;
    fn environmental_config_present(&mut self) -> bool;
    /// Scratch RAM region dedicated to the RAM-march self-test; must never
    /// overlap live data, since the test is destructive to its contents.
    fn class_b_scratch(&mut self) -> &mut [u32];
    /// Measured clock frequency from an independent timer, for the
    /// clock-sanity self-test.
    fn measured_clock_hz(&mut self) -> u32;
    /// The board's nominal core clock, compared against `measured_clock_hz`.
    fn nominal_clock_hz(&self) -> u32;
    /// Application code region checked against `class_b::EXPECTED_CODE_CRC`.
    fn code_region(&self) -> &[u8];
    /// Bytes of stack currently free below the deepest-ever high-water mark.
    fn stack_free_bytes(&mut self) -> usize;
}

/// Command-routing targets `apply_command` mutates in place, owned entirely
/// by `control_task` and never exposed as its own task.
pub struct ControlState {
    pub brew_setpoint_c: f32,
    pub steam_setpoint_c: f32,
    pub config: ConfigRecord,
    pub eco_enabled: bool,
    pub eco_brew_temp_c10: i16,
    pub eco_timeout_min: u8,
}

fn apply_command(
    state_machine: &mut StateMachine,
    brew_pid: &mut Pid,
    steam_pid: &mut Pid,
    control: &mut ControlState,
    diag_inputs: &DiagInputs,
    diag_outbox: &DiagOutbox,
    cmd: RtCommand,
) {
    match cmd {
        RtCommand::SetTemp { target, temperature_c10 } => {
            let setpoint_c = temperature_c10 as f32 / 10.0;
            if target == 0 {
                control.brew_setpoint_c = setpoint_c;
            } else {
                control.steam_setpoint_c = setpoint_c;
            }
        }
        RtCommand::SetPid { target, kp, ki, kd } => {
            let (kp, ki, kd) = (kp as f32 / 100.0, ki as f32 / 100.0, kd as f32 / 100.0);
            if target == 0 {
                brew_pid.set_gains(kp, ki, kd);
                control.config.brew_pid = crate::config_persistence::PidTune { kp, ki, kd };
            } else {
                steam_pid.set_gains(kp, ki, kd);
                control.config.steam_pid = crate::config_persistence::PidTune { kp, ki, kd };
            }
        }
        RtCommand::Brew { start } => {
            state_machine.handle(if start { StateEvent::BrewStart } else { StateEvent::BrewStopConditionMet });
            if start {
                control.config.cleaning.count = control.config.cleaning.count.saturating_add(1);
            }
        }
        RtCommand::Mode(mode) => {
            state_machine.handle(match mode {
                MachineMode::Idle => StateEvent::UserOff,
                MachineMode::Brew => StateEvent::BrewStart,
                MachineMode::Steam => StateEvent::SteamRequest,
            });
        }
        RtCommand::ConfigEnvironmental(cfg) => {
            let candidate = ElectricalConfig {
                nominal_voltage: cfg.nominal_voltage,
                max_current_draw_a: cfg.max_current_draw,
            };
            if candidate.validate().is_ok() {
                control.config.electrical = candidate;
            }
        }
        RtCommand::ConfigPreinfusion(cfg) => {
            let candidate = PreinfusionConfig {
                enabled: cfg.enabled != 0,
                on_time_ms: cfg.on_time_ms,
                pause_time_ms: cfg.pause_time_ms,
            };
            if candidate.validate().is_ok() {
                control.config.preinfusion = candidate;
            }
        }
        RtCommand::ConfigHeatingStrategy(strategy) => {
            control.config.heating_strategy = strategy;
        }
        RtCommand::GetConfig | RtCommand::GetEnvConfig => {
            // Read-only: Core B answers directly from `control.config`
            // (mirrored into `SharedStatus`/a config snapshot), nothing for
            // Core A to mutate.
        }
        RtCommand::CleaningStart => {
            state_machine.handle(StateEvent::CleaningStart);
        }
        RtCommand::CleaningStop => {
            state_machine.handle(StateEvent::CleaningStop);
        }
        RtCommand::CleaningReset => {
            control.config.cleaning.count = 0;
        }
        RtCommand::CleaningSetThreshold(threshold) => {
            if (MIN_CLEANING_THRESHOLD..=MAX_CLEANING_THRESHOLD).contains(&threshold) {
                control.config.cleaning.threshold = threshold;
            }
        }
        RtCommand::SetEco {
            enabled,
            brew_temp_c10,
            timeout_min,
        } => {
            control.eco_enabled = enabled;
            control.eco_brew_temp_c10 = brew_temp_c10;
            control.eco_timeout_min = timeout_min;
        }
        RtCommand::Diagnostics(test_id) => {
            diag_outbox.signal(diagnostics::run(test_id, diag_inputs));
        }
        RtCommand::EnterBootloader => {
            BOOTLOADER_REQUESTED.store(true, Ordering::Relaxed);
        }
    }

    // Reaching here means Core B decoded and forwarded a real command packet
    // — genuine user/host interaction, not the passage of time.
    state_machine.handle(StateEvent::UserActivity);
}

/// Core A's control loop: samples sensors, evaluates safety, steps the state
/// machine and PID loops, dispatches the heating strategy under the power
/// budget, and publishes a fresh [`SharedStatus`].
#[embassy_executor::task]
pub async fn control_task(
    status: &'static SharedStatusCell,
    commands: &'static CommandSignal,
    diag_outbox: &'static DiagOutbox,
    mut inputs: impl RawInputs + 'static,
    mut sensors: SensorSet,
    mut safety: SafetyGate,
    mut state_machine: StateMachine,
    mut brew_pid: Pid,
    mut steam_pid: Pid,
    mut alternator: Alternator,
    mut class_b: ClassB,
    mut stack_canary: StackCanary,
    power_budget: PowerBudget,
    mut control: ControlState,
) -> ! {
    let mut ticker = Ticker::every(Duration::from_hz(CONTROL_TICK_HZ as u64));
    let dt_s = 1.0 / CONTROL_TICK_HZ as f32;
    let core_b_timeout_ticks = (WATCHDOG_ALIVE_TIMEOUT_MS * CONTROL_TICK_HZ as u64 / 1000) as u32;
    let mut core_b_missed_ticks: u32 = 0;
    let mut uptime_ticks: u64 = 0;

    loop {
        ticker.next().await;
        CORE_A_ALIVE.store(true, Ordering::Relaxed);
        uptime_ticks += 1;

        for kind in [
            SensorKind::BrewTemp,
            SensorKind::SteamTemp,
            SensorKind::GroupTemp,
            SensorKind::Pressure,
            SensorKind::WaterLevel,
        ] {
            let raw = inputs.sample(kind);
            sensors.update(kind, raw);
        }

        let class_b_test = class_b.next_test();
        let class_b_passed = match class_b_test {
            ClassBTest::RamMarch => class_b::ram_march(inputs.class_b_scratch()),
            ClassBTest::CpuRegister => class_b::cpu_register_pattern(),
            ClassBTest::FlashCrc => class_b::flash_crc_check(inputs.code_region(), class_b::EXPECTED_CODE_CRC),
            ClassBTest::ClockCheck => {
                class_b::clock_sanity(inputs.measured_clock_hz(), inputs.nominal_clock_hz(), CLASS_B_CLOCK_TOLERANCE_PPM)
            }
            ClassBTest::StackCanary => stack_canary.check(inputs.stack_free_bytes()),
        };

        if CORE_B_ALIVE.swap(false, Ordering::Relaxed) {
            core_b_missed_ticks = 0;
        } else {
            core_b_missed_ticks += 1;
        }
        let heartbeat_lost = core_b_missed_ticks >= core_b_timeout_ticks;

        if let Some(cmd) = commands.try_take() {
            let diag_inputs = DiagInputs {
                brew_temp_raw: sensors.brew_temp.last_filtered as i16,
                brew_temp_valid: sensors.brew_temp.valid,
                steam_temp_raw: sensors.steam_temp.last_filtered as i16,
                steam_temp_valid: sensors.steam_temp.valid,
                pressure_raw: sensors.pressure.last_filtered as i16,
                pressure_valid: sensors.pressure.valid,
                outputs_continuity_ok: !sensors.any_faulted(),
                class_b_all_passed: class_b_passed,
            };
            apply_command(
                &mut state_machine,
                &mut brew_pid,
                &mut steam_pid,
                &mut control,
                &diag_inputs,
                diag_outbox,
                cmd,
            );
        }

        let safety_inputs = SafetyInputs {
            any_required_sensor_faulted: sensors.any_faulted(),
            any_boiler_over_hard_limit: sensors.brew_temp.last_filtered > HARD_TEMP_LIMIT_C10
                || sensors.steam_temp.last_filtered > HARD_TEMP_LIMIT_C10,
            dry_boiler_indicated: sensors.water_level.valid && sensors.water_level.last_filtered <= 0,
            leak_detected: inputs.leak_detected(),
            heartbeat_monitoring_enabled: true,
            heartbeat_lost,
            class_b_failed: !class_b_passed,
            environmental_config_present: inputs.environmental_config_present(),
        };
        let level = safety.evaluate(&safety_inputs);
        let critical = level == SafetyLevel::Critical;

        if critical {
            state_machine.handle(StateEvent::SafetyCritical);
        }

        let brew_pv = sensors.brew_temp.last_filtered as f32 / 10.0;
        let steam_pv = sensors.steam_temp.last_filtered as f32 / 10.0;
        let brew_out = if critical {
            0.0
        } else {
            brew_pid.update(control.brew_setpoint_c, brew_pv, dt_s)
        };
        let steam_out = if critical {
            0.0
        } else {
            steam_pid.update(control.steam_setpoint_c, steam_pv, dt_s)
        };

        let permission = dispatch_dual_boiler(
            control.config.heating_strategy,
            brew_out > 0.0,
            steam_out > 0.0,
            &power_budget,
            &mut alternator,
        );

        let brew_output = if critical {
            SafetyGate::safe_outputs().brew_pwm
        } else if permission.brew_allowed {
            brew_out as u8
        } else {
            0
        };
        let steam_output = if critical {
            SafetyGate::safe_outputs().steam_pwm
        } else if permission.steam_allowed {
            steam_out as u8
        } else {
            0
        };

        let snapshot = SharedStatus {
            state: state_machine.state() as u8,
            brew_temp_c10: sensors.brew_temp.last_filtered,
            steam_temp_c10: sensors.steam_temp.last_filtered,
            pressure: sensors.pressure.last_filtered,
            brew_output,
            steam_output,
            flags: if critical { brewos_shared::types::status_flags::ALARM } else { 0 },
            water_level: sensors.water_level.last_filtered,
            brew_setpoint_c10: (control.brew_setpoint_c * 10.0) as i16,
            steam_setpoint_c10: (control.steam_setpoint_c * 10.0) as i16,
            power_watts: power_budget.estimate_watts(brew_output, steam_output) as u16,
            uptime_ms: (uptime_ticks * 1000 / CONTROL_TICK_HZ as u64) as u32,
            brew_count: control.config.cleaning.count,
        };

        *status.lock().await = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_persistence::{CleaningConfig, PidTune};
    use brewos_shared::types::HeatingStrategy as Hs;

    fn test_control_state() -> ControlState {
        ControlState {
            brew_setpoint_c: 93.0,
            steam_setpoint_c: 145.0,
            config: ConfigRecord {
                electrical: ElectricalConfig {
                    nominal_voltage: 230,
                    max_current_draw_a: 13.0,
                },
                brew_pid: PidTune::default(),
                steam_pid: PidTune::default(),
                heating_strategy: Hs::BothOn,
                preinfusion: PreinfusionConfig {
                    enabled: false,
                    on_time_ms: 0,
                    pause_time_ms: 0,
                },
                cleaning: CleaningConfig { threshold: 200, count: 0 },
            },
            eco_enabled: false,
            eco_brew_temp_c10: 0,
            eco_timeout_min: 0,
        }
    }

    fn healthy_diag_inputs() -> DiagInputs {
        DiagInputs {
            brew_temp_raw: 930,
            brew_temp_valid: true,
            steam_temp_raw: 1450,
            steam_temp_valid: true,
            pressure_raw: 900,
            pressure_valid: true,
            outputs_continuity_ok: true,
            class_b_all_passed: true,
        }
    }

    #[test]
    fn apply_command_routes_brew_to_state_machine() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        sm.handle(StateEvent::ConfigPresentAndUserOn);
        sm.handle(StateEvent::AtSetpoint);
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::Brew { start: true },
        );
        assert_eq!(sm.state(), brewos_shared::types::MachineState::Brewing);
        assert_eq!(control.config.cleaning.count, 1);
    }

    #[test]
    fn apply_command_routes_set_pid_to_targeted_controller_only() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::SetPid { target: 1, kp: 2000, ki: 0, kd: 0 },
        );
        let brew_out = brew.update(100.0, 0.0, 0.1);
        let steam_out = steam.update(100.0, 0.0, 0.1);
        assert!(steam_out > brew_out);
        assert_eq!(control.config.steam_pid.kp, 20.0);
    }

    #[test]
    fn apply_command_set_temp_updates_the_matching_setpoint() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::SetTemp { target: 0, temperature_c10: 930 },
        );
        assert_eq!(control.brew_setpoint_c, 93.0);
        assert_eq!(control.steam_setpoint_c, 145.0);
    }

    #[test]
    fn apply_command_diagnostics_runs_the_catalogue_and_signals_results() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::Diagnostics(brewos_shared::types::DiagTestId::All),
        );
        let results = diag_outbox.try_take().expect("diagnostics command should signal a result");
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn apply_command_config_environmental_rejects_out_of_range_current() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        let original = control.config.electrical;
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::ConfigEnvironmental(brewos_shared::payload::ConfigEnvironmental {
                nominal_voltage: 230,
                max_current_draw: 999.0,
            }),
        );
        assert_eq!(control.config.electrical, original);
    }

    #[test]
    fn apply_command_cleaning_reset_zeroes_the_counter() {
        let mut sm = StateMachine::new();
        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        control.config.cleaning.count = 50;
        let diag_outbox = DiagOutbox::new();
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::CleaningReset,
        );
        assert_eq!(control.config.cleaning.count, 0);
    }

    #[test]
    fn apply_command_every_variant_counts_as_user_activity() {
        // A command arriving in `Eco` must kick the state machine back to
        // `Heating`, the same way any other user interaction would.
        let mut sm = StateMachine::new();
        sm.handle(StateEvent::ConfigPresentAndUserOn);
        sm.handle(StateEvent::AtSetpoint);
        sm.handle(StateEvent::IdleTimeout);
        assert_eq!(sm.state(), brewos_shared::types::MachineState::Eco);

        let mut brew = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut steam = Pid::new(1.0, 0.1, 0.0, 1.0);
        let mut control = test_control_state();
        let diag_outbox = DiagOutbox::new();
        apply_command(
            &mut sm,
            &mut brew,
            &mut steam,
            &mut control,
            &healthy_diag_inputs(),
            &diag_outbox,
            RtCommand::GetConfig,
        );
        assert_eq!(sm.state(), brewos_shared::types::MachineState::Heating);
    }
}
