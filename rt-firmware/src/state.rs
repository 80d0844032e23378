//! Machine state machine (spec §4.2 "State machine") and the brew cycle,
//! including optional pre-infusion (on-time / soak / main-pull).

pub use brewos_shared::types::MachineState;

/// Pre-infusion bounds enforced on the write path (spec §4.2
/// "Pre-infusion bounds").
pub const MAX_ON_TIME_MS: u16 = 10_000;
pub const MAX_PAUSE_TIME_MS: u16 = 30_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PreinfusionConfig {
    pub enabled: bool,
    pub on_time_ms: u16,
    pub pause_time_ms: u16,
}

impl PreinfusionConfig {
    /// Validate against the write-path bounds; rejects out-of-range values
    /// rather than silently clamping them.
    pub fn validate(&self) -> Result<(), PreinfusionConfigError> {
        if self.on_time_ms > MAX_ON_TIME_MS {
            return Err(PreinfusionConfigError::OnTimeTooLong);
        }
        if self.pause_time_ms > MAX_PAUSE_TIME_MS {
            return Err(PreinfusionConfigError::PauseTimeTooLong);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PreinfusionConfigError {
    OnTimeTooLong,
    PauseTimeTooLong,
}

/// Events that drive [`StateMachine::handle`]; named for the table in spec §4.2.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StateEvent {
    SafetyCritical,
    SafetyClear,
    FaultAcknowledged,
    ConfigPresentAndUserOn,
    UserOff,
    AtSetpoint,
    BrewStart,
    SteamRequest,
    IdleTimeout,
    BrewStopConditionMet,
    SteamOff,
    UserActivity,
    CleaningStart,
    CleaningStop,
    CleaningCountComplete,
}

/// The machine state machine. Pure transition logic; owns no timers or I/O.
pub struct StateMachine {
    state: MachineState,
    fault_cleared_pending_ack: bool,
}

impl StateMachine {
    pub const fn new() -> Self {
        Self {
            state: MachineState::Idle,
            fault_cleared_pending_ack: false,
        }
    }

    pub const fn state(&self) -> MachineState {
        self.state
    }

    /// Apply one event, returning the new state. Safety events take
    /// precedence over every other transition (entry to FAULT is possible
    /// from any state; exit requires both conditions clear and an ack,
    /// modelled here as two distinct events the caller only emits in order).
    pub fn handle(&mut self, event: StateEvent) -> MachineState {
        if let StateEvent::SafetyCritical = event {
            self.state = MachineState::Fault;
            self.fault_cleared_pending_ack = false;
            return self.state;
        }

        if self.state == MachineState::Fault {
            match event {
                StateEvent::SafetyClear => self.fault_cleared_pending_ack = true,
                StateEvent::FaultAcknowledged if self.fault_cleared_pending_ack => {
                    self.state = MachineState::Idle;
                    self.fault_cleared_pending_ack = false;
                }
                _ => {}
            }
            return self.state;
        }

        self.state = match (self.state, event) {
            (MachineState::Idle, StateEvent::ConfigPresentAndUserOn) => MachineState::Heating,
            (MachineState::Heating, StateEvent::AtSetpoint) => MachineState::Ready,
            (MachineState::Heating, StateEvent::UserOff) => MachineState::Idle,
            (MachineState::Ready, StateEvent::BrewStart) => MachineState::Brewing,
            (MachineState::Ready, StateEvent::SteamRequest) => MachineState::Steam,
            (MachineState::Ready, StateEvent::IdleTimeout) => MachineState::Eco,
            (MachineState::Ready, StateEvent::UserOff) => MachineState::Idle,
            (MachineState::Ready, StateEvent::CleaningStart) => MachineState::Cleaning,
            (MachineState::Brewing, StateEvent::BrewStopConditionMet) => MachineState::Ready,
            (MachineState::Steam, StateEvent::SteamOff) => MachineState::Ready,
            (MachineState::Eco, StateEvent::UserActivity) => MachineState::Heating,
            (MachineState::Cleaning, StateEvent::CleaningStop) => MachineState::Ready,
            (MachineState::Cleaning, StateEvent::CleaningCountComplete) => MachineState::Ready,
            (other, _) => other,
        };
        self.state
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Brew sub-phase, present only while [`MachineState::Brewing`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BrewPhase {
    PreInfusionOn,
    PreInfusionSoak,
    MainPull,
}

/// Drives the optional pre-infusion sequence: pump on for `on_time_ms`, pump
/// off for `pause_time_ms`, then the main pull with full pump and PID-driven
/// heaters until a stop condition (spec §4.2 "Brew cycle").
pub struct BrewCycle {
    config: PreinfusionConfig,
    phase: BrewPhase,
    phase_start_ms: u64,
    pub start_timestamp_ms: u64,
    pub stop_timestamp_ms: Option<u64>,
}

impl BrewCycle {
    pub fn start(config: PreinfusionConfig, now_ms: u64) -> Self {
        Self {
            config,
            phase: if config.enabled {
                BrewPhase::PreInfusionOn
            } else {
                BrewPhase::MainPull
            },
            phase_start_ms: now_ms,
            start_timestamp_ms: now_ms,
            stop_timestamp_ms: None,
        }
    }

    pub const fn phase(&self) -> BrewPhase {
        self.phase
    }

    /// `true` while the pump should run at full.
    pub fn pump_on(&self) -> bool {
        !matches!(self.phase, BrewPhase::PreInfusionSoak)
    }

    /// `true` only during the main pull, when heaters are PID-driven under
    /// brew load; during pre-infusion the heaters still track setpoint but
    /// the caller is expected to keep PID running throughout regardless.
    pub fn in_main_pull(&self) -> bool {
        matches!(self.phase, BrewPhase::MainPull)
    }

    /// Advance the phase clock; call once per control tick.
    pub fn tick(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.phase_start_ms);
        match self.phase {
            BrewPhase::PreInfusionOn if elapsed >= self.config.on_time_ms as u64 => {
                self.phase = BrewPhase::PreInfusionSoak;
                self.phase_start_ms = now_ms;
            }
            BrewPhase::PreInfusionSoak if elapsed >= self.config.pause_time_ms as u64 => {
                self.phase = BrewPhase::MainPull;
                self.phase_start_ms = now_ms;
            }
            _ => {}
        }
    }

    pub fn stop(&mut self, now_ms: u64) {
        self.stop_timestamp_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_to_heating_to_ready_to_brewing() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.handle(StateEvent::ConfigPresentAndUserOn), MachineState::Heating);
        assert_eq!(sm.handle(StateEvent::AtSetpoint), MachineState::Ready);
        assert_eq!(sm.handle(StateEvent::BrewStart), MachineState::Brewing);
        assert_eq!(sm.handle(StateEvent::BrewStopConditionMet), MachineState::Ready);
    }

    #[test]
    fn any_state_escalates_to_fault_on_safety_critical() {
        let mut sm = StateMachine::new();
        sm.handle(StateEvent::ConfigPresentAndUserOn);
        sm.handle(StateEvent::AtSetpoint);
        sm.handle(StateEvent::BrewStart);
        assert_eq!(sm.handle(StateEvent::SafetyCritical), MachineState::Fault);
    }

    #[test]
    fn fault_exit_requires_clear_then_ack() {
        let mut sm = StateMachine::new();
        sm.handle(StateEvent::SafetyCritical);
        assert_eq!(sm.handle(StateEvent::FaultAcknowledged), MachineState::Fault);
        sm.handle(StateEvent::SafetyClear);
        assert_eq!(sm.handle(StateEvent::FaultAcknowledged), MachineState::Idle);
    }

    #[test]
    fn ready_idle_timeout_enters_eco_and_activity_returns_to_heating() {
        let mut sm = StateMachine::new();
        sm.handle(StateEvent::ConfigPresentAndUserOn);
        sm.handle(StateEvent::AtSetpoint);
        assert_eq!(sm.handle(StateEvent::IdleTimeout), MachineState::Eco);
        assert_eq!(sm.handle(StateEvent::UserActivity), MachineState::Heating);
    }

    #[test]
    fn preinfusion_bounds_reject_over_limit() {
        let cfg = PreinfusionConfig {
            enabled: true,
            on_time_ms: 10_001,
            pause_time_ms: 1000,
        };
        assert_eq!(cfg.validate(), Err(PreinfusionConfigError::OnTimeTooLong));

        let cfg_ok = PreinfusionConfig {
            enabled: true,
            on_time_ms: 10_000,
            pause_time_ms: 30_000,
        };
        assert!(cfg_ok.validate().is_ok());
    }

    #[test]
    fn brew_cycle_walks_preinfusion_phases_then_main_pull() {
        let cfg = PreinfusionConfig {
            enabled: true,
            on_time_ms: 500,
            pause_time_ms: 300,
        };
        let mut cycle = BrewCycle::start(cfg, 0);
        assert_eq!(cycle.phase(), BrewPhase::PreInfusionOn);
        assert!(cycle.pump_on());

        cycle.tick(500);
        assert_eq!(cycle.phase(), BrewPhase::PreInfusionSoak);
        assert!(!cycle.pump_on());

        cycle.tick(800);
        assert_eq!(cycle.phase(), BrewPhase::MainPull);
        assert!(cycle.pump_on());
        assert!(cycle.in_main_pull());
    }

    #[test]
    fn disabled_preinfusion_goes_straight_to_main_pull() {
        let cfg = PreinfusionConfig {
            enabled: false,
            on_time_ms: 0,
            pause_time_ms: 0,
        };
        let cycle = BrewCycle::start(cfg, 1000);
        assert_eq!(cycle.phase(), BrewPhase::MainPull);
        assert_eq!(cycle.start_timestamp_ms, 1000);
    }
}
