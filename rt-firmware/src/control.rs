//! PID heating control and heating-strategy dispatch (spec §4.2 "PID",
//! "Heating strategy dispatch"). Position-form PID with derivative on the
//! process variable (not error) and a low-pass filter on the derivative
//! term; conditional-integration anti-windup on output saturation.

use brewos_shared::types::HeatingStrategy;

/// PID output is a 0-100 PWM duty cycle for the slow (seconds-period) SSRs.
pub const OUTPUT_MIN: f32 = 0.0;
pub const OUTPUT_MAX: f32 = 100.0;

/// Position-form PID with derivative-on-PV and a filtered derivative term.
#[derive(Clone, Copy, Debug)]
pub struct Pid {
    kp: f32,
    ki: f32,
    kd: f32,
    /// Derivative low-pass coefficient in `[0, 1]`; 1.0 disables filtering.
    derivative_alpha: f32,
    integral: f32,
    prev_pv: Option<f32>,
    filtered_derivative: f32,
}

impl Pid {
    pub const fn new(kp: f32, ki: f32, kd: f32, derivative_alpha: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            derivative_alpha,
            integral: 0.0,
            prev_pv: None,
            filtered_derivative: 0.0,
        }
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_pv = None;
        self.filtered_derivative = 0.0;
    }

    /// Advance one control tick. `dt_s` is the tick period in seconds.
    pub fn update(&mut self, setpoint: f32, pv: f32, dt_s: f32) -> f32 {
        let error = setpoint - pv;

        let raw_derivative = match self.prev_pv {
            Some(prev) => -(pv - prev) / dt_s,
            None => 0.0,
        };
        self.prev_pv = Some(pv);
        self.filtered_derivative += self.derivative_alpha * (raw_derivative - self.filtered_derivative);

        let p_term = self.kp * error;
        let d_term = self.kd * self.filtered_derivative;
        let tentative_integral = self.integral + self.ki * error * dt_s;

        let unclamped = p_term + tentative_integral + d_term;
        let clamped = unclamped.clamp(OUTPUT_MIN, OUTPUT_MAX);

        let saturated_high = unclamped > OUTPUT_MAX;
        let saturated_low = unclamped < OUTPUT_MIN;
        let would_unwind = (saturated_high && error < 0.0) || (saturated_low && error > 0.0);
        if !saturated_high && !saturated_low || would_unwind {
            self.integral = tentative_integral;
        }

        clamped
    }
}

/// Which of two dual-boiler SSRs may conduct on this control tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SsrPermission {
    pub brew_allowed: bool,
    pub steam_allowed: bool,
}

/// Alternates which boiler wins contested ticks, for [`HeatingStrategy::Alternating`].
#[derive(Default)]
pub struct Alternator {
    brew_served_last: bool,
}

impl Alternator {
    pub const fn new() -> Self {
        Self { brew_served_last: false }
    }
}

/// Per-boiler electrical draw, derived at boot from environmental config
/// (spec §4.2 "Power budget"): `current = rated_power / nominal_voltage`.
#[derive(Clone, Copy, Debug)]
pub struct PowerBudget {
    pub brew_current_a: f32,
    pub steam_current_a: f32,
    pub max_combined_a: f32,
    /// Rated wattage each boiler draws at full duty, kept alongside the
    /// derived currents so the control loop can report an instantaneous
    /// `power_watts` estimate without re-deriving from `nominal_voltage`.
    pub brew_rated_w: f32,
    pub steam_rated_w: f32,
}

impl PowerBudget {
    /// `max_combined = 0.95 * max_current_draw`.
    pub fn derive(nominal_voltage: f32, brew_watts: f32, steam_watts: f32, max_current_draw: f32) -> Self {
        Self {
            brew_current_a: brew_watts / nominal_voltage,
            steam_current_a: steam_watts / nominal_voltage,
            max_combined_a: 0.95 * max_current_draw,
            brew_rated_w: brew_watts,
            steam_rated_w: steam_watts,
        }
    }

    fn combined_fits(&self) -> bool {
        self.brew_current_a + self.steam_current_a <= self.max_combined_a
    }

    /// Instantaneous estimate from each boiler's reported PWM duty (0-100)
    /// against its rated wattage; not a substitute for a real power meter
    /// (see [`crate::power_meter`]) but always available.
    pub fn estimate_watts(&self, brew_duty_pct: u8, steam_duty_pct: u8) -> f32 {
        (brew_duty_pct as f32 / 100.0) * self.brew_rated_w + (steam_duty_pct as f32 / 100.0) * self.steam_rated_w
    }
}

/// Decide which dual-boiler SSRs may conduct simultaneously this tick,
/// honouring both the heating strategy and the hard power budget. The
/// budget is never exceeded regardless of strategy (spec: "the power
/// budget is a hard upper bound that the dispatch respects").
pub fn dispatch_dual_boiler(
    strategy: HeatingStrategy,
    brew_demand: bool,
    steam_demand: bool,
    budget: &PowerBudget,
    alternator: &mut Alternator,
) -> SsrPermission {
    if !(brew_demand && steam_demand) {
        // No contention: whichever boiler wants heat gets it (still subject
        // to its own draw alone never exceeding the combined budget, which
        // by construction it does not if the budget was sized correctly).
        return SsrPermission {
            brew_allowed: brew_demand,
            steam_allowed: steam_demand,
        };
    }

    if budget.combined_fits() {
        return SsrPermission {
            brew_allowed: true,
            steam_allowed: true,
        };
    }

    // Contested and over budget: the strategy picks a winner.
    match strategy {
        HeatingStrategy::BothOn | HeatingStrategy::BrewPriority => SsrPermission {
            brew_allowed: true,
            steam_allowed: false,
        },
        HeatingStrategy::SteamPriority => SsrPermission {
            brew_allowed: false,
            steam_allowed: true,
        },
        HeatingStrategy::Alternating => {
            let brew_wins = !alternator.brew_served_last;
            alternator.brew_served_last = brew_wins;
            SsrPermission {
                brew_allowed: brew_wins,
                steam_allowed: !brew_wins,
            }
        }
    }
}

/// For single-boiler and heat-exchanger machines the strategy selector is
/// inert (spec §4.2): the lone boiler simply gets whatever demand it has,
/// clamped to its own share of the budget.
pub fn dispatch_single_boiler(demand: bool) -> bool {
    demand
}
