//! Self-test catalogue driven by `CMD_DIAGNOSTICS` (spec SPEC_FULL §3/§4.2
//! "Diagnostics module", supplemented from `diagnostics.h` in the original).
//! `DiagTestId::All` runs the whole table and streams one header followed by
//! one result per test, mirroring `protocol_send_diag_header`/
//! `protocol_send_diag_result`.

pub use brewos_shared::types::{DiagStatus, DiagTestId};

/// Host-side result of one self-test; encodes 1:1 onto
/// [`brewos_shared::payload::DiagResultPayload`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DiagResult {
    pub test_id: DiagTestId,
    pub status: DiagStatus,
    pub raw_value: i16,
    pub expected_min: i16,
    pub expected_max: i16,
}

/// Everything a test needs to judge pass/fail/warn, gathered by the caller
/// from the live subsystems. Kept as plain data so the catalogue itself has
/// no dependency on `sensors`/`class_b` internals.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiagInputs {
    pub brew_temp_raw: i16,
    pub brew_temp_valid: bool,
    pub steam_temp_raw: i16,
    pub steam_temp_valid: bool,
    pub pressure_raw: i16,
    pub pressure_valid: bool,
    pub outputs_continuity_ok: bool,
    pub class_b_all_passed: bool,
}

const TEMP_EXPECTED_MIN: i16 = 0;
const TEMP_EXPECTED_MAX: i16 = 1600;
const PRESSURE_EXPECTED_MIN: i16 = 0;
const PRESSURE_EXPECTED_MAX: i16 = 1200;

fn run_sensors(inputs: &DiagInputs) -> DiagResult {
    let in_range = |v: i16| (TEMP_EXPECTED_MIN..=TEMP_EXPECTED_MAX).contains(&v);
    let brew_ok = inputs.brew_temp_valid && in_range(inputs.brew_temp_raw);
    let pressure_ok = inputs.pressure_valid
        && (PRESSURE_EXPECTED_MIN..=PRESSURE_EXPECTED_MAX).contains(&inputs.pressure_raw);
    let status = if brew_ok && pressure_ok {
        DiagStatus::Pass
    } else if inputs.brew_temp_valid || inputs.pressure_valid {
        DiagStatus::Warn
    } else {
        DiagStatus::Fail
    };
    DiagResult {
        test_id: DiagTestId::Sensors,
        status,
        raw_value: inputs.brew_temp_raw,
        expected_min: TEMP_EXPECTED_MIN,
        expected_max: TEMP_EXPECTED_MAX,
    }
}

fn run_outputs(inputs: &DiagInputs) -> DiagResult {
    DiagResult {
        test_id: DiagTestId::Outputs,
        status: if inputs.outputs_continuity_ok {
            DiagStatus::Pass
        } else {
            DiagStatus::Fail
        },
        raw_value: inputs.outputs_continuity_ok as i16,
        expected_min: 1,
        expected_max: 1,
    }
}

fn run_class_b(inputs: &DiagInputs) -> DiagResult {
    DiagResult {
        test_id: DiagTestId::ClassB,
        status: if inputs.class_b_all_passed {
            DiagStatus::Pass
        } else {
            DiagStatus::Fail
        },
        raw_value: inputs.class_b_all_passed as i16,
        expected_min: 1,
        expected_max: 1,
    }
}

/// Run one test by id, or the whole catalogue for [`DiagTestId::All`].
pub fn run(test_id: DiagTestId, inputs: &DiagInputs) -> heapless::Vec<DiagResult, 4> {
    let mut out = heapless::Vec::new();
    match test_id {
        DiagTestId::Sensors => {
            let _ = out.push(run_sensors(inputs));
        }
        DiagTestId::Outputs => {
            let _ = out.push(run_outputs(inputs));
        }
        DiagTestId::ClassB => {
            let _ = out.push(run_class_b(inputs));
        }
        DiagTestId::All => {
            let _ = out.push(run_sensors(inputs));
            let _ = out.push(run_outputs(inputs));
            let _ = out.push(run_class_b(inputs));
        }
    }
    out
}

/// Header fields summarising a completed (or streaming) catalogue run,
/// mirroring [`brewos_shared::payload::DiagHeaderPayload`].
pub fn summarize(results: &[DiagResult]) -> (u8, u8, u8, u8) {
    let mut pass = 0u8;
    let mut fail = 0u8;
    let mut warn = 0u8;
    for r in results {
        match r.status {
            DiagStatus::Pass => pass += 1,
            DiagStatus::Fail => fail += 1,
            DiagStatus::Warn => warn += 1,
            DiagStatus::Skip => {}
        }
    }
    let skip = results.len() as u8 - pass - fail - warn;
    (pass, fail, warn, skip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_inputs() -> DiagInputs {
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
    fn all_tests_pass_on_healthy_machine() {
        let results = run(DiagTestId::All, &healthy_inputs());
        assert_eq!(results.len(), 3);
        let (pass, fail, warn, skip) = summarize(&results);
        assert_eq!((pass, fail, warn, skip), (3, 0, 0, 0));
    }

    #[test]
    fn single_test_by_id_runs_only_that_test() {
        let results = run(DiagTestId::Outputs, &healthy_inputs());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_id, DiagTestId::Outputs);
    }

    #[test]
    fn failed_sensor_reading_fails_that_test() {
        let mut inputs = healthy_inputs();
        inputs.brew_temp_valid = false;
        inputs.pressure_valid = false;
        let results = run(DiagTestId::Sensors, &inputs);
        assert_eq!(results[0].status, DiagStatus::Fail);
    }

    #[test]
    fn class_b_failure_surfaces_as_fail() {
        let mut inputs = healthy_inputs();
        inputs.class_b_all_passed = false;
        let results = run(DiagTestId::ClassB, &inputs);
        assert_eq!(results[0].status, DiagStatus::Fail);
    }
}
