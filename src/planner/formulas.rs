//! Thread-count arithmetic.
//!
//! Every count is rounded up. A non-finite or negative intermediate result is
//! reported as [`FleetError::ComputationUndefined`] so the caller can skip the
//! tick instead of launching a nonsensical number of threads.

use crate::error::{FleetError, Result};
use crate::fleet::{JobKind, TargetModel, TargetState};

/// Value ratios within this of 1 count as full.
pub const RATIO_EPSILON: f64 = 0.00001;

/// Defense within this of the minimum counts as minimal.
pub const DEFENSE_EPSILON: f64 = 0.00001;

const MAX_SUPPRESS_REFINEMENT: u32 = 10_000;

fn ceil_threads(x: f64, what: &str) -> Result<u32> {
    if !x.is_finite() || x < 0.0 || x > u32::MAX as f64 {
        return Err(FleetError::ComputationUndefined(format!("{what} = {x}")));
    }
    Ok(x.ceil() as u32)
}

/// Scale a thread count by a safety margin, rounding up.
pub fn with_margin(threads: u32, margin: f64) -> Result<u32> {
    ceil_threads(threads as f64 * margin, "threads with margin")
}

/// Extract threads needed to take the value ratio from `from` down to `to`.
pub fn extract_threads(model: &dyn TargetModel, target: &str, from: f64, to: f64) -> Result<u32> {
    let fraction = model.extract_fraction(target);
    if fraction <= 0.0 {
        return Err(FleetError::ComputationUndefined(format!(
            "extract fraction for {target} is {fraction}"
        )));
    }
    ceil_threads((from - to).max(0.0) / fraction, "extract threads")
}

/// Replenish threads needed to raise the value ratio from `from` to `to`.
pub fn replenish_threads(
    model: &dyn TargetModel,
    target: &str,
    from: f64,
    to: f64,
    at_defense: Option<f64>,
) -> Result<u32> {
    if from >= to {
        return Ok(0);
    }
    ceil_threads(
        model.replenish_threads(target, from, to, at_defense),
        "replenish threads",
    )
}

/// Suppress threads needed to lower defense by `decrease`.
///
/// Starts from the linear estimate and then walks up until the model agrees
/// the effect is large enough.
pub fn suppress_threads(model: &dyn TargetModel, decrease: f64) -> Result<u32> {
    if decrease <= 0.0 {
        return Ok(0);
    }
    let per_thread = model.defense_effect(JobKind::Suppress, 1);
    if per_thread <= 0.0 {
        return Err(FleetError::ComputationUndefined(format!(
            "suppress effect per thread is {per_thread}"
        )));
    }
    let mut threads = ceil_threads(decrease / per_thread, "suppress threads")?;
    let limit = threads.saturating_add(MAX_SUPPRESS_REFINEMENT);
    while model.defense_effect(JobKind::Suppress, threads) < decrease {
        threads += 1;
        if threads > limit {
            return Err(FleetError::ComputationUndefined(format!(
                "suppress threads for {decrease} did not converge"
            )));
        }
    }
    Ok(threads)
}

pub fn suppress_to_minimum(model: &dyn TargetModel, state: &TargetState) -> Result<u32> {
    suppress_threads(model, state.defense_over_minimum())
}

/// Suppress threads countering the defense raised by `threads` threads of `kind`.
pub fn suppress_after(model: &dyn TargetModel, kind: JobKind, threads: u32) -> Result<u32> {
    suppress_threads(model, model.defense_effect(kind, threads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Millis;

    struct Linear {
        extract_fraction: f64,
    }

    impl TargetModel for Linear {
        fn state(&self, _target: &str) -> Option<TargetState> {
            None
        }

        fn duration(&self, _kind: JobKind, _target: &str) -> Millis {
            1000.0
        }

        fn extract_fraction(&self, _target: &str) -> f64 {
            self.extract_fraction
        }

        fn replenish_threads(&self, _target: &str, from: f64, to: f64, _at: Option<f64>) -> f64 {
            (to / from - 1.0) * 10.0
        }

        fn defense_effect(&self, kind: JobKind, threads: u32) -> f64 {
            let per = match kind {
                JobKind::Extract => 0.002,
                JobKind::Replenish => 0.004,
                JobKind::Suppress => 0.05,
            };
            per * threads as f64
        }
    }

    fn model() -> Linear {
        Linear {
            extract_fraction: 0.01,
        }
    }

    #[test]
    fn extract_rounds_up() {
        // 0.25 / 0.01 = 25 exactly, 0.255 / 0.01 = 25.5 -> 26
        assert_eq!(extract_threads(&model(), "t", 1.0, 0.75).unwrap(), 25);
        assert_eq!(extract_threads(&model(), "t", 1.0, 0.745).unwrap(), 26);
        assert_eq!(extract_threads(&model(), "t", 0.5, 0.75).unwrap(), 0);
    }

    #[test]
    fn extract_with_no_effect_is_undefined() {
        let model = Linear {
            extract_fraction: 0.0,
        };
        assert!(matches!(
            extract_threads(&model, "t", 1.0, 0.75),
            Err(FleetError::ComputationUndefined(_))
        ));
    }

    #[test]
    fn replenish_from_zero_is_undefined() {
        assert!(matches!(
            replenish_threads(&model(), "t", 0.0, 1.0, None),
            Err(FleetError::ComputationUndefined(_))
        ));
        assert_eq!(replenish_threads(&model(), "t", 1.0, 1.0, None).unwrap(), 0);
        assert_eq!(replenish_threads(&model(), "t", 0.5, 1.0, None).unwrap(), 10);
    }

    #[test]
    fn suppress_covers_the_decrease() {
        let m = model();
        assert_eq!(suppress_threads(&m, 0.0).unwrap(), 0);
        assert_eq!(suppress_threads(&m, 1.0).unwrap(), 20);
        assert_eq!(suppress_threads(&m, 1.01).unwrap(), 21);
        // 25 extract threads raise defense by 0.05 -> one suppress thread
        assert_eq!(suppress_after(&m, JobKind::Extract, 25).unwrap(), 1);
        assert_eq!(suppress_after(&m, JobKind::Replenish, 100).unwrap(), 8);
    }

    #[test]
    fn margin_rounds_up() {
        assert_eq!(with_margin(5, 2.0).unwrap(), 10);
        assert_eq!(with_margin(5, 1.1).unwrap(), 6);
    }
}
