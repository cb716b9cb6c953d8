//! The proposal kernel seam.
//!
//! A [`Proposal`] only knows how to perturb its targets and how to take the
//! perturbation back. Bookkeeping, the acceptance test and the graph
//! transaction live in [`super::MetropolisHastingsMove`].

use crate::error::MoveError;
use crate::graph::{DagNode, StochasticNode};
use crate::random::RandomNumberGenerator;
use crate::value::ValueType;

/// Largest tuning parameter auto-tuning will reach.
pub const MAX_TUNING_PARAMETER: f64 = 10_000.0;

/// A transition kernel over one or more stochastic nodes.
pub trait Proposal: Send {
    fn name(&self) -> &str;

    /// The nodes whose values this kernel changes.
    fn nodes(&self) -> Vec<DagNode>;

    /// Remember whatever is needed to undo the next proposal.
    fn prepare(&mut self);

    /// Perturb the targets (touching them) and return the log Hastings
    /// ratio of the transition.
    fn do_proposal(&mut self, rng: &mut RandomNumberGenerator) -> f64;

    /// Put the values remembered by `prepare` back.
    fn undo_proposal(&mut self) -> Result<(), MoveError>;

    /// Forget the remembered state after an accepted proposal.
    fn clean_proposal(&mut self) {}

    /// Adjust the tuning parameter towards the target acceptance rate.
    fn tune(&mut self, _acceptance_rate: f64) {}

    fn tuning_parameter(&self) -> Option<f64> {
        None
    }
}

/// Widen the window when the chain accepts more often than `target`,
/// narrow it otherwise.
///
/// The update depends only on the observed rate, so tuning is reproducible.
pub fn tune_towards(parameter: f64, acceptance_rate: f64, target: f64) -> f64 {
    let tuned = if acceptance_rate > target {
        parameter * (1.0 + (acceptance_rate - target) / (1.0 - target))
    } else {
        parameter / (2.0 - acceptance_rate / target)
    };
    tuned.min(MAX_TUNING_PARAMETER)
}

/// Fold `x` back into `[lower, upper]` by mirroring at the bounds.
///
/// Mirroring is periodic with period `2 * (upper - lower)`, so the fold is
/// constant time however far `x` lies outside. Non-finite `x` is returned
/// unchanged and scores `-inf` downstream.
pub fn reflect(x: f64, lower: f64, upper: f64) -> f64 {
    if !(lower < upper) || !x.is_finite() || (lower..=upper).contains(&x) {
        return x;
    }
    if upper == f64::INFINITY {
        return lower + (lower - x);
    }
    if lower == f64::NEG_INFINITY {
        return upper - (x - upper);
    }
    let width = upper - lower;
    let period = 2.0 * width;
    if !period.is_finite() {
        return x.clamp(lower, upper);
    }
    let offset = (x - lower).rem_euclid(period);
    let folded = if offset > width {
        upper - (offset - width)
    } else {
        lower + offset
    };
    folded.clamp(lower, upper)
}

/// Window and scale sizes must be finite and positive.
pub(crate) fn check_tuning_parameter(proposal: &str, lambda: f64) -> Result<(), MoveError> {
    if lambda > 0.0 && lambda.is_finite() {
        Ok(())
    } else {
        Err(MoveError::InvalidTuningParameter {
            name: proposal.to_string(),
            value: lambda,
        })
    }
}

/// Reject clamped targets and targets of the wrong type.
pub(crate) fn check_target(
    proposal: &str,
    node: &StochasticNode,
    expected: ValueType,
) -> Result<(), MoveError> {
    if node.is_clamped() {
        return Err(MoveError::ClampedTarget {
            name: proposal.to_string(),
            node: node.name().to_string(),
        });
    }
    if node.value_type() != expected {
        return Err(MoveError::TargetType {
            name: proposal.to_string(),
            node: node.name().to_string(),
            expected,
            found: node.value_type(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_widens_when_accepting_too_often() {
        let tuned = tune_towards(1.0, 0.72, 0.44);
        assert!((tuned - 1.5).abs() < 1e-12);
    }

    #[test]
    fn tuning_narrows_when_rejecting_too_often() {
        let tuned = tune_towards(1.0, 0.22, 0.44);
        assert!((tuned - 1.0 / 1.5).abs() < 1e-12);
        assert!((tune_towards(1.0, 0.0, 0.44) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tuning_is_capped() {
        assert_eq!(tune_towards(9_000.0, 1.0, 0.44), MAX_TUNING_PARAMETER);
    }

    #[test]
    fn reflection_stays_in_bounds() {
        assert_eq!(reflect(-0.25, 0.0, f64::INFINITY), 0.25);
        assert_eq!(reflect(1.5, 0.0, 1.0), 0.5);
        assert!((reflect(-2.25, 0.0, 1.0) - 0.25).abs() < 1e-12);
        assert_eq!(reflect(3.0, f64::NEG_INFINITY, f64::INFINITY), 3.0);
        assert_eq!(reflect(2.5, f64::NEG_INFINITY, 2.0), 1.5);
    }

    #[test]
    fn reflection_is_periodic() {
        // 5.25 lies two full periods past 1.25, which mirrors to 0.75
        assert!((reflect(5.25, 0.0, 1.0) - 0.75).abs() < 1e-12);
        assert!((reflect(-4.25, 0.0, 1.0) - 0.25).abs() < 1e-12);
        let far = reflect(5_000.0, 0.0, 1e-6);
        assert!((0.0..=1e-6).contains(&far));
    }

    #[test]
    fn reflection_passes_non_finite_values_through() {
        assert_eq!(reflect(f64::INFINITY, 0.0, 1.0), f64::INFINITY);
        assert_eq!(reflect(f64::NEG_INFINITY, 0.0, 1.0), f64::NEG_INFINITY);
        assert!(reflect(f64::NAN, 0.0, 1.0).is_nan());
    }

    #[test]
    fn tuning_parameters_must_be_finite_and_positive() {
        assert!(check_tuning_parameter("slide", 0.5).is_ok());
        for bad in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            assert!(matches!(
                check_tuning_parameter("slide", bad),
                Err(MoveError::InvalidTuningParameter { .. })
            ));
        }
    }
}
