//! Multiplicative scaling proposal on a real-valued node.

use tracing::trace;

use super::proposal::{check_target, check_tuning_parameter, tune_towards, Proposal};
use crate::error::MoveError;
use crate::graph::{DagNode, StochasticNode};
use crate::random::RandomNumberGenerator;
use crate::value::{Value, ValueType};

/// Acceptance rate the scale is tuned towards.
pub const SCALE_TARGET_ACCEPTANCE: f64 = 0.44;

/// Multiply the value by `s = exp(λ(u - 0.5))`, `u ~ U(0, 1)`.
///
/// The Hastings ratio of the scale move is `s` itself. Positive values stay
/// positive, which makes this the usual move for rates and variances.
pub struct ScaleProposal {
    node: StochasticNode,
    lambda: f64,
    stored: Option<f64>,
}

impl ScaleProposal {
    pub fn new(node: StochasticNode, lambda: f64) -> Result<Self, MoveError> {
        check_target("scale", &node, ValueType::Real)?;
        check_tuning_parameter("scale", lambda)?;
        Ok(Self {
            node,
            lambda,
            stored: None,
        })
    }
}

impl Proposal for ScaleProposal {
    fn name(&self) -> &str {
        "scale"
    }

    fn nodes(&self) -> Vec<DagNode> {
        vec![self.node.as_node().clone()]
    }

    fn prepare(&mut self) {
        self.stored = self.node.current_value().as_real("scale").ok();
    }

    fn do_proposal(&mut self, rng: &mut RandomNumberGenerator) -> f64 {
        let Some(x) = self.stored else {
            return f64::NEG_INFINITY;
        };
        let ln_factor = self.lambda * (rng.uniform01() - 0.5);
        let proposed = x * ln_factor.exp();
        trace!(node = %self.node.name(), from = x, to = proposed, "scale");
        if self.node.set_value(Value::Real(proposed)).is_err() {
            return f64::NEG_INFINITY;
        }
        ln_factor
    }

    fn undo_proposal(&mut self) -> Result<(), MoveError> {
        let Some(x) = self.stored.take() else {
            return Ok(());
        };
        self.node
            .set_value(Value::Real(x))
            .map_err(|source| MoveError::Undo {
                name: self.name().to_string(),
                source,
            })
    }

    fn clean_proposal(&mut self) {
        self.stored = None;
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda = tune_towards(self.lambda, acceptance_rate, SCALE_TARGET_ACCEPTANCE);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Exponential, Iid};
    use crate::graph::Model;

    #[test]
    fn hastings_ratio_is_the_log_scale_factor() {
        let mut rng = RandomNumberGenerator::new(11);
        let mut model = Model::new("m");
        model.constant("rate", 1.0).unwrap();
        let x = model
            .stochastic("x", Exponential, &["rate"], &mut rng)
            .unwrap();
        let before = x.current_value().as_real("t").unwrap();

        let mut scale = ScaleProposal::new(x.clone(), 2.0).unwrap();
        scale.prepare();
        let ln_h = scale.do_proposal(&mut rng);
        let after = x.current_value().as_real("t").unwrap();
        assert!((after / before - ln_h.exp()).abs() < 1e-12);
        assert!(ln_h.abs() <= 1.0);
    }

    #[test]
    fn refuses_vector_targets() {
        let mut rng = RandomNumberGenerator::new(11);
        let mut model = Model::new("m");
        model.constant("rate", 1.0).unwrap();
        let v = model
            .stochastic("v", Iid::new(Exponential, 3), &["rate"], &mut rng)
            .unwrap();
        assert!(matches!(
            ScaleProposal::new(v, 1.0),
            Err(MoveError::TargetType { .. })
        ));
    }
}
