//! Sliding-window proposal on a real-valued node.

use tracing::trace;

use super::proposal::{check_target, check_tuning_parameter, reflect, tune_towards, Proposal};
use crate::error::MoveError;
use crate::graph::{DagNode, StochasticNode};
use crate::random::RandomNumberGenerator;
use crate::value::{Value, ValueType};

/// Acceptance rate the window is tuned towards.
pub const SLIDE_TARGET_ACCEPTANCE: f64 = 0.44;

/// Move the value by `delta ~ U(-λ/2, λ/2)`, mirrored at the support bounds
/// of the node's distribution. The kernel is symmetric: `ln H = 0`.
pub struct SlideProposal {
    node: StochasticNode,
    lambda: f64,
    stored: Option<f64>,
}

impl SlideProposal {
    pub fn new(node: StochasticNode, lambda: f64) -> Result<Self, MoveError> {
        check_target("slide", &node, ValueType::Real)?;
        check_tuning_parameter("slide", lambda)?;
        Ok(Self {
            node,
            lambda,
            stored: None,
        })
    }
}

impl Proposal for SlideProposal {
    fn name(&self) -> &str {
        "slide"
    }

    fn nodes(&self) -> Vec<DagNode> {
        vec![self.node.as_node().clone()]
    }

    fn prepare(&mut self) {
        self.stored = self.node.current_value().as_real("slide").ok();
    }

    fn do_proposal(&mut self, rng: &mut RandomNumberGenerator) -> f64 {
        let Some(x) = self.stored else {
            return f64::NEG_INFINITY;
        };
        let (lower, upper) = self.node.bounds();
        let delta = self.lambda * (rng.uniform01() - 0.5);
        let proposed = reflect(x + delta, lower, upper);
        trace!(node = %self.node.name(), from = x, to = proposed, "slide");
        if self.node.set_value(Value::Real(proposed)).is_err() {
            return f64::NEG_INFINITY;
        }
        0.0
    }

    fn undo_proposal(&mut self) -> Result<(), MoveError> {
        match self.stored.take() {
            Some(x) => self
                .node
                .set_value(Value::Real(x))
                .map_err(|source| MoveError::Undo {
                    name: self.name().to_string(),
                    source,
                }),
            None => Ok(()),
        }
    }

    fn clean_proposal(&mut self) {
        self.stored = None;
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda = tune_towards(self.lambda, acceptance_rate, SLIDE_TARGET_ACCEPTANCE);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }
}
