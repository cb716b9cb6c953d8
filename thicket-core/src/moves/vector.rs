//! Single-element proposals on real-vector nodes.
//!
//! Each proposal picks one element uniformly at random and perturbs only
//! that element. Acceptance rates are tuned towards 0.23, the usual
//! target for updates in higher dimensions.

use tracing::trace;

use super::proposal::{check_target, check_tuning_parameter, reflect, tune_towards, Proposal};
use crate::error::MoveError;
use crate::graph::{DagNode, StochasticNode};
use crate::random::RandomNumberGenerator;
use crate::value::{Value, ValueType};

pub const VECTOR_TARGET_ACCEPTANCE: f64 = 0.23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kernel {
    Scale,
    Slide,
}

/// Scale or slide one element of a real vector.
pub struct VectorElementProposal {
    node: StochasticNode,
    kernel: Kernel,
    lambda: f64,
    stored: Option<Vec<f64>>,
}

impl VectorElementProposal {
    /// Multiply one element by `exp(λ(u - 0.5))`; `ln H` is the exponent.
    pub fn scale(node: StochasticNode, lambda: f64) -> Result<Self, MoveError> {
        Self::build(node, Kernel::Scale, lambda)
    }

    /// Shift one element by `λ(u - 0.5)`, mirrored at the support bounds.
    pub fn slide(node: StochasticNode, lambda: f64) -> Result<Self, MoveError> {
        Self::build(node, Kernel::Slide, lambda)
    }

    fn build(node: StochasticNode, kernel: Kernel, lambda: f64) -> Result<Self, MoveError> {
        let proposal = Self {
            node,
            kernel,
            lambda,
            stored: None,
        };
        check_target(proposal.name(), &proposal.node, ValueType::RealVector)?;
        check_tuning_parameter(proposal.name(), proposal.lambda)?;
        if proposal.node.current_value().to_reals().is_empty() {
            return Err(MoveError::EmptyTarget {
                name: proposal.name().to_string(),
                node: proposal.node.name().to_string(),
            });
        }
        Ok(proposal)
    }
}

impl Proposal for VectorElementProposal {
    fn name(&self) -> &str {
        match self.kernel {
            Kernel::Scale => "vector_single_element_scale",
            Kernel::Slide => "vector_single_element_slide",
        }
    }

    fn nodes(&self) -> Vec<DagNode> {
        vec![self.node.as_node().clone()]
    }

    fn prepare(&mut self) {
        self.stored = Some(self.node.current_value().to_reals());
    }

    fn do_proposal(&mut self, rng: &mut RandomNumberGenerator) -> f64 {
        let Some(mut values) = self.stored.clone() else {
            return f64::NEG_INFINITY;
        };
        if values.is_empty() {
            return f64::NEG_INFINITY;
        }
        let index = rng.uniform_index(values.len());
        let u = rng.uniform01();

        let ln_hastings = match self.kernel {
            Kernel::Scale => {
                let ln_factor = self.lambda * (u - 0.5);
                values[index] *= ln_factor.exp();
                ln_factor
            }
            Kernel::Slide => {
                let (lower, upper) = self.node.bounds();
                values[index] = reflect(values[index] + self.lambda * (u - 0.5), lower, upper);
                0.0
            }
        };
        trace!(node = %self.node.name(), index, value = values[index], "element update");
        if self.node.set_value(Value::RealVector(values)).is_err() {
            return f64::NEG_INFINITY;
        }
        ln_hastings
    }

    fn undo_proposal(&mut self) -> Result<(), MoveError> {
        let Some(values) = self.stored.take() else {
            return Ok(());
        };
        self.node
            .set_value(Value::RealVector(values))
            .map_err(|source| MoveError::Undo {
                name: self.name().to_string(),
                source,
            })
    }

    fn clean_proposal(&mut self) {
        self.stored = None;
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda = tune_towards(self.lambda, acceptance_rate, VECTOR_TARGET_ACCEPTANCE);
    }

    fn tuning_parameter(&self) -> Option<f64> {
        Some(self.lambda)
    }
}
