//! Stochastic Nodes
//!
//! A stochastic node owns a value drawn from a distribution whose parameters
//! are the values of its parents, and contributes
//! `ln p(value | parent values)` to the joint density.
//!
//! The value belongs to the node: parents changing never alter it, they only
//! make the cached density stale. The value changes through
//! [`StochasticNode::set_value`] (moves), [`StochasticNode::redraw`]
//! (simulation) or [`StochasticNode::clamp`] (observed data). A clamped node
//! refuses the first two.

use std::ops::Deref;

use tracing::{debug, trace};

use super::node::{
    parent_values, sanitize_ln_density, DagNode, DirtyState, NodeBody, NodeKind, Snapshot,
};
use crate::distribution::Distribution;
use crate::error::{DistributionError, StructuralError};
use crate::random::RandomNumberGenerator;
use crate::value::Value;

pub(crate) struct StochasticState {
    pub(crate) distribution: Box<dyn Distribution>,
    pub(crate) value: Value,
    pub(crate) ln_prob: f64,
    pub(crate) clamped: bool,
    /// Value before the first change of the current transaction.
    pub(crate) stored_value: Option<Value>,
    /// Density before the node was touched in the current transaction.
    pub(crate) stored_ln_prob: Snapshot<f64>,
}

/// Typed handle to a stochastic node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StochasticNode {
    node: DagNode,
}

impl StochasticNode {
    /// Build a node and draw its initial value from `distribution`.
    pub(crate) fn sample(
        name: &str,
        distribution: Box<dyn Distribution>,
        parents: &[DagNode],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Self, crate::error::Error> {
        check_parents(name, distribution.as_ref(), parents)?;
        let parameters = parent_values(parents).map_err(|source| {
            DistributionError::InvalidParameters {
                distribution: distribution.name().to_string(),
                source,
            }
        })?;
        let value = draw(distribution.as_ref(), &parameters, rng)?;
        Ok(Self::build(name, distribution, parents, value, false))
    }

    /// Build a node clamped to observed `data`.
    pub(crate) fn observed(
        name: &str,
        distribution: Box<dyn Distribution>,
        parents: &[DagNode],
        data: Value,
    ) -> Result<Self, StructuralError> {
        check_parents(name, distribution.as_ref(), parents)?;
        check_value_type(name, distribution.as_ref(), &data)?;
        Ok(Self::build(name, distribution, parents, data, true))
    }

    fn build(
        name: &str,
        distribution: Box<dyn Distribution>,
        parents: &[DagNode],
        value: Value,
        clamped: bool,
    ) -> Self {
        let value_type = distribution.value_type();
        let body = NodeBody::Stochastic(StochasticState {
            distribution,
            value,
            ln_prob: f64::NEG_INFINITY,
            clamped,
            stored_value: None,
            stored_ln_prob: Snapshot::Empty,
        });
        Self {
            node: DagNode::new(name, value_type, body, parents),
        }
    }

    pub fn as_node(&self) -> &DagNode {
        &self.node
    }

    pub fn distribution_name(&self) -> String {
        self.with_state(|s| s.distribution.name().to_string())
    }

    /// Support bounds of the distribution at the current parent values.
    pub fn bounds(&self) -> (f64, f64) {
        let parents = self.node.parents();
        match parent_values(&parents) {
            Ok(parameters) => self.with_state(|s| s.distribution.bounds(&parameters)),
            Err(_) => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    /// Current value (never stale for stochastic nodes).
    pub fn current_value(&self) -> Value {
        self.with_state(|s| s.value.clone())
    }

    /// Set a new value and touch. The first change in a transaction stores
    /// the old value for [`DagNode::restore`].
    pub fn set_value(&self, value: Value) -> Result<(), StructuralError> {
        let name = self.node.name();
        self.with_state_mut(|s| {
            if s.clamped {
                return Err(StructuralError::Clamped(name.to_string()));
            }
            check_value_type(name, s.distribution.as_ref(), &value)?;
            let old = std::mem::replace(&mut s.value, value);
            if s.stored_value.is_none() {
                s.stored_value = Some(old);
            }
            Ok(())
        })?;
        self.node.touch();
        Ok(())
    }

    /// Draw a fresh value from the distribution and touch.
    ///
    /// Fails if the node is clamped, if the parameters are outside their
    /// domain, or if the drawn value has a non-finite density.
    pub fn redraw(&self, rng: &mut RandomNumberGenerator) -> Result<(), crate::error::Error> {
        if self.node.is_clamped() {
            return Err(StructuralError::Clamped(self.node.name().to_string()).into());
        }
        let parents = self.node.parents();
        let parameters = parent_values(&parents).map_err(|source| {
            DistributionError::InvalidParameters {
                distribution: self.distribution_name(),
                source,
            }
        })?;
        let value = self.with_state(|s| draw(s.distribution.as_ref(), &parameters, rng))?;
        trace!(node = %self.node.name(), %value, "redraw");
        self.set_value(value)?;
        Ok(())
    }

    /// Fix the node to observed data. Moves and redraws are refused until
    /// [`StochasticNode::unclamp`].
    pub fn clamp(&self, data: Value) -> Result<(), StructuralError> {
        let name = self.node.name();
        self.with_state_mut(|s| {
            check_value_type(name, s.distribution.as_ref(), &data)?;
            s.value = data;
            s.clamped = true;
            s.stored_value = None;
            Ok::<_, StructuralError>(())
        })?;
        debug!(node = %self.node.name(), "clamped");
        self.node.commit_edit();
        Ok(())
    }

    pub fn unclamp(&self) {
        self.with_state_mut(|s| s.clamped = false);
    }

    /// Current log-density minus the density stored at the start of the
    /// transaction. Zero when nothing was stored.
    pub fn ln_probability_ratio(&self) -> f64 {
        let current = self.node.ln_probability();
        let stored = self.with_state(|s| s.stored_ln_prob.peek().copied());
        match stored {
            Some(stored) => current - stored,
            None => 0.0,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&StochasticState) -> R) -> R {
        match &self.node.inner.state.read().body {
            NodeBody::Stochastic(s) => f(s),
            _ => unreachable!("StochasticNode always wraps a stochastic body"),
        }
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut StochasticState) -> R) -> R {
        match &mut self.node.inner.state.write().body {
            NodeBody::Stochastic(s) => f(s),
            _ => unreachable!("StochasticNode always wraps a stochastic body"),
        }
    }
}

impl Deref for StochasticNode {
    type Target = DagNode;

    fn deref(&self) -> &DagNode {
        &self.node
    }
}

impl TryFrom<DagNode> for StochasticNode {
    type Error = StructuralError;

    fn try_from(node: DagNode) -> Result<Self, Self::Error> {
        match node.kind() {
            NodeKind::Stochastic => Ok(Self { node }),
            kind => Err(StructuralError::WrongKind {
                node: node.name().to_string(),
                kind: kind.label(),
                required: NodeKind::Stochastic.label(),
            }),
        }
    }
}

/// Lazily computed density of a stochastic node.
pub(crate) fn ln_probability(node: &DagNode) -> f64 {
    {
        let state = node.inner.state.read();
        if let NodeBody::Stochastic(s) = &state.body {
            if state.dirty == DirtyState::Clean {
                return s.ln_prob;
            }
        }
    }

    let parents = node.parents();
    let parameters = parent_values(&parents);
    let parents_changed = parents.iter().any(DagNode::in_transaction);

    let mut guard = node.inner.state.write();
    let state = &mut *guard;
    let NodeBody::Stochastic(s) = &mut state.body else {
        return 0.0;
    };
    if parents_changed || s.stored_value.is_some() {
        // computed mid-transaction, not a valid pre-transaction density
        s.stored_ln_prob.mark_unavailable();
    }
    let ln_prob = match parameters.and_then(|p| s.distribution.ln_density(&p, &s.value)) {
        Ok(lp) => sanitize_ln_density(node.name(), lp),
        Err(err) => {
            trace!(node = %node.name(), %err, "density outside domain");
            f64::NEG_INFINITY
        }
    };
    s.ln_prob = ln_prob;
    state.dirty = DirtyState::Clean;
    ln_prob
}

fn draw(
    distribution: &dyn Distribution,
    parameters: &[Value],
    rng: &mut RandomNumberGenerator,
) -> Result<Value, DistributionError> {
    let invalid = |source| DistributionError::InvalidParameters {
        distribution: distribution.name().to_string(),
        source,
    };
    let value = distribution.sample(parameters, rng).map_err(invalid)?;
    let ln_density = distribution
        .ln_density(parameters, &value)
        .map_err(invalid)?;
    if !ln_density.is_finite() {
        return Err(DistributionError::NonFiniteDensity {
            distribution: distribution.name().to_string(),
            value,
            ln_density,
        });
    }
    Ok(value)
}

fn check_parents(
    name: &str,
    distribution: &dyn Distribution,
    parents: &[DagNode],
) -> Result<(), StructuralError> {
    let expected = distribution.parameter_types();
    if expected.len() != parents.len() {
        return Err(StructuralError::Arity {
            node: name.to_string(),
            expected: format!("exactly {}", expected.len()),
            found: parents.len(),
        });
    }
    for (slot, (ty, parent)) in expected.iter().zip(parents).enumerate() {
        if !ty.accepts(parent.value_type()) {
            return Err(StructuralError::TypeMismatch {
                node: format!("{name}[{slot}]"),
                expected: *ty,
                found: parent.value_type(),
            });
        }
    }
    Ok(())
}

fn check_value_type(
    name: &str,
    distribution: &dyn Distribution,
    value: &Value,
) -> Result<(), StructuralError> {
    let expected = distribution.value_type();
    if expected.accepts(value.value_type()) {
        Ok(())
    } else {
        Err(StructuralError::TypeMismatch {
            node: name.to_string(),
            expected,
            found: value.value_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Exponential, Normal};
    use crate::error::Error;
    use crate::value::ValueType;

    fn rate(x: f64) -> DagNode {
        DagNode::new("rate", ValueType::Real, NodeBody::Constant(Value::Real(x)), &[])
    }

    #[test]
    fn density_is_lazy_and_cached() {
        let mut rng = RandomNumberGenerator::new(1);
        let x = StochasticNode::sample("x", Box::new(Exponential), &[rate(2.0)], &mut rng).unwrap();
        assert!(x.is_touched());

        let v = x.current_value().as_real("t").unwrap();
        let lp = x.ln_probability();
        assert!((lp - (2.0f64.ln() - 2.0 * v)).abs() < 1e-12);
        assert!(!x.is_touched());
    }

    #[test]
    fn redraw_matches_the_generator_stream() {
        let mut rng = RandomNumberGenerator::new(42);
        let x = StochasticNode::sample("x", Box::new(Exponential), &[rate(1.0)], &mut rng).unwrap();
        x.redraw(&mut rng).unwrap();

        let mut reference = RandomNumberGenerator::new(42);
        reference.exp1();
        let expected = reference.exp1();
        assert_eq!(x.current_value(), Value::Real(expected));
    }

    #[test]
    fn redraw_with_invalid_parameters_is_reported() {
        let mut rng = RandomNumberGenerator::new(1);
        let r = rate(1.0);
        let x = StochasticNode::sample("x", Box::new(Exponential), &[r.clone()], &mut rng).unwrap();
        if let NodeBody::Constant(v) = &mut r.inner.state.write().body {
            *v = Value::Real(-1.0);
        }
        let err = x.redraw(&mut rng).unwrap_err();
        assert!(matches!(
            err,
            Error::Distribution(DistributionError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn clamped_nodes_refuse_changes() {
        let x = StochasticNode::observed("x", Box::new(Exponential), &[rate(1.0)], Value::Real(0.5))
            .unwrap();
        assert!(x.is_clamped());
        assert_eq!(
            x.set_value(Value::Real(1.0)),
            Err(StructuralError::Clamped("x".into()))
        );
        let mut rng = RandomNumberGenerator::new(1);
        assert!(x.redraw(&mut rng).is_err());
        assert_eq!(x.current_value(), Value::Real(0.5));

        x.unclamp();
        assert!(x.set_value(Value::Real(1.0)).is_ok());
    }

    #[test]
    fn restore_after_set_value() {
        let x = StochasticNode::observed("x", Box::new(Exponential), &[rate(1.0)], Value::Real(0.5))
            .unwrap();
        x.unclamp();
        let before = x.ln_probability();

        x.set_value(Value::Real(2.0)).unwrap();
        assert!((x.ln_probability_ratio() + 1.5).abs() < 1e-12);

        x.restore();
        assert_eq!(x.current_value(), Value::Real(0.5));
        assert!(!x.is_touched());
        assert_eq!(x.ln_probability(), before);
    }

    #[test]
    fn out_of_support_value_scores_negative_infinity() {
        let x = StochasticNode::observed("x", Box::new(Exponential), &[rate(1.0)], Value::Real(0.5))
            .unwrap();
        x.unclamp();
        x.set_value(Value::Real(-3.0)).unwrap();
        assert_eq!(x.ln_probability(), f64::NEG_INFINITY);
    }

    #[test]
    fn parents_are_type_checked() {
        let v = DagNode::new(
            "v",
            ValueType::RealVector,
            NodeBody::Constant(Value::RealVector(vec![1.0])),
            &[],
        );
        let err = StochasticNode::observed("x", Box::new(Exponential), &[v], Value::Real(0.5))
            .unwrap_err();
        assert!(matches!(err, StructuralError::TypeMismatch { .. }));

        let err = StochasticNode::observed("x", Box::new(Normal), &[rate(1.0)], Value::Real(0.5))
            .unwrap_err();
        assert!(matches!(err, StructuralError::Arity { found: 1, .. }));
    }
}
