//! Model Registry
//!
//! A [`Model`] owns the named nodes of one graph and is the construction
//! API: nodes are created through it, parents are referred to by name, and
//! the joint density is summed over its stochastic nodes.
//!
//! # Ordering
//!
//! Nodes are kept in insertion order. Since parents must exist before their
//! children, insertion order is topological until a structural edit
//! (`swap_parent`) rewires the graph; [`Model::topological_order`] recomputes
//! a valid order with Kahn's algorithm whenever one is needed.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::deterministic::DeterministicNode;
use super::node::{DagNode, NodeBody, NodeId, NodeKind};
use super::stochastic::StochasticNode;
use crate::distribution::Distribution;
use crate::error::{Result, StructuralError};
use crate::function::Function;
use crate::random::RandomNumberGenerator;
use crate::value::Value;

/// The named nodes of one graph.
pub struct Model {
    name: String,
    nodes: IndexMap<String, DagNode>,
}

impl Model {
    /// Create an empty model.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a constant node.
    pub fn constant(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<DagNode, StructuralError> {
        self.check_free(name)?;
        let value = value.into();
        let node = DagNode::new(name, value.value_type(), NodeBody::Constant(value), &[]);
        Ok(self.register(node))
    }

    /// Replace the value of a constant node. Descendants are touched and the
    /// change committed at once; this is an edit, not a proposal.
    pub fn set_constant(&self, name: &str, value: impl Into<Value>) -> Result<(), StructuralError> {
        let node = self.get(name)?;
        let value = value.into();
        if !node.value_type().accepts(value.value_type()) {
            return Err(StructuralError::TypeMismatch {
                node: name.to_string(),
                expected: node.value_type(),
                found: value.value_type(),
            });
        }
        match &mut node.inner.state.write().body {
            NodeBody::Constant(v) => *v = value,
            body => {
                return Err(StructuralError::WrongKind {
                    node: name.to_string(),
                    kind: match body {
                        NodeBody::Stochastic(_) => NodeKind::Stochastic.label(),
                        _ => NodeKind::Deterministic.label(),
                    },
                    required: NodeKind::Constant.label(),
                })
            }
        }
        node.commit_edit();
        Ok(())
    }

    /// Add a stochastic node whose initial value is drawn from
    /// `distribution` at the current parent values.
    pub fn stochastic(
        &mut self,
        name: &str,
        distribution: impl Distribution + 'static,
        parents: &[&str],
        rng: &mut RandomNumberGenerator,
    ) -> Result<StochasticNode> {
        self.check_free(name)?;
        let parents = self.resolve(parents)?;
        let node = StochasticNode::sample(name, Box::new(distribution), &parents, rng)?;
        self.register(node.as_node().clone());
        Ok(node)
    }

    /// Add a stochastic node clamped to observed `data`.
    pub fn observed(
        &mut self,
        name: &str,
        distribution: impl Distribution + 'static,
        parents: &[&str],
        data: impl Into<Value>,
    ) -> Result<StochasticNode, StructuralError> {
        self.check_free(name)?;
        let parents = self.resolve(parents)?;
        let node = StochasticNode::observed(name, Box::new(distribution), &parents, data.into())?;
        self.register(node.as_node().clone());
        Ok(node)
    }

    /// Add a deterministic node computing `function(parents)`.
    pub fn deterministic(
        &mut self,
        name: &str,
        function: impl Function + 'static,
        parents: &[&str],
    ) -> Result<DeterministicNode, StructuralError> {
        self.check_free(name)?;
        let parents = self.resolve(parents)?;
        let node = DeterministicNode::new(name, Box::new(function), &parents)?;
        self.register(node.as_node().clone());
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    /// Look up a node, failing with [`StructuralError::UnknownNode`].
    pub fn get(&self, name: &str) -> Result<&DagNode, StructuralError> {
        self.nodes
            .get(name)
            .ok_or_else(|| StructuralError::UnknownNode(name.to_string()))
    }

    pub fn stochastic_node(&self, name: &str) -> Result<StochasticNode, StructuralError> {
        StochasticNode::try_from(self.get(name)?.clone())
    }

    pub fn deterministic_node(&self, name: &str) -> Result<DeterministicNode, StructuralError> {
        DeterministicNode::try_from(self.get(name)?.clone())
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    pub fn stochastic_nodes(&self) -> Vec<StochasticNode> {
        self.nodes
            .values()
            .filter_map(|n| StochasticNode::try_from(n.clone()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of the densities of the clamped stochastic nodes.
    pub fn ln_likelihood(&self) -> f64 {
        self.nodes
            .values()
            .filter(|n| n.is_clamped())
            .map(DagNode::ln_probability)
            .sum()
    }

    /// Sum of the densities of the free stochastic nodes.
    pub fn ln_prior(&self) -> f64 {
        self.nodes
            .values()
            .filter(|n| n.kind() == NodeKind::Stochastic && !n.is_clamped())
            .map(DagNode::ln_probability)
            .sum()
    }

    pub fn ln_posterior(&self) -> f64 {
        self.ln_likelihood() + self.ln_prior()
    }

    /// Rewire `child` so every edge from `old` comes from `new` instead.
    pub fn swap_parent(&self, child: &str, old: &str, new: &str) -> Result<(), StructuralError> {
        let (child, old, new) = (self.get(child)?, self.get(old)?, self.get(new)?);
        child.swap_parent(old, new)?;
        debug!(model = %self.name, child = %child.name(), "parent swapped");
        Ok(())
    }

    /// Remove a node nothing depends on any more.
    pub fn remove_node(&mut self, name: &str) -> Result<DagNode, StructuralError> {
        let node = self.get(name)?;
        if let Some(child) = node.children().first() {
            return Err(StructuralError::InvalidRemoval {
                node: name.to_string(),
                child: child.name().to_string(),
            });
        }
        let node = self
            .nodes
            .shift_remove(name)
            .ok_or_else(|| StructuralError::UnknownNode(name.to_string()))?;
        node.detach();
        trace!(model = %self.name, node = %name, "removed");
        Ok(node)
    }

    /// Every node, parents before children.
    ///
    /// Kahn's algorithm over the registry; ties keep insertion order.
    pub fn topological_order(&self) -> Vec<DagNode> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        for node in self.nodes.values() {
            let degree = node
                .parents()
                .iter()
                .filter(|p| self.contains(p))
                .count();
            in_degree.insert(node.id(), degree);
            if degree == 0 {
                queue.push_back(node.clone());
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            for child in node.children() {
                if let Some(degree) = in_degree.get_mut(&child.id()) {
                    // one decrement per edge, a parent may fill several slots
                    let edges = child.parents().iter().filter(|p| p.is_same(&node)).count();
                    *degree = degree.saturating_sub(edges);
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
            order.push(node);
        }
        order
    }

    /// Redraw every free stochastic node from its prior, parents first, then
    /// settle the graph.
    pub fn redraw_all(&self, rng: &mut RandomNumberGenerator) -> Result<()> {
        for node in self.topological_order() {
            if node.kind() == NodeKind::Stochastic && !node.is_clamped() {
                StochasticNode::try_from(node)?.redraw(rng)?;
            }
        }
        self.settle();
        Ok(())
    }

    /// Bring every density up to date and close any open transaction.
    pub fn settle(&self) {
        for node in self.nodes.values() {
            node.ln_probability();
        }
        for node in self.nodes.values() {
            node.commit();
        }
    }

    fn contains(&self, node: &DagNode) -> bool {
        self.nodes
            .get(node.name())
            .is_some_and(|registered| registered.is_same(node))
    }

    fn check_free(&self, name: &str) -> Result<(), StructuralError> {
        if self.nodes.contains_key(name) {
            return Err(StructuralError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn resolve(&self, names: &[&str]) -> Result<Vec<DagNode>, StructuralError> {
        names.iter().map(|n| self.get(n).cloned()).collect()
    }

    fn register(&mut self, node: DagNode) -> DagNode {
        trace!(model = %self.name, node = %node.name(), kind = node.kind().label(), "registered");
        self.nodes.insert(node.name().to_string(), node.clone());
        node
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}
