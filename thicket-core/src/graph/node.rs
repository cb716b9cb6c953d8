//! Graph Nodes
//!
//! This module defines the node handle shared by every node kind, the edge
//! set, and the touch / keep / restore protocol.
//!
//! # Ownership
//!
//! A [`DagNode`] is a cheap handle around an `Arc`. Children hold strong
//! handles to their parents, so a parent lives as long as anything depends on
//! it. Parents only hold `Weak` back-references to their children. Those are
//! used for touch propagation and are upgraded with a liveness check; dead
//! entries are pruned as they are found.
//!
//! # Touch propagation
//!
//! `touch()` marks a node and walks its children with a worklist:
//!
//! 1. A child that is already touched is skipped, together with everything
//!    below it. Touched deterministic nodes always have touched children, so
//!    nothing is missed, and diamonds are visited once.
//! 2. Deterministic children are marked and their children queued.
//! 3. Stochastic children are marked (their density is stale) but not
//!    expanded: their value does not depend on their parents.
//!
//! The first clean-to-touched transition of a node stores its cache, which
//! is what `restore()` puts back on rejection.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::deterministic::{self, DeterministicState};
use super::stochastic::{self, StochasticState};
use crate::error::{DomainError, StructuralError};
use crate::value::{Value, ValueType};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A fixed value. No parents, never changes on its own.
    Constant,

    /// A value drawn from a distribution over the parent values.
    Stochastic,

    /// A value computed from the parent values by a pure function.
    Deterministic,
}

impl NodeKind {
    /// Lower-case name used in messages and summaries.
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::Constant => "constant",
            NodeKind::Stochastic => "stochastic",
            NodeKind::Deterministic => "deterministic",
        }
    }
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The cached value (deterministic) or density (stochastic) is current.
    Clean,

    /// The cache is stale and will be recomputed on the next read.
    Touched,
}

pub(crate) enum NodeBody {
    Constant(Value),
    Stochastic(StochasticState),
    Deterministic(DeterministicState),
}

impl NodeBody {
    fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Constant(_) => NodeKind::Constant,
            NodeBody::Stochastic(_) => NodeKind::Stochastic,
            NodeBody::Deterministic(_) => NodeKind::Deterministic,
        }
    }
}

pub(crate) struct NodeState {
    pub(crate) body: NodeBody,
    pub(crate) dirty: DirtyState,
    /// Number of clean-to-touched transitions.
    pub(crate) touches: u64,
    pub(crate) parents: SmallVec<[DagNode; 4]>,
    children: Vec<Weak<NodeInner>>,
}

pub(crate) struct NodeInner {
    id: NodeId,
    name: String,
    value_type: ValueType,
    pub(crate) state: RwLock<NodeState>,
}

/// A shared handle to a node in the dependency graph.
#[derive(Clone)]
pub struct DagNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl DagNode {
    /// Create a node and link it under `parents`.
    pub(crate) fn new(
        name: impl Into<String>,
        value_type: ValueType,
        body: NodeBody,
        parents: &[DagNode],
    ) -> Self {
        let dirty = match body {
            NodeBody::Constant(_) => DirtyState::Clean,
            // start touched so the first read computes
            NodeBody::Stochastic(_) | NodeBody::Deterministic(_) => DirtyState::Touched,
        };
        let node = Self {
            inner: Arc::new(NodeInner {
                id: NodeId::new(),
                name: name.into(),
                value_type,
                state: RwLock::new(NodeState {
                    body,
                    dirty,
                    touches: 0,
                    parents: parents.iter().cloned().collect(),
                    children: Vec::new(),
                }),
            }),
        };
        for parent in parents {
            parent.add_child(&node);
        }
        node
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the node's name, unique within its model.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Type of the values this node holds.
    pub fn value_type(&self) -> ValueType {
        self.inner.value_type
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.inner.state.read().body.kind()
    }

    /// Get the node's dirty state.
    pub fn dirty_state(&self) -> DirtyState {
        self.inner.state.read().dirty
    }

    /// Whether the cache is stale and will be recomputed on the next read.
    pub fn is_touched(&self) -> bool {
        self.dirty_state() == DirtyState::Touched
    }

    /// How many times this node went from clean to touched.
    pub fn times_touched(&self) -> u64 {
        self.inner.state.read().touches
    }

    /// Whether this is a stochastic node clamped to observed data.
    pub fn is_clamped(&self) -> bool {
        match &self.inner.state.read().body {
            NodeBody::Stochastic(s) => s.clamped,
            _ => false,
        }
    }

    /// Whether both handles refer to the same node.
    pub fn is_same(&self, other: &DagNode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current parents, in argument order.
    pub fn parents(&self) -> Vec<DagNode> {
        self.inner.state.read().parents.to_vec()
    }

    /// Live children. Dead back-references are pruned.
    pub fn children(&self) -> Vec<DagNode> {
        let mut state = self.inner.state.write();
        state.children.retain(|w| w.strong_count() > 0);
        state
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| DagNode { inner })
            .collect()
    }

    /// Current value.
    ///
    /// Deterministic nodes recompute here if touched. A function evaluated
    /// outside its domain yields `Err`; stochastic children of such a node
    /// score `-inf`.
    pub fn value(&self) -> Result<Value, DomainError> {
        {
            let state = self.inner.state.read();
            match &state.body {
                NodeBody::Constant(v) => return Ok(v.clone()),
                NodeBody::Stochastic(s) => return Ok(s.value.clone()),
                NodeBody::Deterministic(_) => {}
            }
        }
        deterministic::evaluate(self)
    }

    /// Log-probability contribution of this node. Zero for non-stochastic
    /// nodes; recomputed lazily for stochastic ones.
    pub fn ln_probability(&self) -> f64 {
        if self.kind() == NodeKind::Stochastic {
            stochastic::ln_probability(self)
        } else {
            0.0
        }
    }

    /// Mark this node stale and propagate to everything downstream.
    pub fn touch(&self) {
        trace!(node = %self.inner.name, "touch");
        self.mark_touched();

        let mut worklist = self.children();
        while let Some(node) = worklist.pop() {
            if !node.mark_touched() {
                continue;
            }
            if node.kind() == NodeKind::Deterministic {
                worklist.extend(node.children());
            }
        }
    }

    /// Accept the current state of this node and its affected subgraph:
    /// stochastic densities are brought up to date and snapshots dropped.
    /// Deterministic nodes nobody has read yet stay touched.
    pub fn keep(&self) {
        let nodes: Vec<DagNode> = std::iter::once(self.clone())
            .chain(self.downstream())
            .collect();
        // refresh first so evaluations below don't reopen snapshots
        for node in &nodes {
            node.ln_probability();
        }
        for node in &nodes {
            node.commit();
        }
    }

    /// Reject the current state: stored caches (and the stored value of a
    /// perturbed stochastic node) are put back. Nodes without a stored cache
    /// stay touched and recompute on their next read.
    pub fn restore(&self) {
        for node in std::iter::once(self.clone()).chain(self.downstream()) {
            node.rollback();
        }
    }

    /// Whether this node's value changed in the open transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        let state = self.inner.state.read();
        match &state.body {
            NodeBody::Constant(_) => state.dirty == DirtyState::Touched,
            NodeBody::Stochastic(s) => s.stored_value.is_some(),
            NodeBody::Deterministic(d) => !matches!(d.stored, Snapshot::Empty),
        }
    }

    /// Stochastic nodes whose density depends on this node's value: the
    /// stochastic children, and the stochastic children of every
    /// deterministic descendant.
    pub fn affected_nodes(&self) -> Vec<DagNode> {
        self.downstream()
            .into_iter()
            .filter(|n| n.kind() == NodeKind::Stochastic)
            .collect()
    }

    /// Deterministic descendants plus the stochastic frontier, each once.
    fn downstream(&self) -> Vec<DagNode> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut worklist = self.children();
        while let Some(node) = worklist.pop() {
            if !seen.insert(node.id()) {
                continue;
            }
            if node.kind() == NodeKind::Deterministic {
                worklist.extend(node.children());
            }
            out.push(node);
        }
        out
    }

    /// Is `self` an ancestor of `other` (or `other` itself)?
    pub fn is_ancestor_of(&self, other: &DagNode) -> bool {
        let mut seen = HashSet::new();
        let mut worklist = vec![other.clone()];
        while let Some(node) = worklist.pop() {
            if node.is_same(self) {
                return true;
            }
            if seen.insert(node.id()) {
                worklist.extend(node.parents());
            }
        }
        false
    }

    /// Replace every edge from `old` with an edge from `new`, then touch.
    ///
    /// The graph is left unmodified on error.
    pub fn swap_parent(&self, old: &DagNode, new: &DagNode) -> Result<(), StructuralError> {
        let slots: Vec<usize> = {
            let state = self.inner.state.read();
            state
                .parents
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_same(old))
                .map(|(i, _)| i)
                .collect()
        };
        if slots.is_empty() {
            return Err(StructuralError::NotAParent {
                parent: old.name().to_string(),
                child: self.name().to_string(),
            });
        }
        for &slot in &slots {
            self.check_parent_type(slot, new)?;
        }
        self.check_acyclic(new)?;

        {
            let mut state = self.inner.state.write();
            for &slot in &slots {
                state.parents[slot] = new.clone();
            }
        }
        old.remove_child(self);
        new.add_child(self);
        trace!(node = %self.inner.name, old = %old.name(), new = %new.name(), "swapped parent");

        self.commit_edit();
        Ok(())
    }

    /// Append a parent (variadic deterministic nodes only).
    pub fn add_parent(&self, parent: &DagNode) -> Result<(), StructuralError> {
        let count = self.inner.state.read().parents.len() + 1;
        self.check_arity(count)?;
        self.check_parent_type(count - 1, parent)?;
        self.check_acyclic(parent)?;

        self.inner.state.write().parents.push(parent.clone());
        parent.add_child(self);
        self.commit_edit();
        Ok(())
    }

    /// Remove every edge from `parent` (variadic deterministic nodes only).
    pub fn remove_parent(&self, parent: &DagNode) -> Result<(), StructuralError> {
        let (present, remaining) = {
            let state = self.inner.state.read();
            let present = state.parents.iter().filter(|p| p.is_same(parent)).count();
            (present, state.parents.len() - present)
        };
        if present == 0 {
            return Err(StructuralError::NotAParent {
                parent: parent.name().to_string(),
                child: self.name().to_string(),
            });
        }
        self.check_arity(remaining)?;

        self.inner
            .state
            .write()
            .parents
            .retain(|p| !p.is_same(parent));
        parent.remove_child(self);
        self.commit_edit();
        Ok(())
    }

    /// Drop every parent edge. Only for nodes leaving the model.
    pub(crate) fn detach(&self) {
        let parents: Vec<DagNode> = self.inner.state.write().parents.drain(..).collect();
        for parent in &parents {
            parent.remove_child(self);
        }
    }

    /// Structural edits are not proposals: touch and commit right away.
    pub(crate) fn commit_edit(&self) {
        self.touch();
        self.keep();
    }

    fn check_acyclic(&self, parent: &DagNode) -> Result<(), StructuralError> {
        if self.is_ancestor_of(parent) {
            return Err(StructuralError::Cycle {
                parent: parent.name().to_string(),
                child: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn check_parent_type(&self, slot: usize, parent: &DagNode) -> Result<(), StructuralError> {
        let expected = {
            let state = self.inner.state.read();
            match &state.body {
                NodeBody::Constant(_) => None,
                NodeBody::Stochastic(s) => s.distribution.parameter_types().get(slot).copied(),
                NodeBody::Deterministic(d) => Some(d.function.argument_type(slot)),
            }
        };
        match expected {
            Some(expected) if expected.accepts(parent.value_type()) => Ok(()),
            Some(expected) => Err(StructuralError::TypeMismatch {
                node: format!("{}[{}]", self.name(), slot),
                expected,
                found: parent.value_type(),
            }),
            None => Err(self.arity_error(slot + 1)),
        }
    }

    fn check_arity(&self, count: usize) -> Result<(), StructuralError> {
        let admitted = match &self.inner.state.read().body {
            NodeBody::Deterministic(d) => d.function.arity().admits(count),
            _ => false,
        };
        if admitted {
            Ok(())
        } else {
            Err(self.arity_error(count))
        }
    }

    fn arity_error(&self, found: usize) -> StructuralError {
        let expected = match &self.inner.state.read().body {
            NodeBody::Constant(_) => "no".to_string(),
            NodeBody::Stochastic(s) => format!("exactly {}", s.distribution.parameter_types().len()),
            NodeBody::Deterministic(d) => d.function.arity().to_string(),
        };
        StructuralError::Arity {
            node: self.name().to_string(),
            expected,
            found,
        }
    }

    fn add_child(&self, child: &DagNode) {
        let mut state = self.inner.state.write();
        let known = state
            .children
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(&child.inner));
        if !known {
            state.children.push(Arc::downgrade(&child.inner));
        }
    }

    fn remove_child(&self, child: &DagNode) {
        self.inner
            .state
            .write()
            .children
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != Arc::as_ptr(&child.inner));
    }

    /// Clean-to-touched transition. Stores the cache and returns `true` if
    /// the node was clean; otherwise returns `false` and changes nothing.
    fn mark_touched(&self) -> bool {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        if state.dirty == DirtyState::Touched {
            return false;
        }
        match &mut state.body {
            NodeBody::Constant(_) => {}
            NodeBody::Stochastic(s) => s.stored_ln_prob.record(s.ln_prob),
            NodeBody::Deterministic(d) => match d.cached.take() {
                Some(cached) => d.stored.record(cached),
                None => d.stored.mark_unavailable(),
            },
        }
        state.dirty = DirtyState::Touched;
        state.touches += 1;
        true
    }

    /// Drop the transaction snapshots of this node.
    pub(crate) fn commit(&self) {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        match &mut state.body {
            NodeBody::Constant(_) => state.dirty = DirtyState::Clean,
            NodeBody::Stochastic(s) => {
                s.stored_value = None;
                s.stored_ln_prob.clear();
            }
            NodeBody::Deterministic(d) => d.stored.clear(),
        }
    }

    fn rollback(&self) {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        match &mut state.body {
            NodeBody::Constant(_) => state.dirty = DirtyState::Clean,
            NodeBody::Stochastic(s) => {
                let value_restored = match s.stored_value.take() {
                    Some(value) => {
                        s.value = value;
                        true
                    }
                    None => false,
                };
                match std::mem::replace(&mut s.stored_ln_prob, Snapshot::Empty) {
                    Snapshot::Taken(ln_prob) => {
                        s.ln_prob = ln_prob;
                        state.dirty = DirtyState::Clean;
                    }
                    // the density was computed from the rejected state
                    Snapshot::Unavailable => state.dirty = DirtyState::Touched,
                    Snapshot::Empty if value_restored => state.dirty = DirtyState::Touched,
                    Snapshot::Empty => {}
                }
            }
            NodeBody::Deterministic(d) => match std::mem::replace(&mut d.stored, Snapshot::Empty) {
                Snapshot::Taken(value) => {
                    d.cached = Some(value);
                    state.dirty = DirtyState::Clean;
                }
                Snapshot::Unavailable => {
                    d.cached = None;
                    state.dirty = DirtyState::Touched;
                }
                Snapshot::Empty => {}
            },
        }
    }
}

/// Cache recorded for the open transaction.
#[derive(Debug, Clone)]
pub(crate) enum Snapshot<T> {
    /// Nothing recorded since the last keep or restore.
    Empty,
    /// The cache as it was before the node's first touch.
    Taken(T),
    /// The node had no valid cache when the transaction started.
    Unavailable,
}

impl<T> Snapshot<T> {
    pub(crate) fn record(&mut self, cache: T) {
        if matches!(self, Snapshot::Empty) {
            *self = Snapshot::Taken(cache);
        }
    }

    pub(crate) fn mark_unavailable(&mut self) {
        if matches!(self, Snapshot::Empty) {
            *self = Snapshot::Unavailable;
        }
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        match self {
            Snapshot::Taken(cache) => Some(cache),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Snapshot::Empty;
    }
}

/// Collect the values of `parents`, attributing failures to the parent.
pub(crate) fn parent_values(parents: &[DagNode]) -> Result<Vec<Value>, DomainError> {
    parents
        .iter()
        .map(|p| {
            p.value().map_err(|e| DomainError::InvalidParent {
                parent: p.name().to_string(),
                source: Box::new(e),
            })
        })
        .collect()
}

/// Map a raw log-density onto the engine's convention: anything that is not
/// a number counts as `-inf` (and is reported, since it usually means a bug
/// in a plug-in rather than a value outside the support).
pub(crate) fn sanitize_ln_density(node: &str, ln_density: f64) -> f64 {
    if ln_density.is_nan() {
        warn!(node, "log-density is NaN; treating as -inf");
        f64::NEG_INFINITY
    } else {
        ln_density
    }
}

impl PartialEq for DagNode {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for DagNode {}

impl fmt::Debug for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("DagNode")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &state.body.kind())
            .field("dirty", &state.dirty)
            .field("parents", &state.parents.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, x: f64) -> DagNode {
        DagNode::new(name, ValueType::Real, NodeBody::Constant(Value::Real(x)), &[])
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn constant_node_starts_clean() {
        let node = constant("c", 1.0);
        assert_eq!(node.kind(), NodeKind::Constant);
        assert_eq!(node.dirty_state(), DirtyState::Clean);
        assert_eq!(node.value(), Ok(Value::Real(1.0)));
        assert_eq!(node.ln_probability(), 0.0);
    }

    #[test]
    fn touch_and_keep_a_constant() {
        let node = constant("c", 1.0);
        node.touch();
        assert!(node.is_touched());
        assert_eq!(node.times_touched(), 1);

        // idempotent
        node.touch();
        assert_eq!(node.times_touched(), 1);

        node.keep();
        assert!(!node.is_touched());
    }

    #[test]
    fn children_drop_out_when_released() {
        let parent = constant("p", 1.0);
        {
            let child = DagNode::new(
                "c",
                ValueType::Real,
                NodeBody::Constant(Value::Real(2.0)),
                &[parent.clone()],
            );
            assert_eq!(parent.children(), vec![child.clone()]);
            assert_eq!(child.parents(), vec![parent.clone()]);
        }
        assert!(parent.children().is_empty());
    }

    #[test]
    fn ancestry() {
        let a = constant("a", 1.0);
        let b = DagNode::new(
            "b",
            ValueType::Real,
            NodeBody::Constant(Value::Real(2.0)),
            &[a.clone()],
        );
        assert!(a.is_ancestor_of(&b));
        assert!(a.is_ancestor_of(&a));
        assert!(!b.is_ancestor_of(&a));
    }

    #[test]
    fn nan_densities_become_negative_infinity() {
        assert_eq!(sanitize_ln_density("x", f64::NAN), f64::NEG_INFINITY);
        assert_eq!(sanitize_ln_density("x", -1.5), -1.5);
    }
}
