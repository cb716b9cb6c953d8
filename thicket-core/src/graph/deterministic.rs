//! Deterministic Nodes
//!
//! A deterministic node caches `function(parent values)`.
//!
//! # Laziness
//!
//! Touching never recomputes anything. The function runs when a touched node
//! is read, and the result is cached until the next touch, so a chain of
//! deterministic nodes touched once is recomputed at most once per node no
//! matter how often its descendants are queried. Nodes that nobody reads
//! stay touched and cost nothing.

use std::ops::Deref;

use tracing::trace;

use super::node::{parent_values, DagNode, DirtyState, NodeBody, NodeKind, Snapshot};
use crate::error::{DomainError, StructuralError};
use crate::function::Function;
use crate::value::Value;

pub(crate) struct DeterministicState {
    pub(crate) function: Box<dyn Function>,
    pub(crate) cached: Option<Result<Value, DomainError>>,
    /// Cache before the node was touched in the current transaction.
    pub(crate) stored: Snapshot<Result<Value, DomainError>>,
    pub(crate) evaluations: u64,
}

/// Typed handle to a deterministic node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterministicNode {
    node: DagNode,
}

impl DeterministicNode {
    pub(crate) fn new(
        name: &str,
        function: Box<dyn Function>,
        parents: &[DagNode],
    ) -> Result<Self, StructuralError> {
        if !function.arity().admits(parents.len()) {
            return Err(StructuralError::Arity {
                node: name.to_string(),
                expected: function.arity().to_string(),
                found: parents.len(),
            });
        }
        for (slot, parent) in parents.iter().enumerate() {
            let expected = function.argument_type(slot);
            if !expected.accepts(parent.value_type()) {
                return Err(StructuralError::TypeMismatch {
                    node: format!("{name}[{slot}]"),
                    expected,
                    found: parent.value_type(),
                });
            }
        }

        let value_type = function.return_type();
        let body = NodeBody::Deterministic(DeterministicState {
            function,
            cached: None,
            stored: Snapshot::Empty,
            evaluations: 0,
        });
        Ok(Self {
            node: DagNode::new(name, value_type, body, parents),
        })
    }

    pub fn as_node(&self) -> &DagNode {
        &self.node
    }

    pub fn function_name(&self) -> String {
        match &self.node.inner.state.read().body {
            NodeBody::Deterministic(d) => d.function.name().to_string(),
            _ => unreachable!("DeterministicNode always wraps a deterministic body"),
        }
    }

    /// Number of times the function has been called.
    pub fn evaluations(&self) -> u64 {
        match &self.node.inner.state.read().body {
            NodeBody::Deterministic(d) => d.evaluations,
            _ => unreachable!("DeterministicNode always wraps a deterministic body"),
        }
    }
}

impl Deref for DeterministicNode {
    type Target = DagNode;

    fn deref(&self) -> &DagNode {
        &self.node
    }
}

impl TryFrom<DagNode> for DeterministicNode {
    type Error = StructuralError;

    fn try_from(node: DagNode) -> Result<Self, Self::Error> {
        match node.kind() {
            NodeKind::Deterministic => Ok(Self { node }),
            kind => Err(StructuralError::WrongKind {
                node: node.name().to_string(),
                kind: kind.label(),
                required: NodeKind::Deterministic.label(),
            }),
        }
    }
}

/// Return the cached value, recomputing first if the node is touched.
pub(crate) fn evaluate(node: &DagNode) -> Result<Value, DomainError> {
    {
        let state = node.inner.state.read();
        if let NodeBody::Deterministic(d) = &state.body {
            if state.dirty == DirtyState::Clean {
                if let Some(cached) = &d.cached {
                    return cached.clone();
                }
            }
        }
    }

    // parents are read (and recomputed) without holding our own lock
    let parents = node.parents();
    let arguments = parent_values(&parents);
    let parents_changed = parents.iter().any(DagNode::in_transaction);

    let mut guard = node.inner.state.write();
    let state = &mut *guard;
    let NodeBody::Deterministic(d) = &mut state.body else {
        unreachable!("evaluate is only called on deterministic nodes");
    };
    if parents_changed {
        // computed mid-transaction, not a valid pre-transaction cache
        d.stored.mark_unavailable();
    }
    let result = arguments.and_then(|args| d.function.compute(&args));
    trace!(node = %node.name(), ok = result.is_ok(), "recomputed");
    d.cached = Some(result.clone());
    d.evaluations += 1;
    state.dirty = DirtyState::Clean;
    result
}
