//! Dependency Graph
//!
//! The model is a directed acyclic graph of constant, stochastic and
//! deterministic nodes. An edge from A to B means B's value (deterministic)
//! or density (stochastic) is a function of A's value.
//!
//! # Overview
//!
//! - [`DagNode`] is the shared handle every node kind builds on. It owns the
//!   edge set and the touch / keep / restore protocol.
//! - [`StochasticNode`] holds a value drawn from a distribution and a lazily
//!   computed log-density.
//! - [`DeterministicNode`] caches `function(parent values)`, recomputed only
//!   when read after a touch.
//! - [`Model`] is the named registry: construction, joint density, ordering.
//!
//! # Transactions
//!
//! A proposal is a transaction over the graph:
//!
//! 1. A move changes a stochastic node's value and touches it.
//! 2. Everything downstream up to the next stochastic nodes becomes stale;
//!    the first touch of each node stores its cache.
//! 3. The densities of the affected stochastic nodes are read, which
//!    recomputes exactly the stale deterministic nodes they depend on.
//! 4. `keep()` drops the stored caches; `restore()` puts them back.

mod deterministic;
mod model;
mod node;
mod stochastic;

pub use deterministic::DeterministicNode;
pub use model::Model;
pub use node::{DagNode, DirtyState, NodeId, NodeKind};
pub use stochastic::StochasticNode;
