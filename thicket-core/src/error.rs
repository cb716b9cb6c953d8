//! Error Types
//!
//! Errors are split by how far they travel:
//!
//! - [`DomainError`] never reaches the driver. A function or density evaluated
//!   outside its domain becomes a log-probability of `-inf`, which rejects the
//!   current proposal.
//! - [`StructuralError`], [`DistributionError`], [`MoveError`] and
//!   [`ResourceError`] abort the current operation and are reported to the
//!   caller. A structural edit that fails leaves the graph unmodified.
//!
//! [`Error`] aggregates everything the public API can return.

use thiserror::Error;

use crate::value::ValueType;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A value fell outside the mathematical domain of a function or distribution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("{function}: argument {value} is outside the domain ({reason})")]
    OutOfDomain {
        function: String,
        value: f64,
        reason: &'static str,
    },

    #[error("{function}: expected {expected} argument, got {found}")]
    ArgumentType {
        function: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("{function}: expected {expected} arguments, got {found}")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("parent '{parent}' has no valid value: {source}")]
    InvalidParent {
        parent: String,
        #[source]
        source: Box<DomainError>,
    },
}

/// Attempted graph construction or edit that would break the DAG.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructuralError {
    #[error("attaching '{parent}' to '{child}' would create a cycle")]
    Cycle { parent: String, child: String },

    #[error("'{node}' expects a {expected} value, got {found}")]
    TypeMismatch {
        node: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("'{parent}' is not a parent of '{child}'")]
    NotAParent { parent: String, child: String },

    #[error("'{node}' accepts {expected} parents, would have {found}")]
    Arity {
        node: String,
        expected: String,
        found: usize,
    },

    #[error("a node named '{0}' already exists in the model")]
    DuplicateName(String),

    #[error("no node named '{0}' in the model")]
    UnknownNode(String),

    #[error("'{0}' is clamped to observed data")]
    Clamped(String),

    #[error("cannot remove '{node}': '{child}' still depends on it")]
    InvalidRemoval { node: String, child: String },

    #[error("'{node}' is a {kind} node; operation requires a {required} node")]
    WrongKind {
        node: String,
        kind: &'static str,
        required: &'static str,
    },
}

/// A distribution could not produce a usable draw.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DistributionError {
    #[error("{distribution}: invalid parameters: {source}")]
    InvalidParameters {
        distribution: String,
        #[source]
        source: DomainError,
    },

    #[error("{distribution}: drawn value {value:?} has non-finite log-density {ln_density}")]
    NonFiniteDensity {
        distribution: String,
        value: crate::value::Value,
        ln_density: f64,
    },

    #[error("could not initialize '{model}' with a finite posterior after {attempts} attempts")]
    Initialization { model: String, attempts: usize },
}

/// A move that cannot be built or cannot run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoveError {
    #[error("move '{name}' cannot {operation} while {state}")]
    InvalidTransition {
        name: String,
        operation: &'static str,
        state: &'static str,
    },

    #[error("move '{name}' targets clamped node '{node}'")]
    ClampedTarget { name: String, node: String },

    #[error("move '{name}' requires a {expected} target, '{node}' holds {found}")]
    TargetType {
        name: String,
        node: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("move '{name}' has an empty target vector '{node}'")]
    EmptyTarget { name: String, node: String },

    #[error("move '{name}' needs a finite, positive tuning parameter, got {value}")]
    InvalidTuningParameter { name: String, value: f64 },

    #[error("move '{name}' could not put back the previous value: {source}")]
    Undo {
        name: String,
        #[source]
        source: StructuralError,
    },
}

/// Failures in collaborators that read or write outside the graph.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid checkpoint encoding: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("invalid checkpoint encoding: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Any error the public API can return.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Move(#[from] MoveError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}
