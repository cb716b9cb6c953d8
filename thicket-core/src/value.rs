//! Node Values
//!
//! Every node in the graph holds a [`Value`]. The set of value kinds is
//! closed so that distributions and functions of any kind can live behind the
//! same trait objects, while [`ValueType`] lets the graph check type contracts
//! when nodes are connected or edited.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Real,
    Integer,
    Boolean,
    RealVector,
}

impl ValueType {
    /// Whether a slot declared as `self` can hold a value of type `found`.
    /// Integers are accepted where reals are expected.
    pub fn accepts(self, found: ValueType) -> bool {
        self == found || (self == ValueType::Real && found == ValueType::Integer)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Real => "Real",
            ValueType::Integer => "Integer",
            ValueType::Boolean => "Boolean",
            ValueType::RealVector => "RealVector",
        };
        f.write_str(name)
    }
}

/// A value held by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Real(f64),
    Integer(i64),
    Boolean(bool),
    RealVector(Vec<f64>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Real(_) => ValueType::Real,
            Value::Integer(_) => ValueType::Integer,
            Value::Boolean(_) => ValueType::Boolean,
            Value::RealVector(_) => ValueType::RealVector,
        }
    }

    /// Read the value as a real number.
    ///
    /// Integers widen to reals; anything else is a domain error attributed to
    /// `function`.
    pub fn as_real(&self, function: &str) -> Result<f64, DomainError> {
        match self {
            Value::Real(x) => Ok(*x),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(DomainError::ArgumentType {
                function: function.to_string(),
                expected: ValueType::Real,
                found: other.value_type(),
            }),
        }
    }

    pub fn as_real_vector(&self, function: &str) -> Result<&[f64], DomainError> {
        match self {
            Value::RealVector(v) => Ok(v),
            other => Err(DomainError::ArgumentType {
                function: function.to_string(),
                expected: ValueType::RealVector,
                found: other.value_type(),
            }),
        }
    }

    /// Flatten the value into reals for monitoring.
    pub fn to_reals(&self) -> Vec<f64> {
        match self {
            Value::Real(x) => vec![*x],
            Value::Integer(i) => vec![*i as f64],
            Value::Boolean(b) => vec![if *b { 1.0 } else { 0.0 }],
            Value::RealVector(v) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Real(x) => write!(f, "{x}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::RealVector(v) => {
                f.write_str("[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Real(x)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::RealVector(v)
    }
}
