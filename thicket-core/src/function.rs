//! Functions
//!
//! A deterministic node's value is `function(parent values)`. The function
//! must be pure: the node caches its result and only calls it again after a
//! touch.

use std::fmt;

use crate::error::DomainError;
use crate::value::{Value, ValueType};

/// How many arguments a function takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn admits(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "exactly {k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

/// A pure function of the parent values.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    fn return_type(&self) -> ValueType;

    fn arity(&self) -> Arity;

    /// Expected type of the argument at `index`.
    fn argument_type(&self, index: usize) -> ValueType;

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError>;
}

fn single_real(name: &str, arguments: &[Value]) -> Result<f64, DomainError> {
    match arguments {
        [x] => x.as_real(name),
        _ => Err(DomainError::ArgumentCount {
            function: name.to_string(),
            expected: 1,
            found: arguments.len(),
        }),
    }
}

/// Natural logarithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ln;

impl Function for Ln {
    fn name(&self) -> &str {
        "ln"
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::Real
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        let x = single_real(self.name(), arguments)?;
        if x <= 0.0 {
            return Err(DomainError::OutOfDomain {
                function: self.name().to_string(),
                value: x,
                reason: "argument must be positive",
            });
        }
        Ok(Value::Real(x.ln()))
    }
}

/// Exponential function.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exp;

impl Function for Exp {
    fn name(&self) -> &str {
        "exp"
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::Real
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        Ok(Value::Real(single_real(self.name(), arguments)?.exp()))
    }
}

/// Sum of one or more reals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Function for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        Arity::AtLeast(1)
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::Real
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        let mut total = 0.0;
        for a in arguments {
            total += a.as_real(self.name())?;
        }
        Ok(Value::Real(total))
    }
}

/// Product of one or more reals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Product;

impl Function for Product {
    fn name(&self) -> &str {
        "product"
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        Arity::AtLeast(1)
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::Real
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        let mut total = 1.0;
        for a in arguments {
            total *= a.as_real(self.name())?;
        }
        Ok(Value::Real(total))
    }
}

/// Sum of the elements of a real vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorSum;

impl Function for VectorSum {
    fn name(&self) -> &str {
        "vector_sum"
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::RealVector
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        match arguments {
            [v] => Ok(Value::Real(v.as_real_vector(self.name())?.iter().sum())),
            _ => Err(DomainError::ArgumentCount {
                function: self.name().to_string(),
                expected: 1,
                found: arguments.len(),
            }),
        }
    }
}

/// A real-valued function of real arguments backed by a closure.
///
/// # Example
///
/// ```rust
/// use thicket_core::function::{Arity, Function, RealFunction};
/// use thicket_core::value::Value;
///
/// let square = RealFunction::new("square", Arity::Exact(1), |x| Ok(x[0] * x[0]));
/// assert_eq!(square.compute(&[Value::Real(3.0)]).unwrap(), Value::Real(9.0));
/// ```
pub struct RealFunction<F> {
    name: String,
    arity: Arity,
    f: F,
}

impl<F> RealFunction<F>
where
    F: Fn(&[f64]) -> Result<f64, DomainError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, arity: Arity, f: F) -> Self {
        Self {
            name: name.into(),
            arity,
            f,
        }
    }
}

impl<F> Function for RealFunction<F>
where
    F: Fn(&[f64]) -> Result<f64, DomainError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn return_type(&self) -> ValueType {
        ValueType::Real
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn argument_type(&self, _index: usize) -> ValueType {
        ValueType::Real
    }

    fn compute(&self, arguments: &[Value]) -> Result<Value, DomainError> {
        let xs = arguments
            .iter()
            .map(|a| a.as_real(&self.name))
            .collect::<Result<Vec<_>, _>>()?;
        (self.f)(&xs).map(Value::Real)
    }
}
