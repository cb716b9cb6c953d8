//! Distributions
//!
//! A stochastic node delegates everything value-specific to a
//! [`Distribution`]: drawing a value and scoring one. The parameters are the
//! current values of the node's parents, in the order they were attached.
//!
//! The engine never looks at a concrete distribution. The handful of
//! distributions in this module are reference plug-ins; model catalogues
//! implement the trait themselves.
//!
//! # Support and domain
//!
//! A value outside the support scores `Ok(f64::NEG_INFINITY)`. Parameters
//! outside their domain (a negative rate, say) are a [`DomainError`]; the
//! node turns that into `-inf` as well, and `sample` reports it so that a
//! redraw can fail loudly.

use rand_distr::{LogNormal as RandLogNormal, Normal as RandNormal};

use crate::error::DomainError;
use crate::random::RandomNumberGenerator;
use crate::value::{Value, ValueType};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

const REAL_1: &[ValueType] = &[ValueType::Real];
const REAL_2: &[ValueType] = &[ValueType::Real, ValueType::Real];

/// A probability distribution over node values.
pub trait Distribution: Send + Sync {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Type of the values this distribution draws.
    fn value_type(&self) -> ValueType;

    /// Expected type of each parameter (one per parent node).
    fn parameter_types(&self) -> &[ValueType];

    /// Draw a value given the parameters.
    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError>;

    /// Log-density (or log-mass) of `value` given the parameters.
    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError>;

    /// Bounds of the support for real-valued draws (or of each element for
    /// vectors). Sliding proposals reflect at finite bounds.
    fn bounds(&self, _parameters: &[Value]) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

/// Extract `N` real parameters, checking count and types.
fn real_parameters<const N: usize>(
    name: &str,
    parameters: &[Value],
) -> Result<[f64; N], DomainError> {
    if parameters.len() != N {
        return Err(DomainError::ArgumentCount {
            function: name.to_string(),
            expected: N,
            found: parameters.len(),
        });
    }
    let mut out = [0.0; N];
    for (slot, value) in out.iter_mut().zip(parameters) {
        *slot = value.as_real(name)?;
    }
    Ok(out)
}

fn require_positive(name: &str, value: f64, reason: &'static str) -> Result<f64, DomainError> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(DomainError::OutOfDomain {
            function: name.to_string(),
            value,
            reason,
        })
    }
}

/// Exponential distribution with parameter `rate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exponential;

impl Distribution for Exponential {
    fn name(&self) -> &str {
        "exponential"
    }

    fn value_type(&self) -> ValueType {
        ValueType::Real
    }

    fn parameter_types(&self) -> &[ValueType] {
        REAL_1
    }

    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError> {
        let [rate] = real_parameters(self.name(), parameters)?;
        let rate = require_positive(self.name(), rate, "rate must be positive")?;
        Ok(Value::Real(rng.exp1() / rate))
    }

    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError> {
        let [rate] = real_parameters(self.name(), parameters)?;
        let rate = require_positive(self.name(), rate, "rate must be positive")?;
        let x = value.as_real(self.name())?;
        if x < 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(rate.ln() - rate * x)
    }

    fn bounds(&self, _parameters: &[Value]) -> (f64, f64) {
        (0.0, f64::INFINITY)
    }
}

/// Normal distribution with parameters `mean` and `sd`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normal;

impl Distribution for Normal {
    fn name(&self) -> &str {
        "normal"
    }

    fn value_type(&self) -> ValueType {
        ValueType::Real
    }

    fn parameter_types(&self) -> &[ValueType] {
        REAL_2
    }

    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError> {
        let [mean, sd] = real_parameters(self.name(), parameters)?;
        let sd = require_positive(self.name(), sd, "standard deviation must be positive")?;
        let normal = RandNormal::new(mean, sd).map_err(|_| DomainError::OutOfDomain {
            function: self.name().to_string(),
            value: sd,
            reason: "standard deviation must be finite",
        })?;
        Ok(Value::Real(rng.sample(&normal)))
    }

    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError> {
        let [mean, sd] = real_parameters(self.name(), parameters)?;
        let sd = require_positive(self.name(), sd, "standard deviation must be positive")?;
        let z = (value.as_real(self.name())? - mean) / sd;
        Ok(-LN_SQRT_2PI - sd.ln() - 0.5 * z * z)
    }
}

/// Log-normal distribution with parameters `mu` and `sigma` on the log scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNormal;

impl Distribution for LogNormal {
    fn name(&self) -> &str {
        "lognormal"
    }

    fn value_type(&self) -> ValueType {
        ValueType::Real
    }

    fn parameter_types(&self) -> &[ValueType] {
        REAL_2
    }

    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError> {
        let [mu, sigma] = real_parameters(self.name(), parameters)?;
        let sigma = require_positive(self.name(), sigma, "sigma must be positive")?;
        let lognormal = RandLogNormal::new(mu, sigma).map_err(|_| DomainError::OutOfDomain {
            function: self.name().to_string(),
            value: sigma,
            reason: "sigma must be finite",
        })?;
        Ok(Value::Real(rng.sample(&lognormal)))
    }

    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError> {
        let [mu, sigma] = real_parameters(self.name(), parameters)?;
        let sigma = require_positive(self.name(), sigma, "sigma must be positive")?;
        let x = value.as_real(self.name())?;
        if x <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        let z = (x.ln() - mu) / sigma;
        Ok(-x.ln() - LN_SQRT_2PI - sigma.ln() - 0.5 * z * z)
    }

    fn bounds(&self, _parameters: &[Value]) -> (f64, f64) {
        (0.0, f64::INFINITY)
    }
}

/// Continuous uniform distribution on `[lower, upper]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl Uniform {
    fn limits(&self, parameters: &[Value]) -> Result<(f64, f64), DomainError> {
        let [lower, upper] = real_parameters(self.name(), parameters)?;
        if !(lower < upper) || !lower.is_finite() || !upper.is_finite() {
            return Err(DomainError::OutOfDomain {
                function: self.name().to_string(),
                value: upper - lower,
                reason: "bounds must be finite with lower < upper",
            });
        }
        Ok((lower, upper))
    }
}

impl Distribution for Uniform {
    fn name(&self) -> &str {
        "uniform"
    }

    fn value_type(&self) -> ValueType {
        ValueType::Real
    }

    fn parameter_types(&self) -> &[ValueType] {
        REAL_2
    }

    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError> {
        let (lower, upper) = self.limits(parameters)?;
        Ok(Value::Real(lower + rng.uniform01() * (upper - lower)))
    }

    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError> {
        let (lower, upper) = self.limits(parameters)?;
        let x = value.as_real(self.name())?;
        if x < lower || x > upper {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(-(upper - lower).ln())
    }

    fn bounds(&self, parameters: &[Value]) -> (f64, f64) {
        self.limits(parameters)
            .unwrap_or((f64::NEG_INFINITY, f64::INFINITY))
    }
}

/// A vector of `len` independent draws from a real-valued distribution.
pub struct Iid {
    name: String,
    element: Box<dyn Distribution>,
    len: usize,
}

impl Iid {
    pub fn new(element: impl Distribution + 'static, len: usize) -> Self {
        Self {
            name: format!("iid({})", element.name()),
            element: Box::new(element),
            len,
        }
    }
}

impl Distribution for Iid {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_type(&self) -> ValueType {
        ValueType::RealVector
    }

    fn parameter_types(&self) -> &[ValueType] {
        self.element.parameter_types()
    }

    fn sample(
        &self,
        parameters: &[Value],
        rng: &mut RandomNumberGenerator,
    ) -> Result<Value, DomainError> {
        let mut draws = Vec::with_capacity(self.len);
        for _ in 0..self.len {
            draws.push(self.element.sample(parameters, rng)?.as_real(&self.name)?);
        }
        Ok(Value::RealVector(draws))
    }

    fn ln_density(&self, parameters: &[Value], value: &Value) -> Result<f64, DomainError> {
        let xs = value.as_real_vector(&self.name)?;
        if xs.len() != self.len {
            return Ok(f64::NEG_INFINITY);
        }
        let mut total = 0.0;
        for &x in xs {
            total += self.element.ln_density(parameters, &Value::Real(x))?;
        }
        Ok(total)
    }

    fn bounds(&self, parameters: &[Value]) -> (f64, f64) {
        self.element.bounds(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(x: f64) -> Value {
        Value::Real(x)
    }

    #[test]
    fn exponential_density() {
        let d = Exponential;
        let lp = d.ln_density(&[real(2.0)], &real(0.5)).unwrap();
        assert!((lp - (2.0f64.ln() - 1.0)).abs() < 1e-12);
        assert_eq!(
            d.ln_density(&[real(2.0)], &real(-0.1)).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn exponential_rejects_non_positive_rate() {
        let err = Exponential
            .ln_density(&[real(-1.0)], &real(1.0))
            .unwrap_err();
        assert!(matches!(err, DomainError::OutOfDomain { .. }));
    }

    #[test]
    fn exponential_sample_scales_the_unit_rate_stream() {
        let mut rng = RandomNumberGenerator::new(42);
        let mut reference = RandomNumberGenerator::new(42);
        let x = Exponential.sample(&[real(4.0)], &mut rng).unwrap();
        assert_eq!(x, real(reference.exp1() / 4.0));
    }

    #[test]
    fn standard_normal_density_at_zero() {
        let lp = Normal.ln_density(&[real(0.0), real(1.0)], &real(0.0)).unwrap();
        assert!((lp + LN_SQRT_2PI).abs() < 1e-12);
    }

    #[test]
    fn normal_sample_mean_is_close() {
        let mut rng = RandomNumberGenerator::new(3);
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            sum += Normal
                .sample(&[real(5.0), real(2.0)], &mut rng)
                .unwrap()
                .as_real("t")
                .unwrap();
        }
        assert!((sum / n as f64 - 5.0).abs() < 0.1);
    }

    #[test]
    fn lognormal_samples_are_positive_with_the_right_median() {
        let mut rng = RandomNumberGenerator::new(5);
        let mut draws: Vec<f64> = (0..10_001)
            .map(|_| {
                LogNormal
                    .sample(&[real(1.0), real(0.5)], &mut rng)
                    .unwrap()
                    .as_real("t")
                    .unwrap()
            })
            .collect();
        assert!(draws.iter().all(|&x| x > 0.0));
        draws.sort_by(|a, b| a.total_cmp(b));
        assert!((draws[5_000].ln() - 1.0).abs() < 0.05);
    }

    #[test]
    fn lognormal_outside_support() {
        let lp = LogNormal
            .ln_density(&[real(0.0), real(1.0)], &real(0.0))
            .unwrap();
        assert_eq!(lp, f64::NEG_INFINITY);
    }

    #[test]
    fn uniform_density_and_bounds() {
        let params = [real(-1.0), real(3.0)];
        assert!((Uniform.ln_density(&params, &real(0.0)).unwrap() + 4.0f64.ln()).abs() < 1e-12);
        assert_eq!(
            Uniform.ln_density(&params, &real(3.5)).unwrap(),
            f64::NEG_INFINITY
        );
        assert_eq!(Uniform.bounds(&params), (-1.0, 3.0));
    }

    #[test]
    fn uniform_with_inverted_bounds_is_a_domain_error() {
        assert!(Uniform.ln_density(&[real(1.0), real(0.0)], &real(0.5)).is_err());
    }

    #[test]
    fn wrong_parameter_count() {
        let err = Normal.ln_density(&[real(0.0)], &real(0.0)).unwrap_err();
        assert_eq!(
            err,
            DomainError::ArgumentCount {
                function: "normal".into(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn iid_sums_element_densities() {
        let d = Iid::new(Exponential, 3);
        let mut rng = RandomNumberGenerator::new(9);
        let v = d.sample(&[real(1.0)], &mut rng).unwrap();
        let xs = v.as_real_vector("t").unwrap().to_vec();
        assert_eq!(xs.len(), 3);
        let expected: f64 = xs.iter().map(|x| -x).sum();
        assert!((d.ln_density(&[real(1.0)], &v).unwrap() - expected).abs() < 1e-12);
        assert_eq!(d.value_type(), ValueType::RealVector);
    }
}
