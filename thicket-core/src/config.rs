//! Analysis configuration
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid
//! configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::random::RandomNumberGenerator;

/// Settings of an MCMC analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McmcConfig {
    /// Seed of the first chain; `None` seeds from the clock.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Generations of the sampling run.
    #[serde(default = "default_generations")]
    pub generations: u64,

    /// Generations of burn-in before sampling.
    #[serde(default)]
    pub burnin: u64,

    /// Tune the moves every this many burn-in generations.
    #[serde(default = "default_tuning_interval")]
    pub tuning_interval: u64,

    /// Log progress every this many generations.
    #[serde(default = "default_print_every")]
    pub print_every: u64,

    /// Exponent on the likelihood.
    #[serde(default = "default_heat")]
    pub likelihood_heat: f64,

    /// Exponent on the posterior.
    #[serde(default = "default_heat")]
    pub posterior_heat: f64,

    /// Sample from the prior (likelihood heat 0).
    #[serde(default)]
    pub under_prior: bool,

    /// Number of independent chains.
    #[serde(default = "default_replicates")]
    pub replicates: usize,

    /// Wall-time budget of the sampling run.
    #[serde(default)]
    pub max_time_secs: Option<f64>,

    /// Stop once every traced parameter has this many effective samples.
    #[serde(default)]
    pub min_ess: Option<f64>,

    /// Stop once no traced parameter fails the Geweke test at this level.
    #[serde(default)]
    pub geweke_alpha: Option<f64>,

    /// Check the convergence rules every this many generations.
    #[serde(default = "default_convergence_every")]
    pub convergence_every: u64,

    /// How often initialization may redraw before giving up.
    #[serde(default = "default_initialization_attempts")]
    pub initialization_attempts: usize,
}

fn default_generations() -> u64 {
    10_000
}
fn default_tuning_interval() -> u64 {
    100
}
fn default_print_every() -> u64 {
    1_000
}
fn default_heat() -> f64 {
    1.0
}
fn default_replicates() -> usize {
    1
}
fn default_convergence_every() -> u64 {
    1_000
}
fn default_initialization_attempts() -> usize {
    100
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            seed: None,
            generations: default_generations(),
            burnin: 0,
            tuning_interval: default_tuning_interval(),
            print_every: default_print_every(),
            likelihood_heat: default_heat(),
            posterior_heat: default_heat(),
            under_prior: false,
            replicates: default_replicates(),
            max_time_secs: None,
            min_ess: None,
            geweke_alpha: None,
            convergence_every: default_convergence_every(),
            initialization_attempts: default_initialization_attempts(),
        }
    }
}

impl McmcConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ResourceError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ResourceError> {
        let invalid = |msg: &str| Err(ResourceError::Config(msg.to_string()));
        if self.tuning_interval == 0 {
            return invalid("tuning_interval must be positive");
        }
        if self.print_every == 0 {
            return invalid("print_every must be positive");
        }
        if self.replicates == 0 {
            return invalid("replicates must be positive");
        }
        if self.initialization_attempts == 0 {
            return invalid("initialization_attempts must be positive");
        }
        for (name, heat) in [
            ("likelihood_heat", self.likelihood_heat),
            ("posterior_heat", self.posterior_heat),
        ] {
            if !(0.0..=1.0).contains(&heat) {
                return Err(ResourceError::Config(format!(
                    "{name} must lie in [0, 1], got {heat}"
                )));
            }
        }
        if let Some(secs) = self.max_time_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid("max_time_secs must be positive");
            }
        }
        if self.convergence_every == 0 {
            return invalid("convergence_every must be positive");
        }
        if let Some(min_ess) = self.min_ess {
            if !(min_ess.is_finite() && min_ess > 0.0) {
                return invalid("min_ess must be positive");
            }
        }
        if let Some(alpha) = self.geweke_alpha {
            if !(alpha > 0.0 && alpha < 1.0) {
                return invalid("geweke_alpha must lie in (0, 1)");
            }
        }
        Ok(())
    }

    /// Generator for the first chain: the configured seed, or the clock.
    pub fn rng(&self) -> RandomNumberGenerator {
        match self.seed {
            Some(seed) => RandomNumberGenerator::new(seed),
            None => RandomNumberGenerator::from_time(),
        }
    }

    /// Likelihood heat in effect, taking `under_prior` into account.
    pub fn effective_likelihood_heat(&self) -> f64 {
        if self.under_prior {
            0.0
        } else {
            self.likelihood_heat
        }
    }
}
