//! MCMC Driver
//!
//! [`Mcmc`] owns one chain: its model, its moves, its generator and its
//! monitors. Nothing in a chain is shared with another chain, so
//! [`run_replicates`] can run independent chains on the rayon pool.
//!
//! # How a Run Works
//!
//! 1. `initialize()` makes sure the chain starts at a finite posterior,
//!    redrawing the free stochastic nodes from their priors if needed.
//! 2. `burnin()` runs generations without monitoring and tunes the moves
//!    every `tuning_interval` generations.
//! 3. `run()` runs generations, feeding every monitor, until the requested
//!    number of generations is reached or a stopping rule fires.
//!    Convergence rules look at a trace of the free stochastic nodes taken
//!    from the start of the run; burn-in is not part of it.
//!
//! A generation performs as many moves as the move weights sum to, each
//! picked at random by weight.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::McmcConfig;
use crate::convergence::{effective_sample_size, geweke_p_value, GEWEKE_FIRST, GEWEKE_LAST};
use crate::error::{DistributionError, MoveError, Result};
use crate::graph::Model;
use crate::monitor::{Monitor, TraceMonitor};
use crate::moves::{MetropolisHastingsMove, MoveSummary, RandomMoveSchedule};
use crate::random::RandomNumberGenerator;

/// Condition that ends a run early.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoppingRule {
    /// Stop once this many generations have run.
    MaxGenerations(u64),
    /// Stop once the run has taken this long.
    MaxTime(Duration),
    /// Stop once every traced parameter reaches `min_ess` effective
    /// samples. Checked every `every` generations.
    MinEss { min_ess: f64, every: u64 },
    /// Stop once no traced parameter fails the Geweke test at level
    /// `alpha`, comparing the first `first` and last `last` fractions of
    /// the trace. Checked every `every` generations.
    Geweke {
        alpha: f64,
        first: f64,
        last: f64,
        every: u64,
    },
}

impl StoppingRule {
    /// Geweke rule with the usual 10% / 50% windows.
    pub fn geweke(alpha: f64, every: u64) -> Self {
        StoppingRule::Geweke {
            alpha,
            first: GEWEKE_FIRST,
            last: GEWEKE_LAST,
            every,
        }
    }

    fn needs_trace(&self) -> bool {
        matches!(self, StoppingRule::MinEss { .. } | StoppingRule::Geweke { .. })
    }

    fn is_met(&self, generations: u64, started: Instant, trace: Option<&TraceMonitor>) -> bool {
        match *self {
            StoppingRule::MaxGenerations(max) => generations >= max,
            StoppingRule::MaxTime(max) => started.elapsed() >= max,
            StoppingRule::MinEss { min_ess, every } => {
                due(generations, every)
                    && converged(trace, |column| effective_sample_size(column) >= min_ess)
            }
            StoppingRule::Geweke {
                alpha,
                first,
                last,
                every,
            } => {
                due(generations, every)
                    && converged(trace, |column| {
                        geweke_p_value(column, first, last).is_some_and(|p| p > alpha)
                    })
            }
        }
    }
}

fn due(generations: u64, every: u64) -> bool {
    generations > 0 && generations % every.max(1) == 0
}

/// Whether every parameter column passes `test`. An empty trace never does.
fn converged(trace: Option<&TraceMonitor>, test: impl Fn(&[f64]) -> bool) -> bool {
    let Some(trace) = trace else {
        return false;
    };
    let columns = trace.parameter_columns();
    let passed = !columns.is_empty()
        && columns
            .iter()
            .all(|(_, column)| test(column.as_slice()));
    if passed {
        debug!(samples = trace.rows().len(), "convergence reached");
    }
    passed
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub seed: u64,
    pub generations: u64,
    pub elapsed_secs: f64,
    pub ln_posterior: f64,
    pub operators: Vec<MoveSummary>,
}

/// A single Markov chain.
pub struct Mcmc {
    model: Model,
    moves: Vec<MetropolisHastingsMove>,
    schedule: RandomMoveSchedule,
    monitors: Vec<Box<dyn Monitor>>,
    rng: RandomNumberGenerator,
    config: McmcConfig,
    generation: u64,
}

impl Mcmc {
    /// Assemble a chain. The generator should be the one the model was built
    /// with so that the whole analysis follows a single stream.
    pub fn new(
        model: Model,
        moves: Vec<MetropolisHastingsMove>,
        rng: RandomNumberGenerator,
        config: McmcConfig,
    ) -> Result<Self> {
        config.validate()?;
        let weights: Vec<f64> = moves.iter().map(MetropolisHastingsMove::weight).collect();
        Ok(Self {
            model,
            moves,
            schedule: RandomMoveSchedule::new(&weights),
            monitors: Vec::new(),
            rng,
            config,
            generation: 0,
        })
    }

    pub fn add_monitor(&mut self, monitor: impl Monitor + 'static) {
        self.monitors.push(Box::new(monitor));
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn moves(&self) -> &[MetropolisHastingsMove] {
        &self.moves
    }

    pub fn monitors(&self) -> &[Box<dyn Monitor>] {
        &self.monitors
    }

    pub fn rng(&self) -> &RandomNumberGenerator {
        &self.rng
    }

    /// Generations run so far, burn-in included.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Settle the graph and make sure the posterior is finite, redrawing
    /// from the prior a bounded number of times.
    #[instrument(skip_all, fields(model = %self.model.name()))]
    pub fn initialize(&mut self) -> Result<()> {
        self.model.settle();
        if self.model.ln_posterior().is_finite() {
            return Ok(());
        }
        let attempts = self.config.initialization_attempts;
        for attempt in 1..=attempts {
            warn!(attempt, "posterior is not finite; redrawing from the prior");
            self.model.redraw_all(&mut self.rng)?;
            if self.model.ln_posterior().is_finite() {
                return Ok(());
            }
        }
        Err(DistributionError::Initialization {
            model: self.model.name().to_string(),
            attempts,
        }
        .into())
    }

    /// Run one generation.
    pub fn next_generation(&mut self) -> Result<(), MoveError> {
        let likelihood_heat = self.config.effective_likelihood_heat();
        let posterior_heat = self.config.posterior_heat;
        for _ in 0..self.schedule.moves_per_generation() {
            let Some(index) = self.schedule.next_move(&mut self.rng) else {
                break;
            };
            self.moves[index].perform(&mut self.rng, likelihood_heat, posterior_heat)?;
        }
        self.generation += 1;
        Ok(())
    }

    /// Run `generations` generations of burn-in, tuning every
    /// `tuning_interval` generations. Counters start from zero afterwards.
    #[instrument(skip(self), fields(model = %self.model.name()))]
    pub fn burnin(&mut self, generations: u64, tuning_interval: u64) -> Result<()> {
        info!("burn-in started");
        for done in 1..=generations {
            self.next_generation()?;
            if tuning_interval > 0 && done % tuning_interval == 0 {
                for mv in &mut self.moves {
                    mv.tune();
                }
            }
        }
        for mv in &mut self.moves {
            mv.reset_counters();
        }
        info!(ln_posterior = self.model.ln_posterior(), "burn-in finished");
        Ok(())
    }

    /// Run up to `generations` generations, stopping early when any rule
    /// fires.
    #[instrument(skip(self, rules), fields(model = %self.model.name()))]
    pub fn run(&mut self, generations: u64, rules: &[StoppingRule]) -> Result<RunSummary> {
        let started = Instant::now();
        for monitor in &mut self.monitors {
            monitor.on_start(&self.model);
            monitor.on_sample(0, &self.model);
        }

        let mut trace = rules.iter().any(StoppingRule::needs_trace).then(|| {
            let mut trace = TraceMonitor::new(1, &[]);
            trace.on_start(&self.model);
            trace
        });

        let mut done = 0;
        while done < generations
            && !rules
                .iter()
                .any(|r| r.is_met(done, started, trace.as_ref()))
        {
            self.next_generation()?;
            done += 1;
            for monitor in &mut self.monitors {
                monitor.on_sample(done, &self.model);
            }
            if let Some(trace) = &mut trace {
                trace.on_sample(done, &self.model);
            }
            if done % self.config.print_every == 0 {
                info!(
                    generation = done,
                    ln_posterior = self.model.ln_posterior(),
                    "progress"
                );
            }
        }

        let summary = RunSummary {
            model: self.model.name().to_string(),
            seed: self.rng.seed(),
            generations: done,
            elapsed_secs: started.elapsed().as_secs_f64(),
            ln_posterior: self.model.ln_posterior(),
            operators: self.operator_summary(),
        };
        info!(generations = done, elapsed = summary.elapsed_secs, "run finished");
        Ok(summary)
    }

    /// Initialize, burn in and run as configured.
    pub fn run_analysis(&mut self) -> Result<RunSummary> {
        self.initialize()?;
        self.burnin(self.config.burnin, self.config.tuning_interval)?;
        let mut rules = Vec::new();
        if let Some(secs) = self.config.max_time_secs {
            rules.push(StoppingRule::MaxTime(Duration::from_secs_f64(secs)));
        }
        let every = self.config.convergence_every;
        if let Some(min_ess) = self.config.min_ess {
            rules.push(StoppingRule::MinEss { min_ess, every });
        }
        if let Some(alpha) = self.config.geweke_alpha {
            rules.push(StoppingRule::geweke(alpha, every));
        }
        self.run(self.config.generations, &rules)
    }

    pub fn operator_summary(&self) -> Vec<MoveSummary> {
        self.moves.iter().map(MetropolisHastingsMove::summary).collect()
    }

    pub fn into_model(self) -> Model {
        self.model
    }
}

/// Run `config.replicates` independent chains in parallel.
///
/// `build` is called once per chain, with the chain's index and its own
/// generator, and returns the chain's model and moves. Chain seeds are
/// derived from `config.seed`, so the whole set is reproducible.
pub fn run_replicates<F>(config: &McmcConfig, build: F) -> Result<Vec<RunSummary>>
where
    F: Fn(usize, &mut RandomNumberGenerator) -> Result<(Model, Vec<MetropolisHastingsMove>)>
        + Sync,
{
    config.validate()?;
    let seeds = config.rng().derive_seeds(config.replicates);
    debug!(?seeds, "replicate seeds");

    seeds
        .into_par_iter()
        .enumerate()
        .map(|(index, seed)| -> Result<RunSummary> {
            let mut rng = RandomNumberGenerator::new(seed);
            let (model, moves) = build(index, &mut rng)?;
            let mut chain = Mcmc::new(model, moves, rng, config.clone())?;
            let summary = chain.run_analysis()?;
            info!(replicate = index, seed, "replicate finished");
            Ok(summary)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Exponential, Normal};
    use crate::error::Error;
    use crate::moves::{ScaleProposal, SlideProposal};
    use crate::value::Value;

    fn normal_chain(seed: u64, config: McmcConfig) -> Mcmc {
        let mut rng = RandomNumberGenerator::new(seed);
        let mut model = Model::new("normal");
        model.constant("zero", 0.0).unwrap();
        model.constant("one", 1.0).unwrap();
        let mu = model
            .stochastic("mu", Normal, &["zero", "one"], &mut rng)
            .unwrap();
        model.observed("y", Normal, &["mu", "one"], 2.0).unwrap();
        let moves = vec![MetropolisHastingsMove::new(SlideProposal::new(mu, 1.0).unwrap(), 1.0)];
        Mcmc::new(model, moves, rng, config).unwrap()
    }

    #[test]
    fn run_counts_generations_and_monitors() {
        let mut chain = normal_chain(1, McmcConfig::default());
        chain.add_monitor(TraceMonitor::new(10, &[]));
        chain.initialize().unwrap();
        let summary = chain.run(100, &[]).unwrap();

        assert_eq!(summary.generations, 100);
        assert_eq!(chain.generation(), 100);
        assert_eq!(summary.operators.len(), 1);
        assert_eq!(summary.operators[0].tried, 100);
        assert!(summary.ln_posterior.is_finite());
    }

    #[test]
    fn stopping_rules_end_the_run_early() {
        let mut chain = normal_chain(1, McmcConfig::default());
        chain.initialize().unwrap();
        let summary = chain
            .run(1_000, &[StoppingRule::MaxGenerations(25)])
            .unwrap();
        assert_eq!(summary.generations, 25);

        let summary = chain
            .run(1_000, &[StoppingRule::MaxTime(Duration::ZERO)])
            .unwrap();
        assert_eq!(summary.generations, 0);
    }

    #[test]
    fn min_ess_rule_stops_once_the_trace_is_long_enough() {
        let mut chain = normal_chain(6, McmcConfig::default());
        chain.initialize().unwrap();
        let rule = StoppingRule::MinEss {
            min_ess: 50.0,
            every: 100,
        };
        let summary = chain.run(100_000, &[rule]).unwrap();
        assert!(summary.generations < 100_000);
        assert_eq!(summary.generations % 100, 0);

        let mut trace = TraceMonitor::new(1, &["mu"]);
        trace.on_start(chain.model());
        assert!(!rule.is_met(100, Instant::now(), Some(&trace)));
        assert!(!rule.is_met(100, Instant::now(), None));
    }

    #[test]
    fn geweke_rule_stops_a_stationary_chain() {
        let mut chain = normal_chain(7, McmcConfig::default());
        chain.initialize().unwrap();
        chain.burnin(500, 100).unwrap();
        let summary = chain
            .run(100_000, &[StoppingRule::geweke(0.001, 200)])
            .unwrap();
        assert!(summary.generations < 100_000);
        assert_eq!(summary.generations % 200, 0);
    }

    #[test]
    fn convergence_rules_wait_for_their_interval() {
        let mut trace = TraceMonitor::new(1, &[]);
        let chain = normal_chain(8, McmcConfig::default());
        trace.on_start(chain.model());
        for generation in 0..500 {
            trace.on_sample(generation, chain.model());
        }
        // a constant trace has full effective size but is only checked on
        // multiples of the interval
        let rule = StoppingRule::MinEss {
            min_ess: 10.0,
            every: 100,
        };
        assert!(!rule.is_met(150, Instant::now(), Some(&trace)));
        assert!(rule.is_met(200, Instant::now(), Some(&trace)));
    }

    #[test]
    fn configured_convergence_rules_are_used() {
        let config = McmcConfig {
            seed: Some(3),
            generations: 1_000_000,
            min_ess: Some(20.0),
            convergence_every: 50,
            ..McmcConfig::default()
        };
        let mut chain = normal_chain(3, config);
        let summary = chain.run_analysis().unwrap();
        assert!(summary.generations < 1_000_000);
        assert_eq!(summary.generations % 50, 0);
    }

    #[test]
    fn burnin_tunes_and_resets_counters() {
        let mut chain = normal_chain(2, McmcConfig::default());
        chain.initialize().unwrap();
        chain.burnin(200, 50).unwrap();
        assert_eq!(chain.generation(), 200);
        let summary = &chain.operator_summary()[0];
        assert_eq!(summary.tried, 0);
        assert_ne!(summary.tuning_parameter, Some(1.0));
    }

    #[test]
    fn same_seed_same_chain() {
        let run = |seed| {
            let mut chain = normal_chain(seed, McmcConfig::default());
            chain.initialize().unwrap();
            chain.run(200, &[]).unwrap();
            chain.model().stochastic_node("mu").unwrap().current_value()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    fn sample_means(chain: &mut Mcmc, generations: u64) -> f64 {
        let mut trace = TraceMonitor::new(1, &["mu"]);
        trace.on_start(chain.model());
        for generation in 1..=generations {
            chain.next_generation().unwrap();
            trace.on_sample(generation, chain.model());
        }
        let values: Vec<f64> = trace
            .column("mu")
            .iter()
            .map(|v| v.as_real("t").unwrap())
            .collect();
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn posterior_mean_is_recovered() {
        // mu ~ N(0, 1), y | mu ~ N(mu, 1), y = 2: posterior N(1, 1/2)
        let mut chain = normal_chain(3, McmcConfig::default());
        chain.initialize().unwrap();
        chain.burnin(1_000, 100).unwrap();
        let mean = sample_means(&mut chain, 20_000);
        assert!((mean - 1.0).abs() < 0.1, "mean {mean}");
    }

    #[test]
    fn under_prior_ignores_the_data() {
        let config = McmcConfig {
            under_prior: true,
            ..McmcConfig::default()
        };
        let mut chain = normal_chain(4, config);
        chain.initialize().unwrap();
        let mean = sample_means(&mut chain, 20_000);
        assert!(mean.abs() < 0.15, "mean {mean}");
    }

    #[test]
    fn initialization_redraws_until_finite() {
        let mut rng = RandomNumberGenerator::new(5);
        let mut model = Model::new("positive");
        model.constant("rate", 1.0).unwrap();
        let x = model
            .stochastic("x", Exponential, &["rate"], &mut rng)
            .unwrap();
        x.set_value(Value::Real(-1.0)).unwrap();
        let moves = vec![MetropolisHastingsMove::new(ScaleProposal::new(x.clone(), 1.0).unwrap(), 1.0)];
        let mut chain = Mcmc::new(model, moves, rng, McmcConfig::default()).unwrap();

        chain.initialize().unwrap();
        assert!(x.current_value().as_real("t").unwrap() > 0.0);
        assert!(chain.model().ln_posterior().is_finite());
    }

    #[test]
    fn initialization_gives_up_eventually() {
        let rng = RandomNumberGenerator::new(5);
        let mut model = Model::new("impossible");
        model.constant("rate", 1.0).unwrap();
        model.observed("y", Exponential, &["rate"], -1.0).unwrap();
        let config = McmcConfig {
            initialization_attempts: 3,
            ..McmcConfig::default()
        };
        let mut chain = Mcmc::new(model, Vec::new(), rng, config).unwrap();
        let err = chain.initialize().unwrap_err();
        assert!(matches!(
            err,
            Error::Distribution(DistributionError::Initialization { attempts: 3, .. })
        ));
    }

    fn exponential_chain(
        _index: usize,
        rng: &mut RandomNumberGenerator,
    ) -> Result<(Model, Vec<MetropolisHastingsMove>)> {
        let mut model = Model::new("exp");
        model.constant("rate", 1.0)?;
        let x = model.stochastic("x", Exponential, &["rate"], rng)?;
        let moves = vec![MetropolisHastingsMove::new(ScaleProposal::new(x, 1.0)?, 1.0)];
        Ok((model, moves))
    }

    #[test]
    fn replicates_are_independent_and_reproducible() {
        let config = McmcConfig {
            seed: Some(17),
            generations: 50,
            burnin: 20,
            tuning_interval: 10,
            replicates: 3,
            ..McmcConfig::default()
        };
        let first = run_replicates(&config, exponential_chain).unwrap();
        let second = run_replicates(&config, exponential_chain).unwrap();
        assert_eq!(first.len(), 3);
        let seeds: Vec<u64> = first.iter().map(|s| s.seed).collect();
        assert_eq!(seeds, second.iter().map(|s| s.seed).collect::<Vec<_>>());
        assert_ne!(seeds[0], seeds[1]);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.ln_posterior, b.ln_posterior);
            assert_eq!(a.generations, 50);
        }
    }
}
