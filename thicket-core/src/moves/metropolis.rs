//! Metropolis-Hastings Moves
//!
//! A [`MetropolisHastingsMove`] wraps a [`Proposal`] in a graph transaction.
//!
//! # How a Move Works
//!
//! 1. `prepare()` collects the targets and the stochastic nodes whose
//!    density depends on them, and records those densities.
//! 2. `propose()` lets the kernel perturb the targets. Touching them marks
//!    the affected subgraph stale.
//! 3. The densities of the affected nodes are read again; only the stale
//!    deterministic nodes between the targets and those nodes recompute.
//! 4. `accept()` keeps the new state, `reject()` undoes the kernel and
//!    restores every stored cache.
//!
//! The move is a small state machine, `Idle -> Prepared -> Proposed ->
//! Idle`, so at most one proposal per move is ever in flight.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::proposal::Proposal;
use crate::error::MoveError;
use crate::graph::DagNode;
use crate::random::RandomNumberGenerator;

/// Below this log acceptance ratio a proposal is rejected without a draw.
const LN_ACCEPTANCE_FLOOR: f64 = -300.0;

/// Where a move is in its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    Idle,
    Prepared,
    Proposed,
}

impl MoveState {
    fn label(self) -> &'static str {
        match self {
            MoveState::Idle => "idle",
            MoveState::Prepared => "prepared",
            MoveState::Proposed => "proposed",
        }
    }
}

/// How a proposed state is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acceptance {
    /// The Metropolis-Hastings rule.
    #[default]
    MetropolisHastings,
    /// Accept only non-decreasing posteriors.
    HillClimbing,
}

/// Change in log-density between the prepared and the proposed state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorRatio {
    pub ln_likelihood: f64,
    pub ln_prior: f64,
}

impl PosteriorRatio {
    /// `p_heat * (l_heat * Δ ln L + Δ ln prior)`. A cold likelihood
    /// (`l_heat == 0`) drops out entirely, even when its ratio is infinite.
    pub fn heated(&self, likelihood_heat: f64, posterior_heat: f64) -> f64 {
        let likelihood = if likelihood_heat == 0.0 {
            0.0
        } else {
            likelihood_heat * self.ln_likelihood
        };
        posterior_heat * (likelihood + self.ln_prior)
    }
}

/// The Metropolis-Hastings acceptance test.
///
/// A ratio that is not a finite number is rejected, and a ratio that cannot
/// lose is accepted, both without consuming a random draw.
pub fn accept_metropolis_hastings(
    ln_posterior_ratio: f64,
    ln_hastings_ratio: f64,
    rng: &mut RandomNumberGenerator,
) -> bool {
    if !ln_posterior_ratio.is_finite() || ln_hastings_ratio.is_nan() {
        return false;
    }
    let ln_acceptance = ln_posterior_ratio + ln_hastings_ratio;
    if ln_acceptance >= 0.0 {
        true
    } else if ln_acceptance < LN_ACCEPTANCE_FLOOR {
        false
    } else {
        rng.uniform01() < ln_acceptance.exp()
    }
}

/// One row of the operator summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveSummary {
    pub name: String,
    pub targets: Vec<String>,
    pub weight: f64,
    pub tried: u64,
    pub accepted: u64,
    pub acceptance_rate: f64,
    pub tuning_parameter: Option<f64>,
}

impl fmt::Display for MoveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<28} {:<16} {:>6.2} {:>9} {:>9} {:>7.3}",
            self.name,
            self.targets.join(","),
            self.weight,
            self.tried,
            self.accepted,
            self.acceptance_rate
        )?;
        if let Some(lambda) = self.tuning_parameter {
            write!(f, " {lambda:>10.4}")?;
        }
        Ok(())
    }
}

/// A proposal kernel together with its transaction and counters.
pub struct MetropolisHastingsMove {
    proposal: Box<dyn Proposal>,
    weight: f64,
    auto_tune: bool,
    acceptance: Acceptance,
    state: MoveState,
    /// Targets followed by the stochastic nodes they affect, each once.
    affected: Vec<DagNode>,
    /// Densities of `affected` at `prepare`.
    prepared: Vec<f64>,
    ln_hastings: f64,
    tried: u64,
    accepted: u64,
    tried_since_tune: u64,
    accepted_since_tune: u64,
}

impl MetropolisHastingsMove {
    /// Create a move with the given schedule weight. Auto-tuning is on.
    pub fn new(proposal: impl Proposal + 'static, weight: f64) -> Self {
        Self {
            proposal: Box::new(proposal),
            weight,
            auto_tune: true,
            acceptance: Acceptance::MetropolisHastings,
            state: MoveState::Idle,
            affected: Vec::new(),
            prepared: Vec::new(),
            ln_hastings: 0.0,
            tried: 0,
            accepted: 0,
            tried_since_tune: 0,
            accepted_since_tune: 0,
        }
    }

    pub fn with_auto_tune(mut self, auto_tune: bool) -> Self {
        self.auto_tune = auto_tune;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn name(&self) -> &str {
        self.proposal.name()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn state(&self) -> MoveState {
        self.state
    }

    pub fn targets(&self) -> Vec<DagNode> {
        self.proposal.nodes()
    }

    pub fn times_tried(&self) -> u64 {
        self.tried
    }

    pub fn times_accepted(&self) -> u64 {
        self.accepted
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.tried == 0 {
            0.0
        } else {
            self.accepted as f64 / self.tried as f64
        }
    }

    pub fn tuning_parameter(&self) -> Option<f64> {
        self.proposal.tuning_parameter()
    }

    /// Snapshot the targets and record the densities that may change.
    pub fn prepare(&mut self) -> Result<(), MoveError> {
        self.expect_state(MoveState::Idle, "prepare")?;
        let targets = self.proposal.nodes();
        if let Some(clamped) = targets.iter().find(|n| n.is_clamped()) {
            return Err(MoveError::ClampedTarget {
                name: self.name().to_string(),
                node: clamped.name().to_string(),
            });
        }

        let mut seen = HashSet::new();
        self.affected.clear();
        for node in targets.iter().cloned().chain(targets.iter().flat_map(DagNode::affected_nodes)) {
            if seen.insert(node.id()) {
                self.affected.push(node);
            }
        }
        self.prepared = self.affected.iter().map(DagNode::ln_probability).collect();

        self.proposal.prepare();
        self.state = MoveState::Prepared;
        Ok(())
    }

    /// Perturb the targets. Returns the log Hastings ratio.
    pub fn propose(&mut self, rng: &mut RandomNumberGenerator) -> Result<f64, MoveError> {
        self.expect_state(MoveState::Prepared, "propose")?;
        self.ln_hastings = self.proposal.do_proposal(rng);
        self.state = MoveState::Proposed;
        Ok(self.ln_hastings)
    }

    /// Density change of the affected nodes since `prepare`. Clamped nodes
    /// count as likelihood, free ones as prior.
    pub fn posterior_ratio(&self) -> Result<PosteriorRatio, MoveError> {
        self.expect_state(MoveState::Proposed, "evaluate")?;
        let mut ratio = PosteriorRatio {
            ln_likelihood: 0.0,
            ln_prior: 0.0,
        };
        for (node, &before) in self.affected.iter().zip(&self.prepared) {
            let after = node.ln_probability();
            // -inf to -inf is no change, not NaN
            let delta = if after == before { 0.0 } else { after - before };
            if node.is_clamped() {
                ratio.ln_likelihood += delta;
            } else {
                ratio.ln_prior += delta;
            }
        }
        Ok(ratio)
    }

    /// Keep the proposed state.
    pub fn accept(&mut self) -> Result<(), MoveError> {
        self.expect_state(MoveState::Proposed, "accept")?;
        for target in self.proposal.nodes() {
            target.keep();
        }
        self.proposal.clean_proposal();
        self.tried += 1;
        self.accepted += 1;
        self.tried_since_tune += 1;
        self.accepted_since_tune += 1;
        self.finish();
        Ok(())
    }

    /// Undo the proposal and restore every stored cache.
    ///
    /// The move returns to idle even when the kernel cannot put its values
    /// back; that failure is reported afterwards.
    pub fn reject(&mut self) -> Result<(), MoveError> {
        self.expect_state(MoveState::Proposed, "reject")?;
        let undone = self.proposal.undo_proposal();
        for target in self.proposal.nodes() {
            target.restore();
        }
        self.tried += 1;
        self.tried_since_tune += 1;
        self.finish();
        undone
    }

    /// Run one complete transaction. Returns whether it was accepted.
    pub fn perform(
        &mut self,
        rng: &mut RandomNumberGenerator,
        likelihood_heat: f64,
        posterior_heat: f64,
    ) -> Result<bool, MoveError> {
        self.prepare()?;
        let ln_hastings = self.propose(rng)?;
        let ln_ratio = self.posterior_ratio()?.heated(likelihood_heat, posterior_heat);

        let accepted = match self.acceptance {
            Acceptance::MetropolisHastings => {
                accept_metropolis_hastings(ln_ratio, ln_hastings, rng)
            }
            Acceptance::HillClimbing => ln_ratio.is_finite() && ln_ratio >= 0.0,
        };
        debug!(
            name = %self.name(),
            ln_ratio,
            ln_hastings,
            accepted,
            "proposal"
        );
        if accepted {
            self.accept()?;
        } else {
            self.reject()?;
        }
        Ok(accepted)
    }

    /// Tune the kernel from the acceptance rate since the last call. Needs
    /// more than two trials to say anything.
    pub fn tune(&mut self) {
        if !self.auto_tune || self.tried_since_tune <= 2 {
            return;
        }
        let rate = self.accepted_since_tune as f64 / self.tried_since_tune as f64;
        self.proposal.tune(rate);
        debug!(
            name = %self.name(),
            rate,
            parameter = ?self.proposal.tuning_parameter(),
            "tuned"
        );
        self.tried_since_tune = 0;
        self.accepted_since_tune = 0;
    }

    /// Zero the counters, as at the start of a new run.
    pub fn reset_counters(&mut self) {
        self.tried = 0;
        self.accepted = 0;
        self.tried_since_tune = 0;
        self.accepted_since_tune = 0;
    }

    pub fn summary(&self) -> MoveSummary {
        MoveSummary {
            name: self.name().to_string(),
            targets: self
                .proposal
                .nodes()
                .iter()
                .map(|n| n.name().to_string())
                .collect(),
            weight: self.weight,
            tried: self.tried,
            accepted: self.accepted,
            acceptance_rate: self.acceptance_rate(),
            tuning_parameter: self.proposal.tuning_parameter(),
        }
    }

    fn finish(&mut self) {
        self.affected.clear();
        self.prepared.clear();
        self.state = MoveState::Idle;
    }

    fn expect_state(&self, expected: MoveState, operation: &'static str) -> Result<(), MoveError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MoveError::InvalidTransition {
                name: self.name().to_string(),
                operation,
                state: self.state.label(),
            })
        }
    }
}

impl fmt::Debug for MetropolisHastingsMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetropolisHastingsMove")
            .field("name", &self.name())
            .field("weight", &self.weight)
            .field("state", &self.state)
            .field("tried", &self.tried)
            .field("accepted", &self.accepted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Exponential, Normal};
    use crate::function::Ln;
    use crate::graph::{Model, StochasticNode};
    use crate::moves::{ScaleProposal, SlideProposal};
    use crate::value::Value;

    fn normal_model(rng: &mut RandomNumberGenerator) -> (Model, StochasticNode) {
        let mut model = Model::new("m");
        model.constant("zero", 0.0).unwrap();
        model.constant("one", 1.0).unwrap();
        let mu = model
            .stochastic("mu", Normal, &["zero", "one"], rng)
            .unwrap();
        model.observed("y", Normal, &["mu", "one"], 1.5).unwrap();
        model.settle();
        (model, mu)
    }

    // ------------------------------------------------------------------
    // Acceptance test
    // ------------------------------------------------------------------

    #[test]
    fn improvements_are_accepted_without_a_draw() {
        let mut rng = RandomNumberGenerator::new(1);
        let mut reference = rng.clone();
        assert!(accept_metropolis_hastings(0.5, 0.0, &mut rng));
        assert!(accept_metropolis_hastings(-1.0, 1.0, &mut rng));
        assert_eq!(rng.uniform01(), reference.uniform01());
    }

    #[test]
    fn non_finite_ratios_are_rejected_without_a_draw() {
        let mut rng = RandomNumberGenerator::new(1);
        let mut reference = rng.clone();
        assert!(!accept_metropolis_hastings(f64::NEG_INFINITY, 0.0, &mut rng));
        assert!(!accept_metropolis_hastings(f64::NAN, 0.0, &mut rng));
        assert!(!accept_metropolis_hastings(f64::INFINITY, 0.0, &mut rng));
        assert!(!accept_metropolis_hastings(-500.0, 0.0, &mut rng));
        assert_eq!(rng.uniform01(), reference.uniform01());
    }

    #[test]
    fn worse_states_are_accepted_at_the_expected_rate() {
        let mut rng = RandomNumberGenerator::new(99);
        let n = 20_000;
        let accepted = (0..n)
            .filter(|_| accept_metropolis_hastings(0.5f64.ln(), 0.0, &mut rng))
            .count();
        let rate = accepted as f64 / n as f64;
        assert!((rate - 0.5).abs() < 0.02, "rate {rate}");
    }

    #[test]
    fn cold_likelihood_drops_out() {
        let ratio = PosteriorRatio {
            ln_likelihood: f64::NEG_INFINITY,
            ln_prior: -1.0,
        };
        assert_eq!(ratio.heated(0.0, 1.0), -1.0);
        assert_eq!(ratio.heated(1.0, 0.5), f64::NEG_INFINITY);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    #[test]
    fn state_machine_refuses_out_of_order_calls() {
        let mut rng = RandomNumberGenerator::new(2);
        let (_model, mu) = normal_model(&mut rng);
        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(mu, 1.0).unwrap(), 1.0);

        assert!(matches!(
            mv.accept(),
            Err(MoveError::InvalidTransition {
                operation: "accept",
                state: "idle",
                ..
            })
        ));
        mv.prepare().unwrap();
        assert!(mv.prepare().is_err());
        assert!(mv.reject().is_err());
        mv.propose(&mut rng).unwrap();
        assert!(mv.propose(&mut rng).is_err());
        mv.reject().unwrap();
        assert_eq!(mv.state(), MoveState::Idle);
        assert_eq!(mv.times_tried(), 1);
    }

    #[test]
    fn reject_restores_values_and_densities() {
        let mut rng = RandomNumberGenerator::new(2);
        let (model, mu) = normal_model(&mut rng);
        let value = mu.current_value();
        let posterior = model.ln_posterior();

        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(mu.clone(), 1.0).unwrap(), 1.0);
        mv.prepare().unwrap();
        mv.propose(&mut rng).unwrap();
        assert_ne!(mu.current_value(), value);
        let ratio = mv.posterior_ratio().unwrap();
        assert!(ratio.ln_likelihood != 0.0 && ratio.ln_prior != 0.0);

        mv.reject().unwrap();
        assert_eq!(mu.current_value(), value);
        assert!(!mu.is_touched());
        assert!(!model.get("y").unwrap().is_touched());
        assert_eq!(model.ln_posterior(), posterior);
    }

    #[test]
    fn reject_reports_a_target_clamped_mid_proposal() {
        let mut rng = RandomNumberGenerator::new(2);
        let (_model, mu) = normal_model(&mut rng);
        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(mu.clone(), 1.0).unwrap(), 1.0);
        mv.prepare().unwrap();
        mv.propose(&mut rng).unwrap();
        mu.clamp(Value::Real(0.25)).unwrap();

        assert!(matches!(mv.reject(), Err(MoveError::Undo { .. })));
        assert_eq!(mv.state(), MoveState::Idle);
        assert_eq!(mu.current_value(), Value::Real(0.25));
    }

    #[test]
    fn accept_keeps_the_new_state() {
        let mut rng = RandomNumberGenerator::new(2);
        let (model, mu) = normal_model(&mut rng);
        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(mu.clone(), 1.0).unwrap(), 1.0);
        mv.prepare().unwrap();
        mv.propose(&mut rng).unwrap();
        let proposed = mu.current_value();
        mv.accept().unwrap();

        assert_eq!(mu.current_value(), proposed);
        assert!(!mu.is_touched());
        let m = proposed.as_real("t").unwrap();
        let ln_norm = -0.5 * (2.0 * std::f64::consts::PI).ln();
        let expected = 2.0 * ln_norm - 0.5 * m * m - 0.5 * (1.5 - m) * (1.5 - m);
        assert!((model.ln_posterior() - expected).abs() < 1e-12);
        assert_eq!(mv.acceptance_rate(), 1.0);
    }

    #[test]
    fn out_of_support_proposals_are_always_rejected() {
        let mut rng = RandomNumberGenerator::new(4);
        let mut model = Model::new("m");
        model.constant("zero", 0.0).unwrap();
        model.constant("one", 1.0).unwrap();
        let x = model
            .stochastic("x", Normal, &["zero", "one"], &mut rng)
            .unwrap();
        model.deterministic("log_x", Ln, &["x"]).unwrap();
        model.observed("y", Normal, &["log_x", "one"], 0.0).unwrap();
        x.set_value(Value::Real(1.0)).unwrap();
        model.settle();

        // a huge window lands on x <= 0 about half the time
        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(x.clone(), 1e6).unwrap(), 1.0);
        for _ in 0..50 {
            let accepted = mv.perform(&mut rng, 1.0, 1.0).unwrap();
            let value = x.current_value().as_real("t").unwrap();
            assert!(value > 0.0, "accepted = {accepted}, x = {value}");
        }
        assert!(model.ln_posterior().is_finite());
    }

    #[test]
    fn hill_climbing_never_goes_down() {
        let mut rng = RandomNumberGenerator::new(8);
        let (model, mu) = normal_model(&mut rng);
        let mut mv = MetropolisHastingsMove::new(ScaleProposal::new(mu, 0.5).unwrap(), 1.0)
            .with_acceptance(Acceptance::HillClimbing);
        let mut best = model.ln_posterior();
        for _ in 0..100 {
            mv.perform(&mut rng, 1.0, 1.0).unwrap();
            let now = model.ln_posterior();
            assert!(now >= best - 1e-12);
            best = now;
        }
    }

    #[test]
    fn tuning_needs_three_trials_and_resets() {
        let mut rng = RandomNumberGenerator::new(6);
        let (_model, mu) = normal_model(&mut rng);
        let mut mv = MetropolisHastingsMove::new(SlideProposal::new(mu, 1.0).unwrap(), 1.0);
        for _ in 0..2 {
            mv.perform(&mut rng, 1.0, 1.0).unwrap();
        }
        mv.tune();
        assert_eq!(mv.tuning_parameter(), Some(1.0));

        mv.perform(&mut rng, 1.0, 1.0).unwrap();
        mv.tune();
        assert_ne!(mv.tuning_parameter(), Some(1.0));
        assert_eq!(mv.times_tried(), 3);

        let summary = mv.summary();
        assert_eq!(summary.name, "slide");
        assert_eq!(summary.targets, vec!["mu".to_string()]);
    }

    #[test]
    fn clamped_after_construction_is_refused_at_prepare() {
        let mut rng = RandomNumberGenerator::new(6);
        let mut model = Model::new("m");
        model.constant("rate", 1.0).unwrap();
        let x = model
            .stochastic("x", Exponential, &["rate"], &mut rng)
            .unwrap();
        let mut mv = MetropolisHastingsMove::new(ScaleProposal::new(x.clone(), 1.0).unwrap(), 1.0);
        x.clamp(Value::Real(1.0)).unwrap();
        assert!(matches!(mv.prepare(), Err(MoveError::ClampedTarget { .. })));
        assert_eq!(mv.state(), MoveState::Idle);
    }
}
