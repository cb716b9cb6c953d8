//! Proposals and Moves
//!
//! A move proposes a new value for one or more stochastic nodes and decides,
//! with the Metropolis-Hastings rule, whether the chain goes there.
//!
//! - [`Proposal`] is the kernel seam: perturb, report the Hastings ratio,
//!   undo.
//! - [`MetropolisHastingsMove`] runs a proposal as a graph transaction and
//!   keeps acceptance counters for tuning and the operator summary.
//! - [`RandomMoveSchedule`] picks the next move by weight.
//!
//! Shipped kernels: [`SlideProposal`], [`ScaleProposal`] and the
//! single-element vector updates in [`VectorElementProposal`].

mod metropolis;
mod proposal;
mod scale;
mod schedule;
mod slide;
mod vector;

pub use metropolis::{
    accept_metropolis_hastings, Acceptance, MetropolisHastingsMove, MoveState, MoveSummary,
    PosteriorRatio,
};
pub use proposal::{reflect, tune_towards, Proposal, MAX_TUNING_PARAMETER};
pub use scale::{ScaleProposal, SCALE_TARGET_ACCEPTANCE};
pub use schedule::RandomMoveSchedule;
pub use slide::{SlideProposal, SLIDE_TARGET_ACCEPTANCE};
pub use vector::{VectorElementProposal, VECTOR_TARGET_ACCEPTANCE};
