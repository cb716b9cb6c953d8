//! Thicket Core
//!
//! This crate provides the graph engine behind Bayesian MCMC inference with
//! probabilistic graphical models. It implements:
//!
//! - A lazily evaluated DAG of constant, stochastic and deterministic nodes
//! - Incremental updates through touch / keep / restore transactions
//! - Metropolis-Hastings moves with auto-tuning
//! - A seedable, reproducible random number service
//! - An MCMC driver with burn-in, stopping rules and parallel replicates
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Nodes, touch propagation and the model registry
//! - `distribution` / `function`: The plug-in seams behind stochastic and
//!   deterministic nodes, with a few reference implementations
//! - `moves`: Proposal kernels and the Metropolis-Hastings move
//! - `mcmc`: The chain driver
//! - `convergence`: Effective sample size and the Geweke diagnostic
//! - `monitor` / `checkpoint`: Traces and resumable model state
//!
//! # Example
//!
//! ```rust
//! use thicket_core::distribution::Normal;
//! use thicket_core::graph::Model;
//! use thicket_core::mcmc::Mcmc;
//! use thicket_core::moves::{MetropolisHastingsMove, SlideProposal};
//! use thicket_core::random::RandomNumberGenerator;
//! use thicket_core::config::McmcConfig;
//!
//! let mut rng = RandomNumberGenerator::new(42);
//! let mut model = Model::new("normal");
//! model.constant("zero", 0.0)?;
//! model.constant("one", 1.0)?;
//! let mu = model.stochastic("mu", Normal, &["zero", "one"], &mut rng)?;
//! model.observed("y", Normal, &["mu", "one"], 1.2)?;
//!
//! let moves = vec![MetropolisHastingsMove::new(SlideProposal::new(mu, 1.0)?, 1.0)];
//! let mut chain = Mcmc::new(model, moves, rng, McmcConfig::default())?;
//! chain.initialize()?;
//! let summary = chain.run(1_000, &[])?;
//! assert_eq!(summary.generations, 1_000);
//! # Ok::<(), thicket_core::error::Error>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod convergence;
pub mod distribution;
pub mod error;
pub mod function;
pub mod graph;
pub mod mcmc;
pub mod monitor;
pub mod moves;
pub mod random;
pub mod value;

pub use error::{Error, Result};
