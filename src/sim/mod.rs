//! Simulation seam used by the sweep driver.
//!
//! The driver only needs to build a simulator from a model and protocol,
//! pre-pace it, and log a measured window. [`engine::DormandPrince`] is the
//! built-in backend.

pub mod datalog;
pub mod engine;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Model;
use crate::protocol::Protocol;

pub use datalog::{Apd, DataLog};
pub use engine::DormandPrince;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            abs: 1e-8,
            rel: 1e-8,
        }
    }
}

pub trait Simulator {
    /// Current simulation time.
    fn time(&self) -> f64;

    /// Current state vector, in the model's state order.
    fn state(&self) -> &[f64];

    /// Integrates for `duration` without logging. The end state replaces the
    /// current state; the simulation time is left unchanged.
    fn pre(&mut self, duration: f64) -> Result<()>;

    /// Integrates for `duration`, logging the named variables.
    fn run(&mut self, duration: f64, log: &[&str]) -> Result<DataLog>;
}

pub trait SimulatorFactory: Sync {
    type Sim: Simulator + Send;

    /// Builds a simulator from a snapshot of `model` (current state and
    /// parameter values) paced by `protocol`.
    fn build(&self, model: &Model, protocol: &Protocol) -> Result<Self::Sim>;
}
