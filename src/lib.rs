//! GKr sweeps of cardiac cell models from alternative initial conditions.
//!
//! A model description is loaded, an initial-condition table is mapped onto
//! its states, GKr is scaled point by point, and the APD after pre-pacing is
//! recorded. Two such branches are compared and plotted.

pub mod cli;
pub mod compare;
pub mod config;
pub mod error;
pub mod model;
pub mod plot;
pub mod protocol;
pub mod sim;
pub mod states;
pub mod sweep;

pub use error::{Error, Result};
