use clap::{Parser, Subcommand};

use crate::compare::ScaleSequence;
use crate::config::AppConfig;
use crate::sweep::StateCarry;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config TOML
    #[arg(long, default_value = "config.toml", global = true)]
    pub config: String,

    /// Directory the plots and summaries are written to
    #[arg(short = 'o', long, default_value = "output", global = true)]
    pub output_dir: String,

    /// Number of pacing periods simulated before measuring (overrides config)
    #[arg(short = 'p', long, global = true)]
    pub pre_paces: Option<u32>,

    /// Model description (.mmt) (overrides config)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Initial-condition tables, one per branch; `none` keeps the model defaults
    #[arg(long, num_args = 1..=2, global = true)]
    pub states: Option<Vec<String>>,

    /// Pacing period in ms; 0 keeps the model's protocol (overrides config)
    #[arg(long, global = true)]
    pub period: Option<f64>,

    /// Stem of the output file names (defaults to the model file stem)
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, default_value_t = false, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// APD against GKr scale, one curve per initial condition
    Sweep {
        /// Scale sequence per branch, `start:stop:count,...` (overrides config)
        #[arg(long, value_name = "START:STOP:COUNT,...")]
        scales: Vec<ScaleSequence>,

        /// Start every point from the previous point's end state
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        carry_forward: Option<bool>,

        /// Run the branches on separate threads (overrides config)
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        parallel: Option<bool>,
    },
    /// APD against pace index with GKr partially blocked
    Trajectory {
        /// Fraction of GKr removed, 0..=1 (overrides config)
        #[arg(long)]
        block: Option<f64>,

        /// Number of logged pacing periods (overrides config)
        #[arg(long)]
        measured_paces: Option<u32>,

        /// Run the branches on separate threads (overrides config)
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        parallel: Option<bool>,
    },
}

impl Args {
    /// Writes every flag that was given over the file configuration.
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(pre_paces) = self.pre_paces {
            cfg.simulation.pre_paces = pre_paces;
        }
        if let Some(model) = &self.model {
            cfg.input.model = model.clone();
        }
        if let Some(states) = &self.states {
            cfg.input.states = states.clone();
        }
        if let Some(period) = self.period {
            cfg.simulation.period = period;
        }
        match &self.command {
            Command::Sweep {
                scales,
                carry_forward,
                parallel,
            } => {
                if !scales.is_empty() {
                    cfg.sweep.scales = scales.clone();
                }
                if let Some(carry) = carry_forward {
                    cfg.sweep.state_carry = if *carry {
                        StateCarry::CarryForward
                    } else {
                        StateCarry::Reset
                    };
                }
                if let Some(parallel) = parallel {
                    cfg.sweep.parallel = *parallel;
                }
            }
            Command::Trajectory {
                block,
                measured_paces,
                parallel,
            } => {
                if let Some(block) = block {
                    cfg.trajectory.block = *block;
                }
                if let Some(paces) = measured_paces {
                    cfg.trajectory.measured_paces = *paces;
                }
                if let Some(parallel) = parallel {
                    cfg.sweep.parallel = *parallel;
                }
            }
        }
    }
}
