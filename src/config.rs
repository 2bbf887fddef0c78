use crate::compare::ScaleSequence;
use crate::sim::Tolerance;
use crate::sweep::{PacingPlan, StateCarry, Tags};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "SimulationConfig::default_tolerance")]
    pub abs_tolerance: f64,
    #[serde(default = "SimulationConfig::default_tolerance")]
    pub rel_tolerance: f64,
    /// Pacing period in ms; 0 keeps the protocol stored with the model.
    #[serde(default = "SimulationConfig::default_period")]
    pub period: f64,
    #[serde(default = "SimulationConfig::default_level_multiplier")]
    pub level_multiplier: f64,
    #[serde(default = "SimulationConfig::default_pre_paces")]
    pub pre_paces: u32,
    #[serde(default = "SimulationConfig::default_measured_paces")]
    pub measured_paces: u32,
    #[serde(default = "SimulationConfig::default_threshold_fraction")]
    pub threshold_fraction: f64,
    /// Wall-clock limit per simulator in seconds; 0 disables it.
    #[serde(default)]
    pub point_timeout_secs: f64,
}

impl SimulationConfig {
    fn default_tolerance() -> f64 {
        1e-8
    }
    fn default_period() -> f64 {
        1000.0
    }
    fn default_level_multiplier() -> f64 {
        2.0
    }
    fn default_pre_paces() -> u32 {
        1000
    }
    fn default_measured_paces() -> u32 {
        1
    }
    fn default_threshold_fraction() -> f64 {
        0.9
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            abs: self.abs_tolerance,
            rel: self.rel_tolerance,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.point_timeout_secs > 0.0).then(|| Duration::from_secs_f64(self.point_timeout_secs))
    }

    pub fn pacing_plan(&self) -> PacingPlan {
        PacingPlan {
            period: (self.period > 0.0).then_some(self.period),
            level_multiplier: self.level_multiplier,
            pre_paces: self.pre_paces,
            measured_paces: self.measured_paces,
            threshold_fraction: self.threshold_fraction,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: Self::default_tolerance(),
            rel_tolerance: Self::default_tolerance(),
            period: Self::default_period(),
            level_multiplier: Self::default_level_multiplier(),
            pre_paces: Self::default_pre_paces(),
            measured_paces: Self::default_measured_paces(),
            threshold_fraction: Self::default_threshold_fraction(),
            point_timeout_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "InputConfig::default_model")]
    pub model: String,
    /// One entry per branch; `"none"` keeps the model's own initial state.
    #[serde(default = "InputConfig::default_states")]
    pub states: Vec<String>,
}

impl InputConfig {
    fn default_model() -> String {
        "demos/mitchell_schaeffer.mmt".to_string()
    }
    fn default_states() -> Vec<String> {
        vec![
            "demos/long_ap_state.dat".to_string(),
            "demos/short_ap_state.dat".to_string(),
        ]
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            states: Self::default_states(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub state_carry: StateCarry,
    /// Run the branches on separate threads.
    #[serde(default)]
    pub parallel: bool,
    /// Scale sequence of each branch, in the same order as the state files.
    #[serde(default = "SweepConfig::default_scales")]
    pub scales: Vec<ScaleSequence>,
}

impl SweepConfig {
    fn default_scales() -> Vec<ScaleSequence> {
        ["0.75:0.6:10,0.6:0.525:100,0.525:0.35:20", "0.35:0.425:10,0.425:0.5:100,0.5:0.75:25"]
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            state_carry: StateCarry::default(),
            parallel: false,
            scales: Self::default_scales(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    /// Fraction of GKr removed.
    #[serde(default = "TrajectoryConfig::default_block")]
    pub block: f64,
    /// Paces recorded after pre-pacing, one APD each.
    #[serde(default = "TrajectoryConfig::default_measured_paces")]
    pub measured_paces: u32,
}

impl TrajectoryConfig {
    fn default_block() -> f64 {
        0.5
    }
    fn default_measured_paces() -> u32 {
        5000
    }
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            block: Self::default_block(),
            measured_paces: Self::default_measured_paces(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlotFormat {
    #[default]
    Png,
    Svg,
}

impl PlotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    #[serde(default = "PlotConfig::default_width")]
    pub width: u32,
    #[serde(default = "PlotConfig::default_height")]
    pub height: u32,
    #[serde(default)]
    pub format: PlotFormat,
}

impl PlotConfig {
    fn default_width() -> u32 {
        1200
    }
    fn default_height() -> u32 {
        700
    }
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            format: PlotFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
    #[serde(default)]
    pub plot: PlotConfig,
}

impl AppConfig {
    /// Reads `path`, or writes the defaults there as commented-out lines
    /// when it does not exist yet. A file that exists but cannot be read or
    /// parsed is an `InvalidConfig` error and is left untouched.
    pub fn load_or_default(path: &str) -> Result<Self> {
        let path_obj = Path::new(path);
        if path_obj.exists() {
            let contents = fs::read_to_string(path_obj)
                .map_err(|err| Error::InvalidConfig(format!("failed to read config {path}: {err}")))?;
            return toml::from_str(&contents)
                .map_err(|err| Error::InvalidConfig(format!("failed to parse config {path}: {err}")));
        }

        let default_cfg = Self::default();
        match toml::to_string_pretty(&default_cfg) {
            Ok(text) => match fs::write(path_obj, Self::commented(&text)) {
                Ok(()) => info!("Wrote default config to {path}"),
                Err(err) => warn!("Failed to write default config to {path}: {err}"),
            },
            Err(err) => warn!("Failed to serialize default config: {err}; continuing with defaults"),
        }
        Ok(default_cfg)
    }

    /// Keeps section headers, comments out every other line.
    fn commented(text: &str) -> String {
        let mut commented = String::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                commented.push('\n');
            } else if trimmed.starts_with('[') && trimmed.ends_with(']') && !trimmed.contains('"') {
                commented.push_str(line);
                commented.push('\n');
            } else {
                commented.push_str("# ");
                commented.push_str(line);
                commented.push('\n');
            }
        }
        commented
    }
}
