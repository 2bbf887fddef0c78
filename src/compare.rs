//! Two-branch comparisons: the same model from two initial conditions.
//!
//! Branches share nothing but the simulator factory; each prepares its own
//! model and protocol. With `parallel` set they run on worker threads and
//! report back over a channel.

use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::sim::{DataLog, Simulator, SimulatorFactory};
use crate::sweep::{self, PacingPlan, StateCarry, SweepPoint, SweepSetup, Tags};

/// `n` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub stop: f64,
    pub count: usize,
}

/// Concatenated `linspace` segments, written `start:stop:count,...`.
/// Segment boundaries are repeated, not merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScaleSequence(pub Vec<Segment>);

impl ScaleSequence {
    pub fn values(&self) -> Vec<f64> {
        self.0
            .iter()
            .flat_map(|s| linspace(s.start, s.stop, s.count))
            .collect()
    }
}

impl FromStr for ScaleSequence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |part: &str| {
            Error::InvalidConfig(format!(
                "bad scale segment {part:?}, expected start:stop:count or a single value"
            ))
        };
        let mut segments = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = part.split(':').map(str::trim).collect();
            let segment = match fields.as_slice() {
                [v] => {
                    let v = v.parse().map_err(|_| bad(part))?;
                    Segment {
                        start: v,
                        stop: v,
                        count: 1,
                    }
                }
                [a, b, n] => Segment {
                    start: a.parse().map_err(|_| bad(part))?,
                    stop: b.parse().map_err(|_| bad(part))?,
                    count: n.parse().map_err(|_| bad(part))?,
                },
                _ => return Err(bad(part)),
            };
            segments.push(segment);
        }
        Ok(Self(segments))
    }
}

impl TryFrom<String> for ScaleSequence {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ScaleSequence> for String {
    fn from(seq: ScaleSequence) -> Self {
        seq.to_string()
    }
}

impl fmt::Display for ScaleSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}:{}", s.start, s.stop, s.count)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    pub label: String,
    pub model: PathBuf,
    /// Initial-condition table; `None` keeps the model defaults.
    pub states: Option<PathBuf>,
    pub scales: Vec<f64>,
}

impl Branch {
    pub fn new(model: impl Into<PathBuf>, states: Option<PathBuf>, scales: Vec<f64>) -> Self {
        let label = default_label(states.as_deref());
        Self {
            label,
            model: model.into(),
            states,
            scales,
        }
    }
}

pub fn default_label(states: Option<&Path>) -> String {
    match states.and_then(Path::file_stem) {
        Some(stem) => format!("initially using {}", stem.to_string_lossy()),
        None => "initially using default initial conditions".to_string(),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BranchSweep {
    pub label: String,
    pub states: Option<PathBuf>,
    pub gkr: String,
    pub baseline_gkr: f64,
    pub threshold: f64,
    pub points: Vec<SweepPoint>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BranchTrajectory {
    pub label: String,
    pub states: Option<PathBuf>,
    pub block: f64,
    pub threshold: f64,
    pub period: f64,
    pub voltage: String,
    /// APD of every completed pace in the measured window.
    pub apds: Vec<f64>,
    /// One further period after the measured window.
    #[serde(skip)]
    pub final_trace: DataLog,
}

/// Runs `job` for every branch, on worker threads when `parallel`.
/// Results come back in branch order; the first error wins.
fn for_each_branch<T, J>(branches: &[Branch], parallel: bool, job: J) -> Result<Vec<T>>
where
    T: Send,
    J: Fn(&Branch) -> Result<T> + Sync,
{
    if !parallel || branches.len() < 2 {
        return branches.iter().map(&job).collect();
    }
    let (tx, rx) = unbounded::<(usize, Result<T>)>();
    thread::scope(|scope| -> Result<()> {
        for (i, branch) in branches.iter().enumerate() {
            let tx = tx.clone();
            let job = &job;
            thread::Builder::new()
                .name(format!("branch-{i}"))
                .spawn_scoped(scope, move || {
                    // the receiver outlives the scope, so this cannot fail
                    let _ = tx.send((i, job(branch)));
                })
                .map_err(|e| Error::from_io("branch worker", e))?;
        }
        Ok(())
    })?;
    drop(tx);
    let mut results: Vec<(usize, Result<T>)> = rx.iter().collect();
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

/// Sweeps GKr on every branch.
pub fn compare_sweeps<F: SimulatorFactory>(
    factory: &F,
    branches: &[Branch],
    tags: &Tags,
    plan: &PacingPlan,
    carry: StateCarry,
    parallel: bool,
) -> Result<Vec<BranchSweep>> {
    for_each_branch(branches, parallel, |branch| {
        info!(branch = %branch.label, model = %branch.model.display(), "preparing sweep branch");
        let setup = SweepSetup::prepare(&branch.model, branch.states.as_deref(), tags, plan)?;
        let outcome = sweep::run_sweep(factory, &setup, plan, carry, &branch.scales)?;
        Ok(BranchSweep {
            label: branch.label.clone(),
            states: branch.states.clone(),
            gkr: setup.gkr.clone(),
            baseline_gkr: outcome.baseline_gkr,
            threshold: outcome.threshold,
            points: outcome.points,
        })
    })
}

/// Runs the reduced-GKr trajectory on every branch, then one more
/// `period − 1` of pacing to capture the final action potential.
pub fn compare_trajectories<F: SimulatorFactory>(
    factory: &F,
    branches: &[Branch],
    tags: &Tags,
    plan: &PacingPlan,
    block: f64,
    parallel: bool,
) -> Result<Vec<BranchTrajectory>> {
    for_each_branch(branches, parallel, |branch| {
        info!(branch = %branch.label, block, "preparing trajectory branch");
        let setup = SweepSetup::prepare(&branch.model, branch.states.as_deref(), tags, plan)?;
        let mut traj = sweep::run_trajectory(factory, &setup, plan, block)?;
        let final_trace = traj
            .sim
            .run((setup.period - 1.0).max(0.0), &[setup.voltage.as_str()])?;
        Ok(BranchTrajectory {
            label: branch.label.clone(),
            states: branch.states.clone(),
            block,
            threshold: traj.threshold,
            period: setup.period,
            voltage: setup.voltage.clone(),
            apds: traj.apds,
            final_trace,
        })
    })
}

/// Pretty-printed JSON summary next to the plots.
pub fn write_report<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::from_io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| Error::from_io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value).map_err(|source| Error::Report {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "wrote summary");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_matches_numpy_endpoints() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(0.75, 0.6, 1), vec![0.75]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        let down = linspace(0.6, 0.525, 100);
        assert_eq!(down.len(), 100);
        assert_eq!(down[99], 0.525);
        assert!(down.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn scale_sequences_concatenate_in_order() {
        let seq: ScaleSequence = "0.75:0.6:10, 0.6:0.525:100,0.525:0.35:20".parse().unwrap();
        let values = seq.values();
        assert_eq!(values.len(), 130);
        assert_eq!(values[0], 0.75);
        assert_eq!(values[9], 0.6);
        assert_eq!(values[10], 0.6);
        assert_eq!(values[129], 0.35);
        assert_eq!(seq.to_string().parse::<ScaleSequence>().unwrap(), seq);

        let single: ScaleSequence = "1.0".parse().unwrap();
        assert_eq!(single.values(), vec![1.0]);
        assert!("1:2".parse::<ScaleSequence>().is_err());
        assert!("a:b:c".parse::<ScaleSequence>().is_err());
    }

    #[test]
    fn scale_sequences_read_from_toml_strings() {
        #[derive(Deserialize)]
        struct Holder {
            scales: ScaleSequence,
        }
        let h: Holder = toml::from_str("scales = \"0.5:1:2\"").unwrap();
        assert_eq!(h.scales.values(), vec![0.5, 1.0]);
        assert!(toml::from_str::<Holder>("scales = \"0.5:1\"").is_err());
    }

    #[test]
    fn report_is_json_with_nan_as_null() {
        let dir = std::env::temp_dir().join(format!(
            "apd_bifurcation_report_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path = dir.join("nested").join("demo_sweep.json");
        let points = vec![
            SweepPoint { scale: 1.0, apd: 250.0 },
            SweepPoint { scale: 0.5, apd: f64::NAN },
        ];
        write_report(&path, &points).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["apd"], 250.0);
        assert!(value[1]["apd"].is_null());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn labels_follow_state_files() {
        assert_eq!(
            default_label(Some(Path::new("data/decker_EAD_steadystate.dat"))),
            "initially using decker_EAD_steadystate"
        );
        assert_eq!(default_label(None), "initially using default initial conditions");
    }

    #[test]
    fn branches_keep_order_when_parallel() {
        let branches: Vec<Branch> = (0..4)
            .map(|i| Branch::new(format!("m{i}.mmt"), None, vec![i as f64]))
            .collect();
        let out = for_each_branch(&branches, true, |b| Ok(b.scales[0])).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);

        let err = for_each_branch(&branches, true, |b| {
            if b.scales[0] == 2.0 {
                Err(Error::InvalidConfig("boom".into()))
            } else {
                Ok(())
            }
        });
        assert!(err.is_err());
    }
}
