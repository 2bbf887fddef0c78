//! GKr sweeps: pre-pace, measure, extract the APD.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{self, Model};
use crate::protocol::Protocol;
use crate::sim::{Simulator, SimulatorFactory};
use crate::states::{self, InitialConditionRecord};

/// Where each sweep point starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateCarry {
    /// Every point starts from the initial state assignment.
    #[default]
    Reset,
    /// Every point starts from the end state of the previous point.
    CarryForward,
}

/// Tags used to locate the measured and the scaled variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tags {
    pub voltage: String,
    pub gkr: String,
}

impl Default for Tags {
    fn default() -> Self {
        Self {
            voltage: "analytic_voltage".to_string(),
            gkr: "membrane_rapid_delayed_rectifier_potassium_current_conductance".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PacingPlan {
    /// Pacing period; `None` keeps the model's own protocol.
    pub period: Option<f64>,
    /// Stimulus level factor applied when the protocol is rebuilt.
    pub level_multiplier: f64,
    pub pre_paces: u32,
    pub measured_paces: u32,
    pub threshold_fraction: f64,
}

impl Default for PacingPlan {
    fn default() -> Self {
        Self {
            period: Some(1000.0),
            level_multiplier: 2.0,
            pre_paces: 1000,
            measured_paces: 1,
            threshold_fraction: 0.9,
        }
    }
}

/// A loaded, state-initialised model with its variables resolved.
#[derive(Clone, Debug)]
pub struct SweepSetup {
    pub model: Model,
    pub protocol: Protocol,
    pub period: f64,
    pub voltage: String,
    pub gkr: String,
}

impl SweepSetup {
    /// Loads `model_path`, applies the optional initial-condition table and
    /// resolves both tagged variables. Every failure happens here, before
    /// any simulator exists.
    pub fn prepare(
        model_path: &Path,
        states_path: Option<&Path>,
        tags: &Tags,
        plan: &PacingPlan,
    ) -> Result<Self> {
        let (mut model, protocol, _script) = model::load(model_path)?;
        if let Some(states_path) = states_path {
            let record = InitialConditionRecord::read(states_path)?;
            let assignment = states::map_to_state(&record, &model)?;
            assignment.apply(&mut model)?;
            info!(
                states = %states_path.display(),
                bound = assignment.len(),
                "applied initial conditions"
            );
        }
        let voltage = model.find_by_tag(&tags.voltage, true)?.to_string();
        let gkr = model.find_by_tag(&tags.gkr, true)?.to_string();
        debug!(voltage = %voltage, gkr = %gkr, "resolved tagged variables");
        Self::from_parts(model, protocol, voltage, gkr, plan)
    }

    /// Uses an already prepared model; retimes `protocol` when the plan
    /// carries a period.
    pub fn from_parts(
        model: Model,
        protocol: Protocol,
        voltage: String,
        gkr: String,
        plan: &PacingPlan,
    ) -> Result<Self> {
        for qname in [&voltage, &gkr] {
            if model.get(qname).is_none() {
                return Err(Error::UnknownVariable {
                    qname: qname.clone(),
                });
            }
        }
        let (protocol, period) = match plan.period {
            Some(period) => (protocol.retimed(period, plan.level_multiplier)?, period),
            None => {
                let period = protocol.head().map_or(0.0, |e| e.period);
                (protocol, period)
            }
        };
        if !(period > 0.0) {
            return Err(Error::InvalidConfig(
                "no pacing period configured and the model protocol is not periodic".to_string(),
            ));
        }
        Ok(Self {
            model,
            protocol,
            period,
            voltage,
            gkr,
        })
    }

    /// APD threshold: a fixed fraction of the voltage in the initial state.
    pub fn threshold(&self, plan: &PacingPlan) -> Result<f64> {
        Ok(plan.threshold_fraction * self.model.eval(&self.voltage)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SweepPoint {
    pub scale: f64,
    /// First completed APD of the measured window, NaN when there was none.
    pub apd: f64,
}

#[derive(Debug)]
pub struct SweepOutcome<S> {
    pub points: Vec<SweepPoint>,
    pub baseline_gkr: f64,
    pub threshold: f64,
    /// Simulator of the final point, for plotting its trace.
    pub last: Option<S>,
}

fn validate(plan: &PacingPlan) -> Result<()> {
    if plan.measured_paces == 0 {
        return Err(Error::InvalidConfig("measured_paces must be at least 1".to_string()));
    }
    if !plan.threshold_fraction.is_finite() {
        return Err(Error::InvalidConfig("threshold_fraction must be finite".to_string()));
    }
    Ok(())
}

/// Runs one simulation per scale factor, in order.
///
/// GKr is always `baseline × scale` with the baseline read once from the
/// prepared model. Each point works on its own copy of the model.
pub fn run_sweep<F: SimulatorFactory>(
    factory: &F,
    setup: &SweepSetup,
    plan: &PacingPlan,
    carry: StateCarry,
    scales: &[f64],
) -> Result<SweepOutcome<F::Sim>> {
    validate(plan)?;
    if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
        return Err(Error::InvalidConfig(format!(
            "scale factors must be finite and non-negative, got {bad}"
        )));
    }
    let baseline = setup.model.eval(&setup.gkr)?;
    let threshold = setup.threshold(plan)?;
    let mut start_state = setup.model.state().to_vec();
    let mut points = Vec::with_capacity(scales.len());
    let mut last = None;
    info!(
        gkr = %setup.gkr,
        baseline,
        threshold,
        points = scales.len(),
        ?carry,
        "starting sweep"
    );

    for (i, &scale) in scales.iter().enumerate() {
        let mut point_model = setup.model.clone();
        point_model.set_value(&setup.gkr, baseline * scale)?;
        point_model.set_state(&start_state)?;

        let mut sim = factory.build(&point_model, &setup.protocol)?;
        sim.pre(setup.period * f64::from(plan.pre_paces))?;
        let log = sim.run(
            setup.period * f64::from(plan.measured_paces),
            &[setup.voltage.as_str()],
        )?;
        let apd = match log.apd(&setup.voltage, threshold)?.duration.first() {
            Some(&d) => d,
            None => {
                warn!(scale, "no complete action potential in the measured window");
                f64::NAN
            }
        };
        info!(index = i, scale, gkr = baseline * scale, apd, "sweep point");

        if carry == StateCarry::CarryForward {
            start_state = sim.state().to_vec();
        }
        points.push(SweepPoint { scale, apd });
        last = Some(sim);
    }

    Ok(SweepOutcome {
        points,
        baseline_gkr: baseline,
        threshold,
        last,
    })
}

#[derive(Debug)]
pub struct Trajectory<S> {
    pub block: f64,
    /// Every completed APD of the measured window, in pace order.
    pub apds: Vec<f64>,
    pub threshold: f64,
    /// The simulator after the measured window; it can be run further.
    pub sim: S,
}

/// Single long run with GKr reduced to `baseline × (1 − block)`.
pub fn run_trajectory<F: SimulatorFactory>(
    factory: &F,
    setup: &SweepSetup,
    plan: &PacingPlan,
    block: f64,
) -> Result<Trajectory<F::Sim>> {
    validate(plan)?;
    if !(0.0..=1.0).contains(&block) {
        return Err(Error::InvalidConfig(format!("block must lie in [0, 1], got {block}")));
    }
    let baseline = setup.model.eval(&setup.gkr)?;
    let threshold = setup.threshold(plan)?;
    let mut model = setup.model.clone();
    model.set_value(&setup.gkr, baseline * (1.0 - block))?;

    let mut sim = factory.build(&model, &setup.protocol)?;
    sim.pre(setup.period * f64::from(plan.pre_paces))?;
    let log = sim.run(
        setup.period * f64::from(plan.measured_paces),
        &[setup.voltage.as_str()],
    )?;
    let apds = log.apd(&setup.voltage, threshold)?.duration;
    info!(block, threshold, action_potentials = apds.len(), "trajectory finished");
    Ok(Trajectory {
        block,
        apds,
        threshold,
        sim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::DataLog;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const MODEL: &str = "\
[[model]]
name: stub
membrane.V = -80

[engine]
time = 0
    bind time

[membrane]
dot(V) = 0
    oxmeta: analytic_voltage
gkr = 10
    oxmeta: membrane_rapid_delayed_rectifier_potassium_current_conductance

[[protocol]]
1 0 2 1000 0
";

    /// Produces a square AP whose duration is `1000 / gkr` and records the
    /// parameter and state each simulator was built with.
    #[derive(Default)]
    struct Recording {
        builds: AtomicUsize,
        seen: Mutex<Vec<(f64, f64)>>,
    }

    struct SquareAp {
        gkr: f64,
        state: Vec<f64>,
        time: f64,
    }

    impl Simulator for SquareAp {
        fn time(&self) -> f64 {
            self.time
        }
        fn state(&self) -> &[f64] {
            &self.state
        }
        fn pre(&mut self, _duration: f64) -> Result<()> {
            self.state[0] += 1.0;
            Ok(())
        }
        fn run(&mut self, duration: f64, log: &[&str]) -> Result<DataLog> {
            let mut data = DataLog::new("engine.time", log);
            let apd = 1000.0 / self.gkr;
            for (t, v) in [(0.0, -80.0), (1.0, 20.0), (1.0 + apd, 20.0), (2.0 + apd, -80.0), (duration, -80.0)] {
                data.push(self.time + t, [v]);
            }
            self.time += duration;
            Ok(data)
        }
    }

    impl SimulatorFactory for Recording {
        type Sim = SquareAp;
        fn build(&self, model: &Model, _protocol: &Protocol) -> Result<SquareAp> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let gkr = model.eval("membrane.gkr")?;
            self.seen.lock().unwrap().push((gkr, model.state()[0]));
            Ok(SquareAp {
                gkr,
                state: model.state().to_vec(),
                time: 0.0,
            })
        }
    }

    fn setup() -> SweepSetup {
        let (model, protocol, _) =
            crate::model::mmt::parse(MODEL, Path::new("stub.mmt")).unwrap();
        SweepSetup::from_parts(
            model,
            protocol,
            "membrane.V".to_string(),
            "membrane.gkr".to_string(),
            &PacingPlan::default(),
        )
        .unwrap()
    }

    #[test]
    fn preserves_order_and_scales_from_one_baseline() {
        let factory = Recording::default();
        let scales = [0.5, 1.5, 1.0, 1.0];
        let out = run_sweep(&factory, &setup(), &PacingPlan::default(), StateCarry::Reset, &scales).unwrap();
        assert_eq!(out.points.len(), 4);
        assert_eq!(out.points.iter().map(|p| p.scale).collect::<Vec<_>>(), scales);
        assert_eq!(out.baseline_gkr, 10.0);
        assert!((out.threshold - (-72.0)).abs() < 1e-12);
        let gkrs: Vec<f64> = factory.seen.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(gkrs, vec![5.0, 15.0, 10.0, 10.0]);
        // APD shrinks as GKr grows; scale 1.0 reproduces the unscaled value
        assert!(out.points[0].apd > out.points[2].apd);
        assert!(out.points[2].apd > out.points[1].apd);
        assert_eq!(out.points[2].apd, out.points[3].apd);
        assert!(out.last.is_some());
    }

    #[test]
    fn reset_and_carry_forward_start_states() {
        let factory = Recording::default();
        run_sweep(&factory, &setup(), &PacingPlan::default(), StateCarry::Reset, &[1.0, 1.0, 1.0]).unwrap();
        let starts: Vec<f64> = factory.seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(starts, vec![-80.0, -80.0, -80.0]);

        let factory = Recording::default();
        run_sweep(&factory, &setup(), &PacingPlan::default(), StateCarry::CarryForward, &[1.0, 1.0, 1.0]).unwrap();
        let starts: Vec<f64> = factory.seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(starts, vec![-80.0, -79.0, -78.0]);
    }

    #[test]
    fn missing_ap_records_nan() {
        let factory = Recording::default();
        let plan = PacingPlan {
            threshold_fraction: -1.0,
            ..PacingPlan::default()
        };
        // threshold of +80 mV is never crossed
        let out = run_sweep(&factory, &setup(), &plan, StateCarry::Reset, &[1.0]).unwrap();
        assert!(out.points[0].apd.is_nan());
    }

    #[test]
    fn trajectory_applies_block() {
        let factory = Recording::default();
        let traj = run_trajectory(&factory, &setup(), &PacingPlan::default(), 0.5).unwrap();
        assert_eq!(factory.seen.lock().unwrap()[0].0, 5.0);
        // square AP of 200 ms plus the two 1 ms ramps cut at -72 mV
        assert_eq!(traj.apds.len(), 1);
        assert!((traj.apds[0] - 201.84).abs() < 1e-9);
        assert!(run_trajectory(&factory, &setup(), &PacingPlan::default(), 1.5).is_err());
    }

    #[test]
    fn invalid_inputs_fail_before_building() {
        let factory = Recording::default();
        assert!(run_sweep(&factory, &setup(), &PacingPlan::default(), StateCarry::Reset, &[f64::NAN]).is_err());
        let plan = PacingPlan {
            measured_paces: 0,
            ..PacingPlan::default()
        };
        assert!(run_sweep(&factory, &setup(), &plan, StateCarry::Reset, &[1.0]).is_err());
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn protocol_is_retimed_only_with_a_period() {
        let s = setup();
        let head = s.protocol.head().unwrap();
        assert_eq!((head.period, head.level, head.duration), (1000.0, 2.0, 2.0));

        let (model, protocol, _) =
            crate::model::mmt::parse(MODEL, Path::new("stub.mmt")).unwrap();
        let plan = PacingPlan {
            period: None,
            ..PacingPlan::default()
        };
        let kept = SweepSetup::from_parts(model, protocol, "membrane.V".into(), "membrane.gkr".into(), &plan).unwrap();
        assert_eq!(kept.protocol.head().unwrap().level, 1.0);
        assert_eq!(kept.period, 1000.0);
    }
}
