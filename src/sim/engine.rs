//! Adaptive Dormand–Prince 5(4) backend.
//!
//! Integration is split at every change of the pacing level, so the stepper
//! never straddles a stimulus edge and sees a constant `pace` per segment.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use ode_solvers::dop_shared::OutputType;
use ode_solvers::dopri5::*;
use ode_solvers::*;
use tracing::trace;

use super::{DataLog, Simulator, SimulatorFactory, Tolerance};
use crate::error::{Error, Result};
use crate::model::{Binding, Model, Slots};
use crate::protocol::Protocol;

/// Key of the time column when the model has no variable bound to time.
pub const DEFAULT_TIME_KEY: &str = "engine.time";

#[derive(Clone, Copy, Debug, Default)]
pub struct DormandPrince {
    pub tolerance: Tolerance,
    /// Wall-clock budget of one simulator, from construction onwards.
    pub timeout: Option<Duration>,
}

impl DormandPrince {
    pub fn new(tolerance: Tolerance) -> Self {
        Self {
            tolerance,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SimulatorFactory for DormandPrince {
    type Sim = CellSimulation;

    fn build(&self, model: &Model, protocol: &Protocol) -> Result<CellSimulation> {
        if !(self.tolerance.abs > 0.0 && self.tolerance.rel > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "solver tolerances must be positive, got {:?}",
                self.tolerance
            )));
        }
        Ok(CellSimulation {
            model: model.clone(),
            protocol: protocol.clone(),
            tolerance: self.tolerance,
            time: 0.0,
            state: model.state().to_vec(),
            deadline: self.timeout.map(|d| (Instant::now() + d, d)),
        })
    }
}

const MAX_STEPS_PER_SEGMENT: u32 = 100_000;

/// Output spacing and kind for one segment. Logged runs keep every accepted
/// step. Unlogged runs only need the segment's end state, so they use a dense
/// grid of two points: the start and a point a few ulps short of the end.
fn output_grid(t: f64, seg_end: f64, logged: bool) -> (f64, OutputType) {
    let dx = (seg_end - t) - 8.0 * f64::EPSILON * seg_end.abs().max(1.0);
    if logged || !(dx > 0.0) {
        (0.0, OutputType::Sparse)
    } else {
        (dx, OutputType::Dense)
    }
}

/// One model instance being paced forward in time.
#[derive(Clone, Debug)]
pub struct CellSimulation {
    model: Model,
    protocol: Protocol,
    tolerance: Tolerance,
    time: f64,
    state: Vec<f64>,
    deadline: Option<(Instant, Duration)>,
}

struct CellRhs<'a> {
    model: &'a Model,
    pace: f64,
    scratch: RefCell<Slots>,
}

impl System<f64, DVector<f64>> for CellRhs<'_> {
    fn system(&self, t: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        let mut values = self.scratch.borrow_mut();
        self.model.evaluate(t, self.pace, y.as_slice(), &mut values);
        self.model.derivatives(&values, dy.as_mut_slice());
    }
}

impl CellSimulation {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn time_key(&self) -> String {
        self.model
            .bound_variable(Binding::Time)
            .map(|v| v.qname().to_string())
            .unwrap_or_else(|| DEFAULT_TIME_KEY.to_string())
    }

    fn check_deadline(&self, t: f64) -> Result<()> {
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::SimulationTimeout {
                    time: t,
                    limit_secs: limit.as_secs_f64(),
                });
            }
        }
        Ok(())
    }

    /// Integrates from the current time for `duration`, optionally logging
    /// every accepted step. Returns the end time.
    fn advance(&mut self, duration: f64, mut log: Option<(&mut DataLog, &[usize])>) -> Result<f64> {
        if !(duration >= 0.0) || !duration.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "simulation duration must be a non-negative number, got {duration}"
            )));
        }
        let t_end = self.time + duration;
        let eps = 1e-9 * t_end.abs().max(1.0);
        let mut t = self.time;
        let mut values = self.model.slots();

        if let Some((log, slots)) = &mut log {
            self.model.evaluate(t, self.protocol.level_at(t), &self.state, &mut values);
            log.push(t, slots.iter().map(|&s| values.get(s)));
        }

        while t < t_end - eps {
            self.check_deadline(t)?;
            let seg_end = self
                .protocol
                .next_change(t)
                .map_or(t_end, |c| c.min(t_end));
            let pace = self.protocol.level_at(0.5 * (t + seg_end));
            let rhs = CellRhs {
                model: &self.model,
                pace,
                scratch: RefCell::new(self.model.slots()),
            };
            let y0 = DVector::from_column_slice(&self.state);
            let seg_len = seg_end - t;
            let (dx, out_type) = output_grid(t, seg_end, log.is_some());
            let mut stepper = Dopri5::from_param(
                rhs,
                t,
                seg_end,
                dx,
                y0,
                self.tolerance.rel,
                self.tolerance.abs,
                0.9,
                0.04,
                0.2,
                10.0,
                seg_len,
                0.0,
                MAX_STEPS_PER_SEGMENT,
                1000,
                out_type,
            );
            let stats = stepper.integrate().map_err(|e| Error::SimulationDivergence {
                time: t,
                message: format!("{e:?}"),
            })?;
            trace!(t, seg_end, pace, steps = stats.accepted_steps, "integrated segment");

            let (Some(&x_last), Some(y_last)) = (stepper.x_out().last(), stepper.y_out().last()) else {
                return Err(Error::SimulationDivergence {
                    time: t,
                    message: "stepper produced no output".to_string(),
                });
            };
            if (x_last - seg_end).abs() > 1e-6 * seg_len.max(1.0) {
                return Err(Error::SimulationDivergence {
                    time: x_last,
                    message: format!("integration stopped short of t = {seg_end}"),
                });
            }
            if let Some(i) = y_last.iter().position(|v| !v.is_finite()) {
                let name = self.model.state_names().nth(i).unwrap_or("?").to_string();
                return Err(Error::SimulationDivergence {
                    time: x_last,
                    message: format!("state {name} became non-finite"),
                });
            }

            if let Some((log, slots)) = &mut log {
                for (x, y) in stepper.x_out().iter().zip(stepper.y_out()) {
                    if log.last_time().is_some_and(|last| *x <= last) {
                        continue;
                    }
                    self.model.evaluate(*x, pace, y.as_slice(), &mut values);
                    log.push(*x, slots.iter().map(|&s| values.get(s)));
                }
            }

            self.state.copy_from_slice(y_last.as_slice());
            t = seg_end;
        }
        Ok(t_end)
    }
}

impl Simulator for CellSimulation {
    fn time(&self) -> f64 {
        self.time
    }

    fn state(&self) -> &[f64] {
        &self.state
    }

    fn pre(&mut self, duration: f64) -> Result<()> {
        self.advance(duration, None)?;
        Ok(())
    }

    fn run(&mut self, duration: f64, log: &[&str]) -> Result<DataLog> {
        let time_key = self.time_key();
        let keys: Vec<&str> = log.iter().copied().filter(|k| *k != time_key).collect();
        let mut data = DataLog::new(time_key, &keys);
        // slots follow the log's own (sorted) key order
        let slots = data
            .keys()
            .map(|k| {
                self.model.slot_of(k).ok_or_else(|| Error::UnknownVariable {
                    qname: k.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.time = self.advance(duration, Some((&mut data, &slots)))?;
        Ok(data)
    }
}
