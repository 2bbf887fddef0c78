use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Time-indexed trace of selected model variables.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DataLog {
    time_key: String,
    time: Vec<f64>,
    columns: BTreeMap<String, Vec<f64>>,
}

/// Action potentials found in a trace: start times and durations, in log order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Apd {
    pub start: Vec<f64>,
    pub duration: Vec<f64>,
}

impl DataLog {
    pub fn new(time_key: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            time_key: time_key.into(),
            time: Vec::new(),
            columns: keys.iter().map(|k| (k.to_string(), Vec::new())).collect(),
        }
    }

    pub fn time_key(&self) -> &str {
        &self.time_key
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Column by variable name; the time column is available under its key.
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        if key == self.time_key {
            return Some(&self.time);
        }
        self.columns.get(key).map(Vec::as_slice)
    }

    /// Appends one sample; `row` holds the logged variables in key order.
    pub fn push(&mut self, t: f64, row: impl IntoIterator<Item = f64>) {
        self.time.push(t);
        let mut row = row.into_iter();
        for col in self.columns.values_mut() {
            col.push(row.next().unwrap_or(f64::NAN));
        }
    }

    pub fn last_time(&self) -> Option<f64> {
        self.time.last().copied()
    }

    /// Every completed action potential of `key` measured at `threshold`.
    ///
    /// An AP starts on an upward crossing and ends on the following downward
    /// crossing, both located by linear interpolation. A trace that begins
    /// above threshold ignores that first excursion, and an AP still in
    /// progress at the end of the log is not reported.
    pub fn apd(&self, key: &str, threshold: f64) -> Result<Apd> {
        let v = self.get(key).ok_or_else(|| Error::UnknownVariable {
            qname: key.to_string(),
        })?;
        let t = &self.time;
        let mut out = Apd::default();
        let Some(&v0) = v.first() else {
            return Ok(out);
        };
        let mut above = v0 > threshold;
        let mut start: Option<f64> = None;
        for i in 1..v.len() {
            let (v_prev, v_now) = (v[i - 1], v[i]);
            if !above && v_now > threshold {
                above = true;
                start = Some(crossing(t[i - 1], t[i], v_prev, v_now, threshold));
            } else if above && v_now <= threshold {
                above = false;
                if let Some(s) = start.take() {
                    let end = crossing(t[i - 1], t[i], v_prev, v_now, threshold);
                    out.start.push(s);
                    out.duration.push(end - s);
                }
            }
        }
        Ok(out)
    }
}

fn crossing(t0: f64, t1: f64, v0: f64, v1: f64, threshold: f64) -> f64 {
    if v1 == v0 {
        return t1;
    }
    t0 + (threshold - v0) * (t1 - t0) / (v1 - v0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(samples: &[(f64, f64)]) -> DataLog {
        let mut log = DataLog::new("engine.time", &["cell.V"]);
        for &(t, v) in samples {
            log.push(t, [v]);
        }
        log
    }

    #[test]
    fn interpolates_crossings() {
        let log = trace(&[(0.0, -80.0), (10.0, 20.0), (100.0, 20.0), (110.0, -80.0), (200.0, -80.0)]);
        let apd = log.apd("cell.V", -30.0).unwrap();
        assert_eq!(apd.start, vec![5.0]);
        assert_eq!(apd.duration, vec![100.0]);
    }

    #[test]
    fn skips_initial_and_unfinished_excursions() {
        let log = trace(&[
            (0.0, 10.0),
            (5.0, -80.0),
            (10.0, 10.0),
            (20.0, -80.0),
            (30.0, 10.0),
            (40.0, 10.0),
        ]);
        let apd = log.apd("cell.V", 0.0).unwrap();
        assert_eq!(apd.duration.len(), 1);
        assert!((apd.start[0] - (5.0 + 5.0 * 80.0 / 90.0)).abs() < 1e-12);
    }

    #[test]
    fn unknown_column_is_an_error() {
        let log = trace(&[(0.0, 1.0)]);
        assert!(matches!(log.apd("cell.x", 0.0), Err(Error::UnknownVariable { .. })));
        assert_eq!(log.get("engine.time"), Some(&[0.0][..]));
        assert!(DataLog::new("t", &["v"]).apd("v", 0.0).unwrap().duration.is_empty());
    }
}
