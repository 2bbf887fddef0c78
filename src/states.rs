//! Initial-condition tables and their mapping onto model states.
//!
//! A table is whitespace-delimited: one header row of column names and
//! exactly one row of values. Column names either encode a qualified
//! variable name with `__` in place of `.` (`membrane__V`) or carry an
//! oxmeta tag (`analytic_voltage`).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Model;

#[derive(Clone, Debug, PartialEq)]
pub struct InitialConditionRecord {
    path: PathBuf,
    columns: Vec<(String, f64)>,
}

impl InitialConditionRecord {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::from_io(path, e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bad = |message: String| Error::InitialConditions {
            path: path.clone(),
            message,
        };
        let mut rows = text.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<&str> = rows
            .next()
            .ok_or_else(|| bad("file is empty".to_string()))?
            .split_whitespace()
            .collect();
        let values: Vec<&str> = rows
            .next()
            .ok_or_else(|| bad("no data row".to_string()))?
            .split_whitespace()
            .collect();
        let extra = rows.count();
        if extra > 0 {
            return Err(bad(format!("expected exactly one data row, found {}", extra + 1)));
        }
        if header.len() != values.len() {
            return Err(bad(format!(
                "{} columns in header but {} values",
                header.len(),
                values.len()
            )));
        }
        let mut columns: Vec<(String, f64)> = Vec::with_capacity(header.len());
        for (name, raw) in header.iter().zip(&values) {
            if columns.iter().any(|(n, _)| n == name) {
                return Err(bad(format!("duplicate column {name}")));
            }
            let value = raw
                .parse::<f64>()
                .map_err(|_| bad(format!("column {name}: {raw:?} is not a number")))?;
            columns.push((name.to_string(), value));
        }
        Ok(Self { path, columns })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Columns in file order.
    pub fn columns(&self) -> &[(String, f64)] {
        &self.columns
    }
}

/// How a column was matched to a state variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// `__` replaced by `.` named a variable directly.
    Direct,
    /// The untransformed column name matched an oxmeta tag.
    Tag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub column: String,
    pub qname: String,
    pub value: f64,
    pub resolution: Resolution,
}

/// Values for (a subset of) a model's states, keyed by qualified name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateAssignment {
    bindings: Vec<Binding>,
}

impl StateAssignment {
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn get(&self, qname: &str) -> Option<f64> {
        self.bindings
            .iter()
            .find(|b| b.qname == qname)
            .map(|b| b.value)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The model's state vector with every bound state overwritten.
    pub fn state_vector(&self, model: &Model) -> Result<Vec<f64>> {
        let mut state = model.state().to_vec();
        for b in &self.bindings {
            let i = model.state_index(&b.qname).ok_or_else(|| Error::NotAStateVariable {
                column: b.column.clone(),
                qname: b.qname.clone(),
            })?;
            state[i] = b.value;
        }
        Ok(state)
    }

    /// Makes this assignment the model's current state.
    pub fn apply(&self, model: &mut Model) -> Result<()> {
        let state = self.state_vector(model)?;
        model.set_state(&state)
    }
}

/// `membrane__V` → `membrane.V`.
pub fn column_to_qname(column: &str) -> String {
    column.replace("__", ".")
}

/// Resolves every column of `record` against `model`.
///
/// The transformed name is always tried first; only when no variable has
/// that qualified name is the raw column looked up as an oxmeta tag. Any
/// column that resolves to nothing fails the whole mapping.
pub fn map_to_state(record: &InitialConditionRecord, model: &Model) -> Result<StateAssignment> {
    let mut bindings: Vec<Binding> = Vec::with_capacity(record.columns().len());
    for (column, value) in record.columns() {
        let candidate = column_to_qname(column);
        let (qname, resolution) = match model.variables(false).find(|v| v.qname() == candidate) {
            Some(var) => (var.qname().to_string(), Resolution::Direct),
            None => match model.find_by_tag(column, false) {
                Ok(qname) => (qname.to_string(), Resolution::Tag),
                Err(Error::UnresolvedTaggedVariable { .. }) => {
                    return Err(Error::UnresolvedStateColumn {
                        column: column.clone(),
                        states: record.path().to_path_buf(),
                        model: model.source().to_path_buf(),
                    });
                }
                Err(e) => return Err(e),
            },
        };
        if model.state_index(&qname).is_none() {
            return Err(Error::NotAStateVariable {
                column: column.clone(),
                qname,
            });
        }
        if let Some(prev) = bindings.iter().find(|b| b.qname == qname) {
            return Err(Error::DuplicateStateBinding {
                qname,
                first: prev.column.clone(),
                second: column.clone(),
            });
        }
        debug!(column = %column, qname = %qname, ?resolution, value, "mapped state column");
        bindings.push(Binding {
            column: column.clone(),
            qname,
            value: *value,
            resolution,
        });
    }
    Ok(StateAssignment { bindings })
}
