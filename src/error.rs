//! Error kinds shared by the loader, mapper, engine and plotter.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("resource not found: {}", path.display())]
    ResourceNotFound { path: PathBuf },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {message}", path.display())]
    ModelDescription {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid initial-condition table {}: {message}", path.display())]
    InitialConditions { path: PathBuf, message: String },

    #[error("couldn't find variable {column:?} from {} in {}", states.display(), model.display())]
    UnresolvedStateColumn {
        column: String,
        states: PathBuf,
        model: PathBuf,
    },

    #[error("column {column:?} resolves to {qname}, which is not a state variable")]
    NotAStateVariable { column: String, qname: String },

    #[error("state {qname} is bound by both {first:?} and {second:?}")]
    DuplicateStateBinding {
        qname: String,
        first: String,
        second: String,
    },

    #[error("no variable carries the oxmeta tag {tag:?}")]
    UnresolvedTaggedVariable { tag: String },

    #[error("oxmeta tag {tag:?} is carried by several variables: {matches:?}")]
    AmbiguousTag { tag: String, matches: Vec<String> },

    #[error("unknown variable {qname}")]
    UnknownVariable { qname: String },

    #[error("{qname} is a state variable; use set_state instead")]
    StateNotSettable { qname: String },

    #[error("simulation diverged at t = {time}: {message}")]
    SimulationDivergence { time: f64, message: String },

    #[error("simulation exceeded its {limit_secs} s wall-clock limit at t = {time}")]
    SimulationTimeout { time: f64, limit_secs: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to render {}: {message}", path.display())]
    Plot { path: PathBuf, message: String },

    #[error("failed to write {}: {source}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Maps an I/O failure on `path` onto `ResourceNotFound` or `Io`.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::ResourceNotFound { path }
        } else {
            Error::Io { path, source }
        }
    }
}
