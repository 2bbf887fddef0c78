use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use apd_bifurcation::compare::{self, Branch};
use apd_bifurcation::model::Model;
use apd_bifurcation::protocol::Protocol;
use apd_bifurcation::sim::engine::CellSimulation;
use apd_bifurcation::sim::{DormandPrince, SimulatorFactory, Tolerance};
use apd_bifurcation::sweep::{PacingPlan, StateCarry, Tags};
use apd_bifurcation::{Error, Result};

fn unique_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "apd_bifurcation_state_mapping_{}_{}",
        name,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    path
}

struct Counting {
    inner: DormandPrince,
    builds: AtomicUsize,
}

impl SimulatorFactory for Counting {
    type Sim = CellSimulation;

    fn build(&self, model: &Model, protocol: &Protocol) -> Result<CellSimulation> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build(model, protocol)
    }
}

fn counting() -> Counting {
    Counting {
        inner: DormandPrince::new(Tolerance::default()),
        builds: AtomicUsize::new(0),
    }
}

fn demo_model() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join("mitchell_schaeffer.mmt")
}

#[test]
fn unresolved_column_aborts_before_any_simulation() {
    let states = unique_path("bad.dat");
    fs::write(&states, "membrane__V totally__unknown_column\n-85 1\n").unwrap();
    let factory = counting();
    let branches = vec![Branch::new(demo_model(), Some(states.clone()), vec![1.0, 0.5])];

    let err = compare::compare_sweeps(&factory, &branches, &Tags::default(), &PacingPlan::default(), StateCarry::Reset, false)
        .unwrap_err();
    match err {
        Error::UnresolvedStateColumn { column, states: file, .. } => {
            assert_eq!(column, "totally__unknown_column");
            assert_eq!(file, states);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    let _ = fs::remove_file(&states);
}

#[test]
fn missing_tag_aborts_before_any_simulation() {
    let factory = counting();
    let tags = Tags {
        gkr: "not_a_real_tag".to_string(),
        ..Tags::default()
    };
    let branches = vec![Branch::new(demo_model(), None, vec![1.0])];
    let err = compare::compare_sweeps(&factory, &branches, &tags, &PacingPlan::default(), StateCarry::Reset, false)
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedTaggedVariable { ref tag } if tag == "not_a_real_tag"));
    assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
}

#[test]
fn missing_files_are_resource_not_found() {
    let factory = counting();
    let branches = vec![Branch::new(demo_model(), Some(unique_path("absent.dat")), vec![1.0])];
    let err = compare::compare_sweeps(&factory, &branches, &Tags::default(), &PacingPlan::default(), StateCarry::Reset, false)
        .unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }));

    let branches = vec![Branch::new(unique_path("absent.mmt"), None, vec![1.0])];
    let err = compare::compare_sweeps(&factory, &branches, &Tags::default(), &PacingPlan::default(), StateCarry::Reset, false)
        .unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound { .. }));
    assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
}
