//! Benchmarks for the Dormand–Prince engine on the demo cell model.
//!
//! Run:
//! - cargo bench --bench engine_pacing

use std::path::Path;

use apd_bifurcation::model::{self, Model};
use apd_bifurcation::protocol::Protocol;
use apd_bifurcation::sim::{DormandPrince, Simulator, SimulatorFactory, Tolerance};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const PERIOD: f64 = 1000.0;
const TOLERANCES: [f64; 3] = [1e-6, 1e-8, 1e-10];

fn demo() -> (Model, Protocol) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/mitchell_schaeffer.mmt");
    let (model, protocol, _) = model::load(path).unwrap();
    (model, protocol.retimed(PERIOD, 2.0).unwrap())
}

fn bench_pre_pace(c: &mut Criterion) {
    let (model, protocol) = demo();
    let mut group = c.benchmark_group("engine_pre_pace");
    group.sample_size(20);

    for &tol in &TOLERANCES {
        let factory = DormandPrince::new(Tolerance { abs: tol, rel: tol });
        let id = BenchmarkId::new("tol", format!("{tol:e}"));
        group.bench_with_input(id, &factory, |b, factory| {
            b.iter(|| {
                let mut sim = factory.build(&model, &protocol).unwrap();
                sim.pre(black_box(PERIOD)).unwrap();
                black_box(sim.state()[0]);
            });
        });
    }

    group.finish();
}

fn bench_logged_pace(c: &mut Criterion) {
    let (model, protocol) = demo();
    let mut group = c.benchmark_group("engine_logged_pace");
    group.sample_size(20);

    for &tol in &TOLERANCES {
        let factory = DormandPrince::new(Tolerance { abs: tol, rel: tol });
        let id = BenchmarkId::new("tol", format!("{tol:e}"));
        group.bench_with_input(id, &factory, |b, factory| {
            b.iter(|| {
                let mut sim = factory.build(&model, &protocol).unwrap();
                let log = sim.run(black_box(PERIOD), &["membrane.V"]).unwrap();
                let apd = log.apd("membrane.V", -76.5).unwrap();
                black_box(apd.duration.len());
            });
        });
    }

    group.finish();
}

criterion_group!(engine_pacing, bench_pre_pace, bench_logged_pace);
criterion_main!(engine_pacing);
