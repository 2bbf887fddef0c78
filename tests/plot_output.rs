use std::fs;
use std::path::PathBuf;

use apd_bifurcation::plot::{plot_series, PlotSpec, Series};

fn unique_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "apd_bifurcation_plot_{}_{}",
        name,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    path
}

#[test]
fn writes_plot_and_creates_directories() {
    let dir = unique_path("out");
    assert!(!dir.exists());
    let path = dir.join("nested").join("demo_sweep.svg");
    let series = [
        Series::from_xy("initially using ead state", &[0.75, 0.6, 0.5], &[250.0, 320.0, 410.0]),
        Series::from_xy("initially using normal state", &[0.5, 0.6, 0.75], &[260.0, f64::NAN, 240.0]),
    ];
    let spec = PlotSpec::new("maximal gkr scaling factor", "apd /ms")
        .with_title("demo bifurcation diagram")
        .with_size((640, 480));

    plot_series(&path, &spec, &series).unwrap();
    let written = fs::read_to_string(&path).unwrap();
    assert!(!written.is_empty());
    assert!(written.contains("<svg"));

    let _ = fs::remove_dir_all(&dir);
}
