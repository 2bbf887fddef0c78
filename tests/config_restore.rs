use std::fs;
use std::path::PathBuf;

use apd_bifurcation::config::{
    AppConfig, InputConfig, PlotConfig, PlotFormat, SimulationConfig, SweepConfig, TrajectoryConfig,
};
use apd_bifurcation::sweep::{StateCarry, Tags};
use apd_bifurcation::Error;

fn unique_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "apd_bifurcation_config_restore_{}_{}",
        name,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    path
}

fn custom() -> AppConfig {
    AppConfig {
        input: InputConfig {
            model: "models/decker_2009_analytic_voltage.mmt".to_string(),
            states: vec![
                "models/decker_no_EAD_steadystate.dat".to_string(),
                "models/decker_EAD_steadystate.dat".to_string(),
            ],
        },
        simulation: SimulationConfig {
            abs_tolerance: 1e-6,
            rel_tolerance: 1e-7,
            period: 1250.0,
            level_multiplier: 1.5,
            pre_paces: 500,
            measured_paces: 2,
            threshold_fraction: 0.8,
            point_timeout_secs: 120.0,
        },
        tags: Tags {
            voltage: "analytic_voltage".to_string(),
            gkr: "gkr_max".to_string(),
        },
        sweep: SweepConfig {
            state_carry: StateCarry::CarryForward,
            parallel: true,
            scales: vec!["0.75:0.6:10,0.6:0.525:100".parse().unwrap()],
        },
        trajectory: TrajectoryConfig {
            block: 0.25,
            measured_paces: 5000,
        },
        plot: PlotConfig {
            width: 800,
            height: 600,
            format: PlotFormat::Svg,
        },
    }
}

#[test]
fn saved_config_round_trips() {
    let path = unique_path("custom.toml");
    let expected = custom();
    fs::write(&path, toml::to_string_pretty(&expected).unwrap()).unwrap();

    let actual = AppConfig::load_or_default(&path.to_string_lossy()).unwrap();
    assert_eq!(actual.input.model, expected.input.model);
    assert_eq!(actual.input.states, expected.input.states);
    assert_eq!(actual.simulation.tolerance(), expected.simulation.tolerance());
    assert_eq!(actual.simulation.pacing_plan(), expected.simulation.pacing_plan());
    assert_eq!(actual.simulation.timeout(), expected.simulation.timeout());
    assert_eq!(actual.tags, expected.tags);
    assert_eq!(actual.sweep.state_carry, StateCarry::CarryForward);
    assert!(actual.sweep.parallel);
    assert_eq!(actual.sweep.scales, expected.sweep.scales);
    assert_eq!(actual.trajectory.block, 0.25);
    assert_eq!(actual.trajectory.measured_paces, 5000);
    assert_eq!(actual.plot.format, PlotFormat::Svg);
    assert_eq!((actual.plot.width, actual.plot.height), (800, 600));

    let _ = fs::remove_file(&path);
}

#[test]
fn unparsable_config_is_rejected_without_overwriting() {
    let path = unique_path("broken.toml");
    fs::write(&path, "[simulation\npre_paces = ").unwrap();
    let err = AppConfig::load_or_default(&path.to_string_lossy()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");
    assert_eq!(fs::read_to_string(&path).unwrap(), "[simulation\npre_paces = ");
    let _ = fs::remove_file(&path);
}

#[test]
fn wrongly_typed_value_is_rejected() {
    let path = unique_path("typed.toml");
    fs::write(&path, "[simulation]\npre_paces = \"many\"\n").unwrap();
    assert!(AppConfig::load_or_default(&path.to_string_lossy()).is_err());
    let _ = fs::remove_file(&path);
}
