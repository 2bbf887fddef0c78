// Entry point: merges config and flags, runs both branches, writes plots.
use apd_bifurcation::cli::{Args, Command};
use apd_bifurcation::compare::{self, Branch};
use apd_bifurcation::config::AppConfig;
use apd_bifurcation::plot::{self, PlotSpec, Series};
use apd_bifurcation::sim::DormandPrince;
use apd_bifurcation::sweep::PacingPlan;
use clap::Parser;
use std::error::Error;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "info,apd_bifurcation=debug"
        } else {
            "info"
        })
    });
    fmt().with_env_filter(filter).with_target(false).init();
}

/// `none` (any case) means "keep the model's initial state".
fn state_paths(entries: &[String]) -> Vec<Option<PathBuf>> {
    if entries.is_empty() {
        return vec![None];
    }
    entries
        .iter()
        .map(|s| (!s.eq_ignore_ascii_case("none")).then(|| PathBuf::from(s)))
        .collect()
}

struct Output<'a> {
    dir: &'a Path,
    name: String,
    ext: &'static str,
    size: (u32, u32),
}

impl Output<'_> {
    fn file(&self, suffix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}_{suffix}.{ext}", self.name))
    }

    fn plot(&self, suffix: &str, spec: PlotSpec, series: &[Series]) -> Result<(), Box<dyn Error>> {
        plot::plot_series(&self.file(suffix, self.ext), &spec.with_size(self.size), series)?;
        Ok(())
    }
}

fn run_sweeps(
    cfg: &AppConfig,
    factory: &DormandPrince,
    states: Vec<Option<PathBuf>>,
    out: &Output,
) -> Result<(), Box<dyn Error>> {
    let scales = &cfg.sweep.scales;
    if scales.is_empty() || (scales.len() != 1 && scales.len() != states.len()) {
        return Err(format!(
            "{} scale sequences given for {} branches; give one or one per branch",
            scales.len(),
            states.len()
        )
        .into());
    }
    let branches: Vec<Branch> = states
        .into_iter()
        .enumerate()
        .map(|(i, s)| Branch::new(&cfg.input.model, s, scales[i.min(scales.len() - 1)].values()))
        .collect();

    let results = compare::compare_sweeps(
        factory,
        &branches,
        &cfg.tags,
        &cfg.simulation.pacing_plan(),
        cfg.sweep.state_carry,
        cfg.sweep.parallel,
    )?;

    let series: Vec<Series> = results
        .iter()
        .map(|r| Series::new(&r.label, r.points.iter().map(|p| (p.scale, p.apd)).collect()))
        .collect();
    out.plot(
        "sweep",
        PlotSpec::new("maximal gkr scaling factor", "apd /ms").with_title(format!("{} bifurcation diagram", out.name)),
        &series,
    )?;
    compare::write_report(&out.file("sweep", "json"), &results)?;
    Ok(())
}

fn run_trajectories(
    cfg: &AppConfig,
    factory: &DormandPrince,
    states: Vec<Option<PathBuf>>,
    out: &Output,
) -> Result<(), Box<dyn Error>> {
    let branches: Vec<Branch> = states
        .into_iter()
        .map(|s| Branch::new(&cfg.input.model, s, Vec::new()))
        .collect();
    let plan = PacingPlan {
        measured_paces: cfg.trajectory.measured_paces,
        ..cfg.simulation.pacing_plan()
    };
    let block = cfg.trajectory.block;
    let results = compare::compare_trajectories(factory, &branches, &cfg.tags, &plan, block, cfg.sweep.parallel)?;

    let title = format!("{}, {:.0}% GKr block", out.name, block * 100.0);
    let apds: Vec<Series> = results.iter().map(|r| Series::indexed(&r.label, &r.apds)).collect();
    out.plot("apds", PlotSpec::new("pace", "apd /ms").with_title(&title), &apds)?;

    let mut traces = Vec::with_capacity(results.len());
    for r in &results {
        let voltage = r.final_trace.get(&r.voltage).ok_or_else(|| format!("{} was not logged", r.voltage))?;
        let points = r
            .final_trace
            .time()
            .iter()
            .zip(voltage)
            .map(|(t, v)| (t.rem_euclid(r.period), *v))
            .collect();
        traces.push(Series::new(&r.label, points));
    }
    out.plot("final_aps", PlotSpec::new("time /ms", "voltage /mV").with_title(&title), &traces)?;
    compare::write_report(&out.file("trajectory", "json"), &results)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut cfg = AppConfig::load_or_default(&args.config)?;
    args.apply(&mut cfg);

    let dir = PathBuf::from(&args.output_dir);
    create_dir_all(&dir)?;
    let name = args.name.clone().unwrap_or_else(|| {
        Path::new(&cfg.input.model)
            .file_stem()
            .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned())
    });
    let out = Output {
        dir: &dir,
        name,
        ext: cfg.plot.format.extension(),
        size: (cfg.plot.width, cfg.plot.height),
    };

    let factory = DormandPrince::new(cfg.simulation.tolerance()).with_timeout(cfg.simulation.timeout());
    let states = state_paths(&cfg.input.states);
    info!(model = %cfg.input.model, branches = states.len(), output = %dir.display(), "starting");

    match &args.command {
        Command::Sweep { .. } => run_sweeps(&cfg, &factory, states, &out)?,
        Command::Trajectory { .. } => run_trajectories(&cfg, &factory, states, &out)?,
    }
    info!("done");
    Ok(())
}
