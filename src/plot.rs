//! Line plots of sweep results and voltage traces.

use std::error::Error as StdError;
use std::fs::create_dir_all;
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

impl Series {
    pub fn new(label: impl Into<String>, points: Vec<(f64, f64)>) -> Self {
        Self {
            label: label.into(),
            points,
        }
    }

    /// Pairs `xs` with `ys`, truncating to the shorter one.
    pub fn from_xy(label: impl Into<String>, xs: &[f64], ys: &[f64]) -> Self {
        Self::new(label, xs.iter().copied().zip(ys.iter().copied()).collect())
    }

    /// `ys` against their index.
    pub fn indexed(label: impl Into<String>, ys: &[f64]) -> Self {
        Self::new(label, ys.iter().enumerate().map(|(i, &y)| (i as f64, y)).collect())
    }

    /// Maximal runs of finite points; NaN or infinite values break the line.
    fn runs(&self) -> Vec<Vec<(f64, f64)>> {
        let mut runs = Vec::new();
        let mut current = Vec::new();
        for &(x, y) in &self.points {
            if x.is_finite() && y.is_finite() {
                current.push((x, y));
            } else if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlotSpec {
    pub title: Option<String>,
    pub x_desc: String,
    pub y_desc: String,
    pub size: (u32, u32),
}

impl PlotSpec {
    pub fn new(x_desc: impl Into<String>, y_desc: impl Into<String>) -> Self {
        Self {
            title: None,
            x_desc: x_desc.into(),
            y_desc: y_desc.into(),
            size: (1200, 700),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_size(mut self, size: (u32, u32)) -> Self {
        self.size = size;
        self
    }
}

fn padded_range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !(lo.is_finite() && hi.is_finite()) {
        return None;
    }
    let pad = if hi > lo { 0.05 * (hi - lo) } else { 0.05 * lo.abs().max(1.0) };
    Some((lo - pad, hi + pad))
}

/// Renders `series` to `path`; `.svg` selects the vector backend, anything
/// else a PNG bitmap. Missing parent directories are created.
pub fn plot_series(path: &Path, spec: &PlotSpec, series: &[Series]) -> Result<()> {
    let runs: Vec<Vec<Vec<(f64, f64)>>> = series.iter().map(Series::runs).collect();
    let finite = || runs.iter().flatten().flatten();
    let (Some(x_range), Some(y_range)) = (
        padded_range(finite().map(|p| p.0)),
        padded_range(finite().map(|p| p.1)),
    ) else {
        return Err(Error::Plot {
            path: path.to_path_buf(),
            message: "no finite points to plot".to_string(),
        });
    };
    for (s, r) in series.iter().zip(&runs) {
        if r.is_empty() {
            warn!(series = %s.label, "series has no finite points");
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent).map_err(|e| Error::from_io(parent, e))?;
    }

    let is_svg = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("svg"));
    let drawn = if is_svg {
        let root = SVGBackend::new(path, spec.size).into_drawing_area();
        render(root, spec, series, &runs, x_range, y_range)
    } else {
        let root = BitMapBackend::new(path, spec.size).into_drawing_area();
        render(root, spec, series, &runs, x_range, y_range)
    };
    drawn.map_err(|e| Error::Plot {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    info!(path = %path.display(), series = series.len(), "saved plot");
    Ok(())
}

fn render<DB>(
    root: DrawingArea<DB, Shift>,
    spec: &PlotSpec,
    series: &[Series],
    runs: &[Vec<Vec<(f64, f64)>>],
    x_range: (f64, f64),
    y_range: (f64, f64),
) -> std::result::Result<(), Box<dyn StdError>>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let mut builder = ChartBuilder::on(&root);
    if let Some(title) = &spec.title {
        builder.caption(title, ("sans-serif", 22));
    }
    let mut chart = builder
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range.0..x_range.1, y_range.0..y_range.1)?;

    chart
        .configure_mesh()
        .x_desc(spec.x_desc.as_str())
        .y_desc(spec.y_desc.as_str())
        .draw()?;

    for (i, (s, series_runs)) in series.iter().zip(runs).enumerate() {
        let color = Palette99::pick(i).to_rgba();
        for (j, run) in series_runs.iter().enumerate() {
            let drawn = chart.draw_series(LineSeries::new(run.iter().copied(), color.stroke_width(2)))?;
            if j == 0 {
                drawn
                    .label(s.label.as_str())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
            }
        }
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_points_split_runs() {
        let s = Series::new(
            "a",
            vec![(0.0, 1.0), (1.0, f64::NAN), (2.0, 3.0), (3.0, 4.0), (4.0, f64::INFINITY)],
        );
        assert_eq!(s.runs(), vec![vec![(0.0, 1.0)], vec![(2.0, 3.0), (3.0, 4.0)]]);
    }

    #[test]
    fn ranges_are_padded() {
        assert_eq!(padded_range([0.0, 10.0].into_iter()), Some((-0.5, 10.5)));
        assert_eq!(padded_range([2.0].into_iter()), Some((1.9, 2.1)));
        assert_eq!(padded_range(std::iter::empty()), None);
    }

    #[test]
    fn series_helpers() {
        assert_eq!(Series::indexed("x", &[5.0, 6.0]).points, vec![(0.0, 5.0), (1.0, 6.0)]);
        assert_eq!(Series::from_xy("x", &[1.0, 2.0, 3.0], &[4.0]).points, vec![(1.0, 4.0)]);
    }

    #[test]
    fn empty_input_is_an_error() {
        let path = std::env::temp_dir().join("apd_bifurcation_plot_empty.png");
        let err = plot_series(&path, &PlotSpec::new("x", "y"), &[Series::new("nan", vec![(0.0, f64::NAN)])]);
        assert!(matches!(err, Err(Error::Plot { .. })));
    }
}
