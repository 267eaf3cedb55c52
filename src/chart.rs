use image::{ImageOutputFormat, RgbImage};
use plotters::prelude::*;
use std::io::Cursor;
use std::ops::Range;

use crate::error::{DashError, Result};
use crate::query::Figure;

/// How each series is drawn
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphType {
    /// Points joined by lines
    #[default]
    Line,

    /// Unconnected points
    Scatter,
}

/// Configuration options for chart rendering
#[derive(Clone, Debug)]
pub struct GraphOptions {
    /// Title displayed at the top of the chart
    pub title: String,

    /// Width of the chart in pixels
    pub width: u32,

    /// Height of the chart in pixels
    pub height: u32,

    pub graph_type: GraphType,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            width: 1000,
            height: 600,
            graph_type: GraphType::Line,
        }
    }
}

/// Bytes of an RGB24 buffer of `width` x `height`, or `None` if that does not fit in memory.
pub fn rgb_len(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(3)
}

fn chart_err(e: impl std::fmt::Display) -> DashError {
    DashError::Chart(e.to_string())
}

/// Numeric `(x, y)` points of every series. Points where either value is not
/// a number are skipped.
pub fn numeric_points(figure: &Figure) -> Vec<(String, Vec<(f64, f64)>)> {
    figure
        .series
        .iter()
        .map(|s| {
            let points = s
                .x
                .iter()
                .zip(&s.y)
                .filter_map(|(x, y)| Some((x.as_f64()?, y.as_f64()?)))
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .collect();
            (s.name.clone(), points)
        })
        .collect()
}

/// Axis ranges covering every point, padded when the data is degenerate.
pub fn bounds(series: &[(String, Vec<(f64, f64)>)]) -> (Range<f64>, Range<f64>) {
    let mut x = (f64::INFINITY, f64::NEG_INFINITY);
    let mut y = (f64::INFINITY, f64::NEG_INFINITY);
    for (px, py) in series.iter().flat_map(|(_, pts)| pts.iter()) {
        x = (x.0.min(*px), x.1.max(*px));
        y = (y.0.min(*py), y.1.max(*py));
    }
    (widen(x), widen(y))
}

fn widen((lo, hi): (f64, f64)) -> Range<f64> {
    if lo > hi {
        0.0..1.0
    } else if lo == hi {
        lo - 0.5..hi + 0.5
    } else {
        lo..hi
    }
}

/// Render a figure to PNG bytes: one coloured series per source file, with a legend.
pub fn render_png(figure: &Figure, options: &GraphOptions) -> Result<Vec<u8>> {
    let series = numeric_points(figure);
    let (x_range, y_range) = bounds(&series);
    let (width, height) = (options.width, options.height);

    let len = rgb_len(width, height)
        .ok_or_else(|| DashError::Chart(format!("chart of {width}x{height} is too large")))?;
    let mut pixels = vec![0u8; len];
    {
        let root = BitMapBackend::with_buffer(&mut pixels, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(chart_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 24).into_font())
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(x_range, y_range)
            .map_err(chart_err)?;

        chart
            .configure_mesh()
            .x_desc(&figure.x_label)
            .y_desc(&figure.y_label)
            .draw()
            .map_err(chart_err)?;

        for (i, (name, points)) in series.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            let drawn = match options.graph_type {
                GraphType::Line => chart
                    .draw_series(LineSeries::new(points.iter().copied(), color.stroke_width(1)))
                    .map_err(chart_err)?,
                GraphType::Scatter => chart
                    .draw_series(points.iter().map(|&p| Circle::new(p, 2, color.filled())))
                    .map_err(chart_err)?,
            };
            drawn
                .label(name.as_str())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(chart_err)?;

        root.present().map_err(chart_err)?;
    }

    let image = RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| DashError::Chart("pixel buffer size mismatch".into()))?;
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageOutputFormat::Png)?;
    Ok(png.into_inner())
}
