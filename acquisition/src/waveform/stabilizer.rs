use ndarray::Array1;
use shared::OutputRow;

use super::smoothing::gaussian_filter1d;
use super::{concat, linspace, CycleContext, Device};

/// Extra waves generated past the exposure window so the padding never has
/// to stretch the edge values across a whole readout window.
const EXTRA_WAVES: usize = 20;

/// Sample stabilizer ("twitcher").
///
/// A fast, smoothed triangle wave that dithers the sample during the
/// exposure. When disabled the row sits at its offset.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    /// Peak deviation from the offset, in volts
    pub amplitude: f64,
    /// Waves per exposure window
    pub waves: usize,
    /// Rest level, in volts
    pub offset: f64,
}

impl Default for Stabilizer {
    fn default() -> Self {
        Self {
            amplitude: 0.07,
            waves: 240,
            offset: 5.0,
        }
    }
}

impl Stabilizer {
    /// Unit-amplitude triangle starting and ending at zero.
    fn triangle(&self, points_per_wave: usize) -> Array1<f64> {
        let half = points_per_wave / 2 + 1;
        let quarter = points_per_wave / 4 + 1;
        let up = linspace(-1.0, 1.0, half);
        let down = linspace(1.0, -1.0, half);
        let start = linspace(0.0, -1.0, quarter);
        let end = linspace(-1.0, 0.0, quarter);

        let drop_last = |a: &Array1<f64>| a.slice(ndarray::s![..a.len() - 1]).to_owned();
        let wave = concat(&[drop_last(&up), drop_last(&down)]);

        let mut parts = Vec::with_capacity(self.waves + EXTRA_WAVES + 2);
        parts.push(drop_last(&start));
        parts.extend(std::iter::repeat(wave).take(self.waves + EXTRA_WAVES));
        parts.push(end);
        concat(&parts)
    }
}

/// Pad with edge values, or crop from both ends, to exactly `len` samples.
fn fit_to(frame: Array1<f64>, len: usize) -> Array1<f64> {
    let current = frame.len();
    if current >= len {
        let cut = (current - len) / 2;
        return frame.slice_move(ndarray::s![cut..cut + len]);
    }
    let missing = len - current;
    let before = missing / 2;
    let first = frame.first().copied().unwrap_or(0.0);
    let last = frame.last().copied().unwrap_or(0.0);
    concat(&[
        Array1::from_elem(before, first),
        frame,
        Array1::from_elem(missing - before, last),
    ])
}

impl Device for Stabilizer {
    fn name(&self) -> &'static str {
        "stabilizer"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[OutputRow::Stabilizer]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        if !ctx.twitchers() || self.waves == 0 {
            return vec![Array1::from_elem(counts.cycle_points(), self.offset)];
        }

        let points_per_wave = counts.exposure_points().div_ceil(self.waves);
        let frame = fit_to(self.triangle(points_per_wave), counts.cycle_points());
        let smoothed = gaussian_filter1d(&frame, points_per_wave as f64 / 20.0);

        let peak = smoothed.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        if !peak.is_finite() || peak <= 0.0 {
            return vec![Array1::from_elem(counts.cycle_points(), self.offset)];
        }
        vec![smoothed * (self.amplitude / peak) + self.offset]
    }
}
