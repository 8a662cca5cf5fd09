use ndarray::Array1;
use shared::OutputRow;

use super::{concat, linspace, CycleContext, Device};

/// Galvo scan mirror.
///
/// Sweeps linearly across the exposure window. The sweep is extended on both
/// ends by an overshoot that keeps the per-sample slope, so the mirror is
/// already moving at scan speed when the light comes on. The readout windows
/// bring the mirror back to its offset and out to the start of the next
/// sweep.
#[derive(Debug, Clone)]
pub struct ScanMirror {
    /// Half the sweep, in volts
    pub amplitude: f64,
    /// Resting position, in volts
    pub offset: f64,
}

impl Default for ScanMirror {
    fn default() -> Self {
        Self {
            amplitude: 0.2346,
            offset: -0.075,
        }
    }
}

/// Overshoot samples on each side of the sweep for a readout window.
///
/// `ceil(round_half_even(readout / 20) / 2)`.
pub fn overshoot_points(readout_points: usize) -> usize {
    let twentieths = (readout_points as f64 / 20.0).round_ties_even() as usize;
    twentieths.div_ceil(2)
}

impl Device for ScanMirror {
    fn name(&self) -> &'static str {
        "scan_mirror"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[OutputRow::ScanMirror]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        let n = counts.exposure_points();
        let readout = counts.readout_points();
        let amp = self.amplitude;
        let offset = self.offset;

        let overshoot = overshoot_points(readout);
        let increment = 2.0 * amp / (n.max(2) - 1) as f64;
        let overshoot_amp = increment * (overshoot + 1) as f64;

        // Overshoot keeps the sweep slope; the readout ramps end one increment
        // beyond it on either side.
        let overshoot_span = increment * overshoot as f64;
        let sweep = concat(&[
            linspace(-amp - overshoot_span, -amp - increment, overshoot),
            linspace(-amp, amp, n),
            linspace(amp + increment, amp + overshoot_span, overshoot),
        ]) + offset;

        let delay = readout.saturating_sub(overshoot);
        let sweep_start = -amp + offset - overshoot_amp;

        let approach_len = delay * 9 / 10;
        let approach = linspace(offset, sweep_start, approach_len);
        let approach_hold = Array1::from_elem(
            delay - approach_len,
            approach.last().copied().unwrap_or(sweep_start),
        );

        let return_len = delay / 2;
        let return_ramp = linspace(offset + amp + overshoot_amp, offset, return_len);
        let return_hold = Array1::from_elem(delay - return_len, offset);

        vec![concat(&[
            approach,
            approach_hold,
            sweep,
            return_ramp,
            return_hold,
        ])]
    }
}
