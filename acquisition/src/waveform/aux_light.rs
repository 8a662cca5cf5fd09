use ndarray::Array1;
use shared::OutputRow;

use super::{concat, CycleContext, Device};

/// Exposure-window shift for powers below 7 %.
const LOW_POWER_ADJUST: [f64; 7] = [1.0, 1.0, 1.0, 0.86, 0.95, 0.97, 0.978];

/// LED on the auxiliary light row.
///
/// The LED turns on slightly before the end of the leading readout window and
/// stays on through the exposure. How early depends on the power: the driver
/// responds more slowly at low power, which otherwise shows up as dark bars
/// at the top of the image.
#[derive(Debug, Clone)]
pub struct AuxLight {
    /// Shift factor used at and above 20 % power
    pub speed_adjustment: f64,
}

impl Default for AuxLight {
    fn default() -> Self {
        Self {
            speed_adjustment: 1.002,
        }
    }
}

impl AuxLight {
    /// Fraction of the readout window spent dark before the LED turns on.
    pub fn speed_adjust(&self, power: f64) -> f64 {
        if power < 7.0 {
            let index = power.max(0.0).floor() as usize;
            LOW_POWER_ADJUST[index.min(LOW_POWER_ADJUST.len() - 1)]
        } else if power < 20.0 {
            self.speed_adjustment - (20.0 - power) / 800.0
        } else {
            self.speed_adjustment
        }
    }
}

impl Device for AuxLight {
    fn name(&self) -> &'static str {
        "aux_light"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[OutputRow::AuxLight]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        let channels = ctx.settings.channels();
        if !channels.is_led(&ctx.step.channel) {
            return vec![Array1::zeros(counts.cycle_points())];
        }

        let power = ctx.power(&channels.led);
        let readout = counts.readout_points();
        let dark = ((readout as f64 * self.speed_adjust(power)).round() as usize)
            .min(counts.total_points());
        let on = counts.total_points() - dark;

        vec![concat(&[
            Array1::zeros(dark),
            Array1::from_elem(on, power / 10.0),
            Array1::zeros(readout),
        ])]
    }
}
