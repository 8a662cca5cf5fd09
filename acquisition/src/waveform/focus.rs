use ndarray::Array1;
use shared::OutputRow;

use super::{concat, linspace, CycleContext, Device};

/// Piezo focus actuator.
///
/// Holds the step's focus level through the leading readout window and the
/// exposure. During the trailing readout window it ramps to the next step's
/// level, arriving halfway through the window so the move is complete before
/// the next cycle starts.
#[derive(Debug, Clone)]
pub struct FocusActuator {
    /// Travel in µm per `max_voltage` volts
    pub calibration_um: f64,
    /// Command voltage at full travel
    pub max_voltage: f64,
}

impl Default for FocusActuator {
    fn default() -> Self {
        Self {
            calibration_um: 202.161,
            max_voltage: 10.0,
        }
    }
}

impl FocusActuator {
    /// Command voltage for a focus position in µm.
    pub fn volts(&self, z_um: f64) -> f64 {
        z_um / self.calibration_um * self.max_voltage
    }
}

impl Device for FocusActuator {
    fn name(&self) -> &'static str {
        "focus"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[OutputRow::Focus]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        let readout = counts.readout_points();
        let baseline = ctx.settings.relative_z();

        let level = self.volts(ctx.step.z.unwrap_or(0.0) + baseline);
        let target = match ctx.next_step.and_then(|next| next.z) {
            Some(z) => self.volts(z + baseline),
            None => level,
        };

        let ramp_len = readout / 2;
        let ramp = linspace(level, target, ramp_len + 1).slice_move(ndarray::s![1..]);

        vec![concat(&[
            Array1::from_elem(counts.total_points(), level),
            ramp,
            Array1::from_elem(readout - ramp_len, target),
        ])]
    }
}
