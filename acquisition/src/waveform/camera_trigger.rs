use ndarray::Array1;
use shared::OutputRow;

use super::{CycleContext, Device};

/// Edge trigger for the camera.
///
/// A short pulse at the very start of the cycle. The camera runs in edge
/// trigger mode with its exposure set to exposure plus readout, so the frame
/// it starts here covers the leading readout window and the light window.
#[derive(Debug, Clone)]
pub struct CameraTrigger {
    /// Pulse height in volts
    pub pulse_voltage: f64,
    /// Pulse width in samples
    pub pulse_points: usize,
}

impl Default for CameraTrigger {
    fn default() -> Self {
        Self {
            pulse_voltage: 5.0,
            pulse_points: 10,
        }
    }
}

impl Device for CameraTrigger {
    fn name(&self) -> &'static str {
        "camera_trigger"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[OutputRow::CameraTrigger]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        let width = self.pulse_points.min(counts.exposure_points());
        let mut row = Array1::zeros(counts.cycle_points());
        row.slice_mut(ndarray::s![..width]).fill(self.pulse_voltage);
        vec![row]
    }
}
