use ndarray::Array1;
use shared::OutputRow;

use super::{CycleContext, Device};

/// AOTF driving the two laser lines.
///
/// The blanking row opens the modulator for the exposure window and the
/// selector row of the step's laser sets its power. A step on any other
/// channel keeps the modulator closed.
#[derive(Debug, Clone)]
pub struct LightModulator {
    /// Blanking level while the modulator is open, in volts
    pub blank_voltage: f64,
}

impl Default for LightModulator {
    fn default() -> Self {
        Self {
            blank_voltage: 10.0,
        }
    }
}

impl Device for LightModulator {
    fn name(&self) -> &'static str {
        "light_modulator"
    }

    fn rows(&self) -> &'static [OutputRow] {
        &[
            OutputRow::Blanking,
            OutputRow::SelectorA,
            OutputRow::SelectorB,
        ]
    }

    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
        let counts = ctx.counts();
        let channels = ctx.settings.channels();
        let channel = ctx.step.channel.as_str();

        let (blank, a, b) = if channel == channels.laser_a {
            (self.blank_voltage, ctx.power(channel) / 10.0, 0.0)
        } else if channel == channels.laser_b {
            (self.blank_voltage, 0.0, ctx.power(channel) / 10.0)
        } else {
            (0.0, 0.0, 0.0)
        };

        let window = |level: f64| {
            let mut row = Array1::zeros(counts.cycle_points());
            let start = counts.readout_points();
            row.slice_mut(ndarray::s![start..start + counts.exposure_points()])
                .fill(level);
            row
        };

        vec![window(blank), window(a), window(b)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::CycleMode;
    use approx::assert_relative_eq;
    use shared::{Settings, Step};

    fn settings() -> Settings {
        Settings::default()
            .edited(|file| {
                file.sample_rate = 1000.0;
                file.exposure_time = 0.1;
                file.readout_time = 0.03;
            })
            .unwrap()
    }

    fn produce(settings: &Settings, channel: &str) -> Vec<Array1<f64>> {
        let step = Step::new(0, channel);
        let ctx = CycleContext::new(settings, CycleMode::Sequenced, &step, None);
        LightModulator::default().produce(&ctx)
    }

    #[test]
    fn test_laser_a_window() {
        let settings = settings();
        let rows = produce(&settings, "488");

        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.len(), 160);
            assert!(row.slice(ndarray::s![..30]).iter().all(|&v| v == 0.0));
            assert!(row.slice(ndarray::s![130..]).iter().all(|&v| v == 0.0));
        }
        assert_relative_eq!(rows[0][30], 10.0);
        assert_relative_eq!(rows[0][129], 10.0);
        assert_relative_eq!(rows[1][60], 1.5);
        assert_relative_eq!(rows[2][60], 0.0);
    }

    #[test]
    fn test_laser_b_window() {
        let settings = settings();
        let rows = produce(&settings, "561");
        assert_relative_eq!(rows[0][60], 10.0);
        assert_relative_eq!(rows[1][60], 0.0);
        assert_relative_eq!(rows[2][60], 8.0);
    }

    #[test]
    fn test_other_channel_stays_dark() {
        let settings = settings();
        for channel in ["LED", "640", ""] {
            let rows = produce(&settings, channel);
            assert!(rows.iter().all(|row| row.iter().all(|&v| v == 0.0)));
        }
    }
}
