//! Waveform synthesis for one camera cycle.
//!
//! Each [`Device`] turns the cycle description into one or more analog output
//! rows. Every row a device produces spans the full untrimmed cycle,
//! `exposure_points + 2 * readout_points` samples: a readout window, the
//! exposure window, and a second readout window. [`WaveformLibrary`] stacks
//! the rows in wiring order, trims a tail margin and returns a
//! [`WaveformMatrix`] ready for the output task.
//!
//! Nothing in here touches hardware; the same inputs always produce the same
//! buffer.

mod aux_light;
mod camera_trigger;
mod focus;
mod light_modulator;
mod scan_mirror;
pub mod smoothing;
mod stabilizer;

use ndarray::Array1;
use shared::{
    MatrixShapeError, OutputRow, SampleCounts, Settings, SettingsError, Step, WaveformMatrix,
};
use strum::{Display, IntoEnumIterator};
use thiserror::Error;

pub use aux_light::AuxLight;
pub use camera_trigger::CameraTrigger;
pub use focus::FocusActuator;
pub use light_modulator::LightModulator;
pub use scan_mirror::ScanMirror;
pub use stabilizer::Stabilizer;

/// Default divisor for the tail margin trimmed off every composed cycle.
pub const DEFAULT_TAIL_TRIM_DIVISOR: usize = 3;

/// Errors raised while composing a cycle. These are configuration errors:
/// they are raised before anything is written to the hardware.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaveformError {
    #[error("{device} produced {actual} samples for {row}, expected {expected}")]
    LengthMismatch {
        device: &'static str,
        row: OutputRow,
        expected: usize,
        actual: usize,
    },

    #[error("{device} produced {actual} rows, expected {expected}")]
    RowCountMismatch {
        device: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Devices cover {actual:?}, expected every output row in wiring order")]
    RowOrder { actual: Vec<OutputRow> },

    #[error(transparent)]
    Shape(#[from] MatrixShapeError),

    #[error("Invalid exposure override: {0}")]
    ExposureOverride(String),
}

impl From<SettingsError> for WaveformError {
    fn from(err: SettingsError) -> Self {
        WaveformError::ExposureOverride(err.to_string())
    }
}

/// Which block of settings drives the light rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CycleMode {
    /// Acquisition powers and stabilizer flag
    #[strum(to_string = "sequenced")]
    Sequenced,
    /// Live powers and stabilizer flag
    #[strum(to_string = "live")]
    Live,
}

/// Everything a device needs to produce its rows for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    pub settings: &'a Settings,
    pub mode: CycleMode,
    pub step: &'a Step,
    pub next_step: Option<&'a Step>,
}

impl<'a> CycleContext<'a> {
    pub fn new(
        settings: &'a Settings,
        mode: CycleMode,
        step: &'a Step,
        next_step: Option<&'a Step>,
    ) -> Self {
        Self {
            settings,
            mode,
            step,
            next_step,
        }
    }

    pub fn counts(&self) -> SampleCounts {
        self.settings.counts()
    }

    /// Power in percent configured for `channel` in the active block.
    ///
    /// Channels missing from the table are dark.
    pub fn power(&self, channel: &str) -> f64 {
        let table = match self.mode {
            CycleMode::Sequenced => self.settings.laser_powers(),
            CycleMode::Live => &self.settings.live().laser_powers,
        };
        table
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(channel))
            .map(|(_, &power)| power)
            .unwrap_or(0.0)
    }

    /// Whether the stabilizer runs this cycle.
    pub fn twitchers(&self) -> bool {
        match self.mode {
            CycleMode::Sequenced => self.settings.twitchers(),
            CycleMode::Live => self.settings.live().twitchers,
        }
    }
}

/// One physical output, producing its rows for a cycle.
pub trait Device: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Rows this device drives, in wiring order.
    fn rows(&self) -> &'static [OutputRow];

    /// Produce one untrimmed row per entry of [`rows`](Self::rows).
    fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>>;
}

/// The set of devices wired to the output task, in composition order.
pub struct WaveformLibrary {
    devices: Vec<Box<dyn Device>>,
    tail_trim_divisor: usize,
}

impl WaveformLibrary {
    /// Library with the standard device set.
    pub fn new() -> Self {
        Self::with_devices(vec![
            Box::new(ScanMirror::default()),
            Box::new(FocusActuator::default()),
            Box::new(CameraTrigger::default()),
            Box::new(LightModulator::default()),
            Box::new(AuxLight::default()),
            Box::new(Stabilizer::default()),
        ])
    }

    /// Library with a custom device set.
    ///
    /// The devices must cover every output row exactly once, in wiring order;
    /// [`compose`](Self::compose) reports anything else.
    pub fn with_devices(devices: Vec<Box<dyn Device>>) -> Self {
        Self {
            devices,
            tail_trim_divisor: DEFAULT_TAIL_TRIM_DIVISOR,
        }
    }

    /// Trim `readout_points / divisor` samples off every cycle. Zero disables
    /// the trim.
    pub fn with_tail_trim_divisor(mut self, divisor: usize) -> Self {
        self.tail_trim_divisor = divisor;
        self
    }

    pub fn tail_trim_divisor(&self) -> usize {
        self.tail_trim_divisor
    }

    /// Samples trimmed off the end of every row.
    pub fn tail_trim(&self, counts: SampleCounts) -> usize {
        if self.tail_trim_divisor == 0 {
            0
        } else {
            counts.readout_points() / self.tail_trim_divisor
        }
    }

    /// Length of a composed cycle.
    pub fn cycle_length(&self, counts: SampleCounts) -> usize {
        counts.cycle_points() - self.tail_trim(counts)
    }

    /// Compose the buffer for one cycle.
    pub fn compose(&self, ctx: &CycleContext<'_>) -> Result<WaveformMatrix, WaveformError> {
        let counts = ctx.counts();
        let expected = counts.cycle_points();
        let keep = self.cycle_length(counts);

        let mut order = Vec::with_capacity(shared::ROW_COUNT);
        let mut rows = Vec::with_capacity(shared::ROW_COUNT);
        for device in &self.devices {
            let produced = device.produce(ctx);
            if produced.len() != device.rows().len() {
                return Err(WaveformError::RowCountMismatch {
                    device: device.name(),
                    expected: device.rows().len(),
                    actual: produced.len(),
                });
            }
            for (&row, data) in device.rows().iter().zip(produced) {
                if data.len() != expected {
                    return Err(WaveformError::LengthMismatch {
                        device: device.name(),
                        row,
                        expected,
                        actual: data.len(),
                    });
                }
                order.push(row);
                rows.push(data.slice_move(ndarray::s![..keep]));
            }
        }

        if !order.iter().copied().eq(OutputRow::iter()) {
            return Err(WaveformError::RowOrder { actual: order });
        }

        Ok(WaveformMatrix::from_rows(&rows)?)
    }

    /// Compose a cycle with every light row and the camera trigger forced off.
    ///
    /// Motion rows keep their normal shape.
    pub fn compose_safe(&self, ctx: &CycleContext<'_>) -> Result<WaveformMatrix, WaveformError> {
        let mut waveform = self.compose(ctx)?;
        waveform.make_safe();
        Ok(waveform)
    }

    /// Compose a cycle for `step`, applying its exposure override if it has
    /// one.
    pub fn compose_step(
        &self,
        settings: &Settings,
        mode: CycleMode,
        step: &Step,
        next_step: Option<&Step>,
    ) -> Result<WaveformMatrix, WaveformError> {
        match step.exposure {
            Some(exposure) => {
                let settings = settings.with_exposure_time(exposure)?;
                self.compose(&CycleContext::new(&settings, mode, step, next_step))
            }
            None => self.compose(&CycleContext::new(settings, mode, step, next_step)),
        }
    }

    /// Check that `settings` compose cleanly in both modes.
    pub fn validate(&self, settings: &Settings) -> Result<(), WaveformError> {
        let probe = Step::new(0, settings.live().channel.clone());
        for mode in [CycleMode::Sequenced, CycleMode::Live] {
            self.compose(&CycleContext::new(settings, mode, &probe, None))?;
        }
        Ok(())
    }
}

impl Default for WaveformLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// `n` evenly spaced samples from `start` to `end` inclusive.
///
/// A single sample sits at `start`.
pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Array1<f64> {
    match n {
        0 => Array1::zeros(0),
        1 => Array1::from_elem(1, start),
        _ => Array1::linspace(start, end, n),
    }
}

/// Concatenate row segments.
pub(crate) fn concat(parts: &[Array1<f64>]) -> Array1<f64> {
    let len = parts.iter().map(Array1::len).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend(part.iter().copied());
    }
    Array1::from_vec(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Short;

    impl Device for Short {
        fn name(&self) -> &'static str {
            "short"
        }

        fn rows(&self) -> &'static [OutputRow] {
            &[OutputRow::Stabilizer]
        }

        fn produce(&self, ctx: &CycleContext<'_>) -> Vec<Array1<f64>> {
            vec![Array1::zeros(ctx.counts().cycle_points() - 1)]
        }
    }

    fn settings() -> Settings {
        Settings::default()
            .edited(|file| {
                file.sample_rate = 1000.0;
                file.exposure_time = 0.1;
                file.readout_time = 0.03;
            })
            .unwrap()
    }

    #[test]
    fn test_composed_length_drops_tail_margin() {
        let settings = settings();
        let step = Step::new(0, "488");
        let library = WaveformLibrary::new();
        let waveform = library
            .compose(&CycleContext::new(&settings, CycleMode::Sequenced, &step, None))
            .unwrap();

        assert_eq!(waveform.columns(), 100 + 60 - 10);
        assert_eq!(library.cycle_length(settings.counts()), 150);
    }

    #[test]
    fn test_trim_divisor_is_tunable() {
        let settings = settings();
        let step = Step::new(0, "488");
        let ctx = CycleContext::new(&settings, CycleMode::Sequenced, &step, None);

        let untrimmed = WaveformLibrary::new().with_tail_trim_divisor(0);
        assert_eq!(untrimmed.compose(&ctx).unwrap().columns(), 160);

        let halved = WaveformLibrary::new().with_tail_trim_divisor(2);
        assert_eq!(halved.compose(&ctx).unwrap().columns(), 145);
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let settings = settings();
        let step = Step::new(0, "488");
        let library = WaveformLibrary::with_devices(vec![
            Box::new(ScanMirror::default()),
            Box::new(FocusActuator::default()),
            Box::new(CameraTrigger::default()),
            Box::new(LightModulator::default()),
            Box::new(AuxLight::default()),
            Box::new(Short),
        ]);

        let err = library
            .compose(&CycleContext::new(&settings, CycleMode::Sequenced, &step, None))
            .unwrap_err();
        assert_eq!(
            err,
            WaveformError::LengthMismatch {
                device: "short",
                row: OutputRow::Stabilizer,
                expected: 160,
                actual: 159,
            }
        );
    }

    #[test]
    fn test_missing_device_breaks_row_order() {
        let settings = settings();
        let step = Step::new(0, "488");
        let library = WaveformLibrary::with_devices(vec![
            Box::new(ScanMirror::default()),
            Box::new(CameraTrigger::default()),
        ]);
        assert!(matches!(
            library.compose(&CycleContext::new(&settings, CycleMode::Sequenced, &step, None)),
            Err(WaveformError::RowOrder { .. })
        ));
    }

    #[test]
    fn test_exposure_override_changes_length() {
        let settings = settings();
        let library = WaveformLibrary::new();
        let step = Step::new(0, "561").with_exposure(0.05);

        let waveform = library
            .compose_step(&settings, CycleMode::Sequenced, &step, None)
            .unwrap();
        assert_eq!(waveform.columns(), 50 + 60 - 10);

        let bad = Step::new(0, "561").with_exposure(-1.0);
        assert!(matches!(
            library.compose_step(&settings, CycleMode::Sequenced, &bad, None),
            Err(WaveformError::ExposureOverride(_))
        ));
    }

    #[test]
    fn test_power_lookup_uses_mode_block() {
        let settings = Settings::default();
        let step = Step::new(0, "561");
        let sequenced = CycleContext::new(&settings, CycleMode::Sequenced, &step, None);
        let live = CycleContext::new(&settings, CycleMode::Live, &step, None);

        assert_relative_eq!(sequenced.power("561"), 80.0);
        assert_relative_eq!(live.power("561"), 50.0);
        assert_relative_eq!(live.power("led"), 100.0);
        assert_relative_eq!(live.power("640"), 0.0);
    }

    #[test]
    fn test_compose_safe_keeps_motion() {
        let settings = settings();
        let step = Step::new(0, "488").with_z(5.0);
        let library = WaveformLibrary::new();
        let ctx = CycleContext::new(&settings, CycleMode::Sequenced, &step, None);

        let normal = library.compose(&ctx).unwrap();
        let safe = library.compose_safe(&ctx).unwrap();

        assert!(safe.is_safe());
        assert!(!normal.is_safe());
        assert_eq!(safe.row(OutputRow::ScanMirror), normal.row(OutputRow::ScanMirror));
        assert_eq!(safe.row(OutputRow::Focus), normal.row(OutputRow::Focus));
    }

    #[test]
    fn test_linspace_edges() {
        assert_eq!(linspace(1.0, 2.0, 0).len(), 0);
        assert_eq!(linspace(1.0, 2.0, 1).to_vec(), vec![1.0]);
        assert_eq!(linspace(0.0, 1.0, 3).to_vec(), vec![0.0, 0.5, 1.0]);
    }
}
