//! Acquisition settings and the sample counts derived from them.
//!
//! [`SettingsFile`] is the raw, serializable document. [`Settings`] is the
//! validated form handed to the engines: it is immutable, and the derived
//! [`SampleCounts`] are computed once, at the point where the timing fields
//! are set, so they can never drift out of step with the exposure time or
//! sample rate they were computed from.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default analog output sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 9600.0;

/// Default camera readout time in seconds (Prime BSI, 100 MHz 16 bit).
pub const DEFAULT_READOUT_TIME_S: f64 = 0.029;

/// Default exposure time in seconds.
pub const DEFAULT_EXPOSURE_TIME_S: f64 = 0.1;

/// Default settle time between arming the camera and starting playback.
pub const DEFAULT_PRE_TRIGGER_DELAY_MS: f64 = 10.0;

/// Smallest exposure window the scan ramp can be built from.
pub const MIN_EXPOSURE_POINTS: usize = 2;

/// Largest light power accepted, in percent.
pub const MAX_POWER_PERCENT: f64 = 100.0;

/// Power level per channel name, in percent.
pub type PowerTable = BTreeMap<String, f64>;

/// Errors raised while validating or loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Sample rate must be positive and finite, got {0}")]
    InvalidSampleRate(f64),

    #[error("Exposure time must be positive and finite, got {0} s")]
    InvalidExposureTime(f64),

    #[error("Readout time must be non-negative and finite, got {0} s")]
    InvalidReadoutTime(f64),

    #[error("Exposure window of {points} samples is shorter than the minimum of {min}")]
    TooFewExposurePoints { points: usize, min: usize },

    #[error("Power for channel {channel} must be within 0-100 %, got {power}")]
    PowerOutOfRange { channel: String, power: f64 },

    #[error("Live frame rate must be positive and finite, got {0}")]
    InvalidFrameRate(f64),

    #[error("Pre-trigger delay must be non-negative and finite, got {0} ms")]
    InvalidPreTriggerDelay(f64),

    #[error("Light source channels must have distinct names, {0} is wired twice")]
    DuplicateChannel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Per-cycle sample counts derived from exposure time, readout time and
/// sample rate.
///
/// The three counts are only ever produced together by
/// [`from_times`](Self::from_times).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SampleCounts {
    exposure_points: usize,
    readout_points: usize,
    total_points: usize,
}

impl SampleCounts {
    /// Derive the counts for one camera cycle.
    ///
    /// `exposure_points = floor(exposure_time * sample_rate)` and likewise for
    /// the readout window; `total_points` is their sum.
    pub fn from_times(
        exposure_time: f64,
        readout_time: f64,
        sample_rate: f64,
    ) -> SettingsResult<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(SettingsError::InvalidSampleRate(sample_rate));
        }
        if !exposure_time.is_finite() || exposure_time <= 0.0 {
            return Err(SettingsError::InvalidExposureTime(exposure_time));
        }
        if !readout_time.is_finite() || readout_time < 0.0 {
            return Err(SettingsError::InvalidReadoutTime(readout_time));
        }

        let exposure_points = (exposure_time * sample_rate).floor() as usize;
        let readout_points = (readout_time * sample_rate).floor() as usize;

        if exposure_points < MIN_EXPOSURE_POINTS {
            return Err(SettingsError::TooFewExposurePoints {
                points: exposure_points,
                min: MIN_EXPOSURE_POINTS,
            });
        }

        Ok(Self {
            exposure_points,
            readout_points,
            total_points: exposure_points + readout_points,
        })
    }

    /// Samples in the exposure (integration) window.
    pub fn exposure_points(&self) -> usize {
        self.exposure_points
    }

    /// Samples in one camera readout window.
    pub fn readout_points(&self) -> usize {
        self.readout_points
    }

    /// Exposure plus one readout window.
    pub fn total_points(&self) -> usize {
        self.total_points
    }

    /// Length of every untrimmed device row: exposure plus a readout window on
    /// each side.
    pub fn cycle_points(&self) -> usize {
        self.total_points + self.readout_points
    }
}

/// Names of the light channels the output rows are wired to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMap {
    /// Channel driving the first AOTF selector row
    pub laser_a: String,
    /// Channel driving the second AOTF selector row
    pub laser_b: String,
    /// Channel driving the LED row (matched case-insensitively)
    pub led: String,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            laser_a: "488".to_string(),
            laser_b: "561".to_string(),
            led: "LED".to_string(),
        }
    }
}

impl ChannelMap {
    /// True if `channel` names the LED channel.
    pub fn is_led(&self, channel: &str) -> bool {
        channel.eq_ignore_ascii_case(&self.led)
    }
}

/// Settings used while live mode is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Channel shown in live mode
    pub channel: String,
    /// Target frame rate
    pub fps: f64,
    /// Run the stabilizer during live mode
    pub twitchers: bool,
    /// Live power table, separate from the acquisition powers
    pub laser_powers: PowerTable,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            channel: "561".to_string(),
            fps: 5.0,
            twitchers: false,
            laser_powers: PowerTable::from([
                ("488".to_string(), 50.0),
                ("561".to_string(), 50.0),
                ("LED".to_string(), 100.0),
            ]),
        }
    }
}

/// Raw settings document as stored on disk.
///
/// Unknown fields are ignored and missing fields take their defaults, so an
/// older document still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    /// Analog output sample rate in Hz
    pub sample_rate: f64,
    /// Exposure window in seconds
    pub exposure_time: f64,
    /// Camera readout time in seconds
    pub readout_time: f64,
    /// Acquisition power table
    pub laser_powers: PowerTable,
    /// Channel wiring
    pub channels: ChannelMap,
    /// Focus baseline in µm added to every step's z
    pub relative_z: f64,
    /// Run the stabilizer during acquisitions
    pub twitchers: bool,
    /// Settle time between camera arm and playback start, in ms
    pub pre_trigger_delay_ms: f64,
    /// Live mode block
    pub live: LiveSettings,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE_HZ,
            exposure_time: DEFAULT_EXPOSURE_TIME_S,
            readout_time: DEFAULT_READOUT_TIME_S,
            laser_powers: PowerTable::from([
                ("488".to_string(), 15.0),
                ("561".to_string(), 80.0),
                ("LED".to_string(), 50.0),
            ]),
            channels: ChannelMap::default(),
            relative_z: 0.0,
            twitchers: false,
            pre_trigger_delay_ms: DEFAULT_PRE_TRIGGER_DELAY_MS,
            live: LiveSettings::default(),
        }
    }
}

/// Validated, immutable acquisition settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    file: SettingsFile,
    counts: SampleCounts,
}

impl Settings {
    /// Validate a settings document.
    pub fn new(file: SettingsFile) -> SettingsResult<Self> {
        let counts = SampleCounts::from_times(file.exposure_time, file.readout_time, file.sample_rate)?;

        validate_powers(&file.laser_powers)?;
        validate_powers(&file.live.laser_powers)?;

        if !file.live.fps.is_finite() || file.live.fps <= 0.0 {
            return Err(SettingsError::InvalidFrameRate(file.live.fps));
        }
        if !file.pre_trigger_delay_ms.is_finite() || file.pre_trigger_delay_ms < 0.0 {
            return Err(SettingsError::InvalidPreTriggerDelay(file.pre_trigger_delay_ms));
        }
        if file.channels.laser_a == file.channels.laser_b {
            return Err(SettingsError::DuplicateChannel(file.channels.laser_a));
        }
        // An LED named like a laser would light both rows for one step
        for laser in [&file.channels.laser_a, &file.channels.laser_b] {
            if file.channels.is_led(laser) {
                return Err(SettingsError::DuplicateChannel(laser.clone()));
            }
        }

        Ok(Self { file, counts })
    }

    /// Copy of these settings with a different exposure time.
    ///
    /// This is the only path that changes the exposure, so the derived counts
    /// are recomputed here and nowhere else.
    pub fn with_exposure_time(&self, exposure_time: f64) -> SettingsResult<Self> {
        let mut file = self.file.clone();
        file.exposure_time = exposure_time;
        Self::new(file)
    }

    /// Apply an edit to a copy of the document and re-validate it.
    pub fn edited(&self, edit: impl FnOnce(&mut SettingsFile)) -> SettingsResult<Self> {
        let mut file = self.file.clone();
        edit(&mut file);
        Self::new(file)
    }

    /// Sample counts for one cycle.
    pub fn counts(&self) -> SampleCounts {
        self.counts
    }

    pub fn sample_rate(&self) -> f64 {
        self.file.sample_rate
    }

    pub fn exposure_time(&self) -> f64 {
        self.file.exposure_time
    }

    pub fn readout_time(&self) -> f64 {
        self.file.readout_time
    }

    pub fn laser_powers(&self) -> &PowerTable {
        &self.file.laser_powers
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.file.channels
    }

    pub fn relative_z(&self) -> f64 {
        self.file.relative_z
    }

    pub fn twitchers(&self) -> bool {
        self.file.twitchers
    }

    pub fn live(&self) -> &LiveSettings {
        &self.file.live
    }

    /// Delay between the camera arming and the output task starting.
    pub fn pre_trigger_delay(&self) -> Duration {
        Duration::from_secs_f64(self.file.pre_trigger_delay_ms / 1000.0)
    }

    /// Exposure the camera must be set to in edge-trigger mode.
    ///
    /// The camera integrates across the readout of the previous frame, so its
    /// exposure covers the whole cycle.
    pub fn camera_exposure(&self) -> Duration {
        Duration::from_secs_f64(self.file.exposure_time + self.file.readout_time)
    }

    /// Period of one live frame.
    pub fn live_frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.file.live.fps)
    }

    /// The raw document these settings were built from.
    pub fn file(&self) -> &SettingsFile {
        &self.file
    }
}

impl Default for Settings {
    fn default() -> Self {
        match Self::new(SettingsFile::default()) {
            Ok(settings) => settings,
            Err(e) => unreachable!("default settings document is invalid: {e}"),
        }
    }
}

impl TryFrom<SettingsFile> for Settings {
    type Error = SettingsError;

    fn try_from(file: SettingsFile) -> SettingsResult<Self> {
        Self::new(file)
    }
}

fn validate_powers(powers: &PowerTable) -> SettingsResult<()> {
    for (channel, &power) in powers {
        if !power.is_finite() || !(0.0..=MAX_POWER_PERCENT).contains(&power) {
            return Err(SettingsError::PowerOutOfRange {
                channel: channel.clone(),
                power,
            });
        }
    }
    Ok(())
}
