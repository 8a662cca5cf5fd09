//! Planned imaging steps.

use serde::{Deserialize, Serialize};

/// One planned imaging instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Ordinal position in the sequence
    pub index: usize,
    /// Light channel name (e.g. "488", "561", "LED")
    pub channel: String,
    /// Focus offset in µm relative to the focus baseline
    pub z: Option<f64>,
    /// Lateral offset in µm relative to the sequence origin
    pub xy: Option<(f64, f64)>,
    /// Exposure override in seconds
    pub exposure: Option<f64>,
}

/// Step fields that the waveform itself carries out.
///
/// They are removed from the step that travels downstream with the frame so
/// that nothing applies them a second time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodedOverrides {
    pub z: Option<f64>,
    pub exposure: Option<f64>,
}

impl Step {
    /// Create a step on `channel` with no offsets.
    pub fn new(index: usize, channel: impl Into<String>) -> Self {
        Self {
            index,
            channel: channel.into(),
            z: None,
            xy: None,
            exposure: None,
        }
    }

    pub fn with_z(mut self, z_um: f64) -> Self {
        self.z = Some(z_um);
        self
    }

    pub fn with_xy(mut self, x_um: f64, y_um: f64) -> Self {
        self.xy = Some((x_um, y_um));
        self
    }

    pub fn with_exposure(mut self, exposure_s: f64) -> Self {
        self.exposure = Some(exposure_s);
        self
    }

    /// Remove and return the fields the waveform already encodes.
    pub fn strip_encoded_overrides(&mut self) -> EncodedOverrides {
        EncodedOverrides {
            z: self.z.take(),
            exposure: self.exposure.take(),
        }
    }
}
