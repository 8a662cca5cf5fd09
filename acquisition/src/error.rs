use std::time::Duration;

use hardware::{OutputError, OwnershipError};
use shared::{CameraError, SettingsError};
use thiserror::Error;

use crate::waveform::WaveformError;

/// Errors from configuring or controlling the acquisition engines.
///
/// Running engines never return these for per-cycle failures; those are
/// logged and counted in the run reports instead.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Waveform configuration error: {0}")]
    Waveform(#[from] WaveformError),

    #[error("Output task unavailable: {0}")]
    Ownership(#[from] OwnershipError),

    #[error("Output task error: {0}")]
    Output(#[from] OutputError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Live mode is already running")]
    AlreadyRunning,

    #[error("Live loop did not stop within {0:?}")]
    RestartTimeout(Duration),
}

/// Result type for acquisition operations.
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;
