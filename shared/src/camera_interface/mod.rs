//! Camera interface used by the acquisition engines.
//!
//! The engines only need a blocking "expose and read out one frame" call plus
//! exposure control. In edge-trigger mode the call returns once the frame
//! started by the next trigger pulse has been read out.

#[cfg(feature = "mock-camera")]
pub mod mock;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ndarray::Array2;
use thiserror::Error;

/// Per-frame metadata reported by the camera (property name to value).
pub type FrameTags = BTreeMap<String, String>;

/// Errors that can occur during camera operations.
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("Capture failed: {0}")]
    CaptureError(String),

    #[error("No trigger received within {0:?}")]
    TriggerTimeout(Duration),

    #[error("Invalid exposure {0:?}")]
    InvalidExposure(Duration),

    #[error("Camera disconnected")]
    Disconnected,
}

/// Result type for camera operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// One image with the tags the camera attached to it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Array2<u16>,
    pub tags: FrameTags,
}

/// A camera that exposes and reads out one frame per call.
pub trait CameraInterface: Send {
    /// Device name.
    fn name(&self) -> &str;

    /// Current exposure.
    fn exposure(&self) -> Duration;

    /// Change the exposure used by subsequent frames.
    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()>;

    /// Expose and read out one frame, blocking until it is available.
    fn expose_and_readout(&mut self) -> CameraResult<Frame>;
}

/// Rising edge on the camera trigger line.
#[derive(Debug, Clone, Copy)]
pub struct TriggerPulse {
    /// When the edge was emitted
    pub emitted_at: Instant,
    /// Sample index of the edge within its buffer
    pub sample: usize,
}

/// Driving end of a trigger line.
pub type TriggerSender = crossbeam_channel::Sender<TriggerPulse>;

/// Receiving end of a trigger line.
pub type TriggerReceiver = crossbeam_channel::Receiver<TriggerPulse>;

/// Create a trigger line connecting an output task to a camera.
pub fn trigger_line() -> (TriggerSender, TriggerReceiver) {
    crossbeam_channel::unbounded()
}
