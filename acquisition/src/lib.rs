//! Hardware-synchronized acquisition for a structured illumination microscope.
//!
//! Every camera frame is one waveform cycle: the analog output task plays a
//! buffer that sweeps the scan mirror, sets focus, gates the light sources
//! and fires the camera trigger, while a camera thread blocks in
//! `expose_and_readout`. The engines keep the two in lock-step:
//!
//! - [`SequencedAcquisitionEngine`] runs a finite sequence of steps with
//!   one-step look-ahead and always tears down to a parked state.
//! - [`LiveAcquisitionEngine`] free-runs a single channel until cancelled.
//! - [`AcquisitionController`] owns the task and camera and switches between
//!   the two.
//!
//! [`WaveformLibrary`] turns settings and a step into the output buffer and
//! never touches hardware.

pub mod camera_gate;
pub mod camera_operation;
pub mod controller;
pub mod cycle;
pub mod dump;
pub mod error;
pub mod frame_event;
pub mod live;
pub mod plan;
pub mod sequenced;
pub mod waveform;

pub use camera_gate::{CameraGate, InFlightToken};
pub use camera_operation::CameraStats;
pub use controller::AcquisitionController;
pub use cycle::EngineTimeouts;
pub use error::{AcquisitionError, AcquisitionResult};
pub use frame_event::{
    CollectingSink, FrameEvent, FrameKind, FrameSink, FrameTiming, NullSink, SharedSink,
};
pub use live::{LiveAcquisitionEngine, LiveReport};
pub use plan::SequencePlan;
pub use sequenced::{CancelHandle, SequenceSummary, SequencedAcquisitionEngine, SharedStage};
pub use waveform::{CycleContext, CycleMode, Device, WaveformError, WaveformLibrary};
