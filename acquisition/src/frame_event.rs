//! Frames leaving the engines.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use shared::{Frame, Step};
use strum::Display;
use tracing::trace;

/// Which engine produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FrameKind {
    #[strum(to_string = "sequenced")]
    Sequenced,
    #[strum(to_string = "live")]
    Live,
    #[strum(to_string = "snap")]
    Snap,
}

/// Timing of the cycle that produced a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    /// Camera thread marked itself armed
    pub armed_at: Instant,
    /// Frame returned from the camera
    pub completed_at: Instant,
    /// Samples in the played buffer
    pub cycle_samples: usize,
    /// Output sample rate in Hz
    pub sample_rate: f64,
}

impl FrameTiming {
    /// Time the camera call blocked for.
    pub fn camera_time(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.armed_at)
    }

    /// Playback duration of the cycle.
    pub fn cycle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_samples as f64 / self.sample_rate)
    }
}

/// One completed camera operation.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub kind: FrameKind,
    pub frame: Frame,
    /// Step the frame belongs to, with the waveform-encoded fields removed
    pub step: Step,
    pub timing: FrameTiming,
}

/// Consumer of frame events.
pub trait FrameSink: Send + Sync {
    fn emit(&self, event: FrameEvent);
}

impl FrameSink for Sender<FrameEvent> {
    fn emit(&self, event: FrameEvent) {
        if self.send(event).is_err() {
            trace!("Frame receiver dropped");
        }
    }
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn emit(&self, _event: FrameEvent) {}
}

/// Keeps every frame in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<FrameEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FrameEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for CollectingSink {
    fn emit(&self, event: FrameEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn FrameSink>;
