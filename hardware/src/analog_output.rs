//! Streaming analog output task interface.
//!
//! Abstracts the multi-channel analog output hardware (an NI-DAQmx task with
//! eight `ao` channels in the reference setup) so the acquisition engines can
//! run against real or simulated hardware.
//!
//! # Regeneration
//!
//! Tasks run with regeneration disabled: each [`start`](AnalogOutputTask::start)
//! plays exactly the buffer handed to the preceding
//! [`write`](AnalogOutputTask::write) and never replays old samples. A start
//! without a fresh write is an error.
//!
//! # Lifecycle
//!
//! ```text
//! configure -> write -> start -> wait_until_done -> stop -> write -> ...
//! ```
//!
//! Writing while a buffer is still playing is rejected; callers stop the task
//! first.

use std::time::Duration;

use shared::WaveformMatrix;
use thiserror::Error;

/// Errors reported by an analog output task.
#[derive(Error, Debug, Clone)]
pub enum OutputError {
    /// Buffer rejected by the device.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Task could not be started.
    #[error("Start failed: {0}")]
    StartFailed(String),

    /// Timing configuration rejected.
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    /// Buffer shape does not match the task.
    #[error("Buffer has {actual} channels, task has {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    /// Write attempted while a buffer is playing.
    #[error("Task is running")]
    Busy,

    /// Start attempted without a fresh buffer.
    #[error("No fresh samples to play (regeneration disabled)")]
    NoFreshSamples,

    /// Playback did not finish in time.
    #[error("Playback not finished after {0:?}")]
    Timeout(Duration),
}

/// Result type for analog output operations.
pub type OutputResult<T> = Result<T, OutputError>;

/// A multi-channel analog output task with a finite, non-regenerating buffer.
pub trait AnalogOutputTask: Send {
    /// Number of analog output channels.
    fn channel_count(&self) -> usize;

    /// Set the sample clock and the buffer length for the next writes.
    fn configure(&mut self, sample_rate: f64, samples_per_cycle: usize) -> OutputResult<()>;

    /// Load a buffer for the next start.
    fn write(&mut self, waveform: &WaveformMatrix) -> OutputResult<()>;

    /// Start playing the loaded buffer.
    fn start(&mut self) -> OutputResult<()>;

    /// Block until the loaded buffer has been played out.
    fn wait_until_done(&mut self, timeout: Duration) -> OutputResult<()>;

    /// Stop the task. Stopping an idle task is a no-op.
    fn stop(&mut self) -> OutputResult<()>;

    /// True between a successful start and the following stop.
    fn is_running(&self) -> bool;
}

impl<T: AnalogOutputTask + ?Sized> AnalogOutputTask for Box<T> {
    fn channel_count(&self) -> usize {
        (**self).channel_count()
    }

    fn configure(&mut self, sample_rate: f64, samples_per_cycle: usize) -> OutputResult<()> {
        (**self).configure(sample_rate, samples_per_cycle)
    }

    fn write(&mut self, waveform: &WaveformMatrix) -> OutputResult<()> {
        (**self).write(waveform)
    }

    fn start(&mut self) -> OutputResult<()> {
        (**self).start()
    }

    fn wait_until_done(&mut self, timeout: Duration) -> OutputResult<()> {
        (**self).wait_until_done(timeout)
    }

    fn stop(&mut self) -> OutputResult<()> {
        (**self).stop()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Configure, load and start one buffer.
pub fn load_and_start<T: AnalogOutputTask + ?Sized>(
    task: &mut T,
    sample_rate: f64,
    waveform: &WaveformMatrix,
) -> OutputResult<()> {
    task.configure(sample_rate, waveform.columns())?;
    task.write(waveform)?;
    task.start()
}
