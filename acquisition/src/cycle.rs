//! Steps shared by every engine for playing one cycle.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use hardware::{load_and_start, AnalogOutputTask, OutputError, OutputResult};
use shared::{CameraInterface, WaveformMatrix};
use tracing::debug;

use crate::camera_gate::{CameraGate, InFlightToken};
use crate::camera_operation::CameraOperation;

/// Samples in the buffer used to park the outputs.
pub const PARK_SAMPLES: usize = 16;

/// Bounds on the blocking waits inside the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// Camera thread arming after spawn
    pub arm: Duration,
    /// Added to the buffer duration when waiting for playback to finish
    pub playback_margin: Duration,
    /// Last camera operation finishing at teardown
    pub drain: Duration,
    /// Old live loop stopping during a restart
    pub restart: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            arm: Duration::from_secs(2),
            playback_margin: Duration::from_secs(1),
            drain: Duration::from_secs(5),
            restart: Duration::from_secs(5),
        }
    }
}

/// What happened to one cycle.
#[derive(Debug)]
pub(crate) enum CycleOutcome {
    /// Playback started with the camera armed
    Started,
    /// Buffer was not accepted; no camera thread was spawned
    WriteFailed(OutputError),
    /// Camera thread did not arm in time; playback not started
    NotArmed,
    /// Camera armed but playback did not start
    StartFailed(OutputError),
}

/// Wait for the playing buffer to end, then stop the task.
///
/// The task is stopped even if the wait fails.
pub(crate) fn finish_playback<T: AnalogOutputTask + ?Sized>(
    task: &mut T,
    timeout: Duration,
) -> OutputResult<()> {
    if !task.is_running() {
        return Ok(());
    }
    let waited = task.wait_until_done(timeout);
    let stopped = task.stop();
    waited.and(stopped)
}

/// Play a short resting buffer so every output is left at its resting level.
///
/// The task is stopped afterwards whatever happens.
pub(crate) fn park<T: AnalogOutputTask + ?Sized>(
    task: &mut T,
    sample_rate: f64,
    timeout: Duration,
) -> OutputResult<()> {
    let resting = WaveformMatrix::resting(PARK_SAMPLES);
    let played = load_and_start(task, sample_rate, &resting)
        .and_then(|_| task.wait_until_done(resting.duration(sample_rate) + timeout));
    let stopped = task.stop();
    debug!("Outputs parked");
    played.and(stopped)
}

/// Playback duration of `waveform` plus the margin.
pub(crate) fn playback_timeout(
    waveform: &WaveformMatrix,
    sample_rate: f64,
    timeouts: &EngineTimeouts,
) -> Duration {
    waveform.duration(sample_rate) + timeouts.playback_margin
}

/// Load `waveform`, hand `token` to a camera thread, and start playback once
/// the camera is armed.
///
/// The previous buffer must already have finished playing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fire<T, C>(
    task: &mut T,
    gate: &CameraGate,
    token: InFlightToken,
    operation: CameraOperation<C>,
    waveform: &WaveformMatrix,
    sample_rate: f64,
    pre_trigger_delay: Duration,
    timeouts: &EngineTimeouts,
) -> (CycleOutcome, Option<JoinHandle<()>>)
where
    T: AnalogOutputTask + ?Sized,
    C: CameraInterface + 'static,
{
    let loaded = task
        .configure(sample_rate, waveform.columns())
        .and_then(|_| task.write(waveform));
    if let Err(e) = loaded {
        return (CycleOutcome::WriteFailed(e), None);
    }

    let ticket = token.ticket();
    let Some(handle) = operation.spawn(token) else {
        return (CycleOutcome::NotArmed, None);
    };
    if !gate.wait_armed(ticket, timeouts.arm) {
        return (CycleOutcome::NotArmed, Some(handle));
    }

    if !pre_trigger_delay.is_zero() {
        thread::sleep(pre_trigger_delay);
    }

    match task.start() {
        Ok(()) => (CycleOutcome::Started, Some(handle)),
        Err(e) => (CycleOutcome::StartFailed(e), Some(handle)),
    }
}
