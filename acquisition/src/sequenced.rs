//! Multi-step acquisitions with one waveform cycle per frame.
//!
//! The engine walks a sequence of [`Step`]s with one step of look-ahead. For
//! each step it composes the buffer, waits for the previous camera operation
//! to finish, lets the previous buffer play out, loads the new one, arms a
//! camera thread and starts playback. Waveform preparation for a step thus
//! overlaps the readout of the step before it, while the gate keeps at most
//! one camera operation in flight.
//!
//! Per-step hardware and camera failures are logged and counted; the run
//! always continues to the next step and always ends with teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use hardware::{AnalogOutputTask, TaskLease, TaskOwner, XyStage};
use serde::Serialize;
use shared::{CameraInterface, Settings, Step};
use tracing::{debug, error, info, warn};

use crate::camera_gate::CameraGate;
use crate::camera_operation::{CameraOperation, CameraStats};
use crate::cycle::{self, CycleOutcome, EngineTimeouts};
use crate::error::AcquisitionResult;
use crate::frame_event::{FrameKind, SharedSink};
use crate::waveform::{CycleMode, WaveformLibrary};

/// Stage shared between the engines and whoever else moves it.
pub type SharedStage = Arc<Mutex<dyn XyStage>>;

/// Lease holder name used by the sequenced engine.
pub const SEQUENCE_HOLDER: &str = "sequence";

/// Cooperative cancellation for a running sequence.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Stop the sequence before its next step.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// What happened during one sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceSummary {
    /// Steps taken from the sequence
    pub steps: usize,
    /// Cycles whose playback was started
    pub cycles_started: usize,
    /// Steps skipped because the buffer could not be loaded
    pub write_failures: usize,
    /// Steps whose playback did not start
    pub start_failures: usize,
    /// Steps whose camera thread never armed
    pub arm_failures: usize,
    /// Frames delivered to the sink
    pub frames: u64,
    /// Camera operations that failed
    pub camera_failures: u64,
    /// Teardown actions that failed
    pub teardown_failures: usize,
    /// Stopped early by a cancel request
    pub cancelled: bool,
    /// Stopped early by a configuration error
    pub aborted: Option<String>,
}

/// Drives the output task and the camera in lock-step through a sequence.
pub struct SequencedAcquisitionEngine<T: AnalogOutputTask, C: CameraInterface + 'static> {
    task: TaskLease<T>,
    camera: Arc<Mutex<C>>,
    stage: Option<SharedStage>,
    library: Arc<WaveformLibrary>,
    settings: Settings,
    sink: SharedSink,
    gate: Arc<CameraGate>,
    cancel: CancelHandle,
    timeouts: EngineTimeouts,
}

impl<T: AnalogOutputTask, C: CameraInterface + 'static> SequencedAcquisitionEngine<T, C> {
    /// Take the output task from `owner` for the lifetime of the engine.
    pub fn new(
        owner: &TaskOwner<T>,
        camera: Arc<Mutex<C>>,
        library: Arc<WaveformLibrary>,
        settings: Settings,
        sink: SharedSink,
    ) -> AcquisitionResult<Self> {
        library.validate(&settings)?;
        let task = owner.lease(SEQUENCE_HOLDER)?;
        Ok(Self {
            task,
            camera,
            stage: None,
            library,
            settings,
            sink,
            gate: CameraGate::new(),
            cancel: CancelHandle::default(),
            timeouts: EngineTimeouts::default(),
        })
    }

    /// Move the stage for steps with a lateral offset.
    pub fn with_stage(mut self, stage: SharedStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Use an existing cancel handle, e.g. one held by a controller.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels the running sequence from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The gate guarding this engine's camera operations.
    pub fn gate(&self) -> Arc<CameraGate> {
        self.gate.clone()
    }

    /// Replace the settings used by the next run.
    pub fn update_settings(&mut self, settings: Settings) -> AcquisitionResult<()> {
        self.library.validate(&settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Run every step of `steps`, then tear down.
    pub fn run<I>(&mut self, steps: I) -> SequenceSummary
    where
        I: IntoIterator<Item = Step>,
    {
        self.cancel.reset();
        let stats = Arc::new(CameraStats::default());
        let mut summary = SequenceSummary::default();
        let mut last_camera: Option<JoinHandle<()>> = None;
        let mut playback_timeout = self.timeouts.playback_margin;

        let origin = self.stage_position();
        let restore_exposure = self.camera_exposure();
        let base_exposure = self.settings.camera_exposure();
        self.set_camera_exposure(base_exposure);
        let mut exposure_overridden = false;

        let sample_rate = self.settings.sample_rate();
        let pre_trigger_delay = self.settings.pre_trigger_delay();

        info!("Sequence started at {sample_rate} Hz");

        let mut steps = steps.into_iter().peekable();
        while let Some(mut step) = steps.next() {
            if self.cancel.is_cancelled() {
                info!(step = step.index, "Sequence cancelled");
                summary.cancelled = true;
                break;
            }
            summary.steps += 1;

            let waveform = match self.library.compose_step(
                &self.settings,
                CycleMode::Sequenced,
                &step,
                steps.peek(),
            ) {
                Ok(waveform) => waveform,
                Err(e) => {
                    error!(step = step.index, "Cannot compose cycle, aborting: {e}");
                    summary.aborted = Some(e.to_string());
                    break;
                }
            };
            let overrides = step.strip_encoded_overrides();

            let token = self.gate.acquire();

            match overrides.exposure {
                Some(exposure) => {
                    let camera_exposure = self
                        .settings
                        .with_exposure_time(exposure)
                        .map(|s| s.camera_exposure())
                        .unwrap_or(base_exposure);
                    self.set_camera_exposure(camera_exposure);
                    exposure_overridden = true;
                }
                None if exposure_overridden => {
                    self.set_camera_exposure(base_exposure);
                    exposure_overridden = false;
                }
                None => {}
            }
            if let Some((x, y)) = step.xy {
                self.move_stage(origin, (x, y), step.index);
            }

            if let Err(e) = cycle::finish_playback(&mut *self.task, playback_timeout) {
                warn!(step = step.index, "Previous playback did not finish cleanly: {e}");
            }

            let operation = CameraOperation {
                camera: self.camera.clone(),
                sink: self.sink.clone(),
                stats: stats.clone(),
                kind: FrameKind::Sequenced,
                step: step.clone(),
                cycle_samples: waveform.columns(),
                sample_rate,
                failure_flag: None,
            };

            let (outcome, handle) = cycle::fire(
                &mut *self.task,
                &self.gate,
                token,
                operation,
                &waveform,
                sample_rate,
                pre_trigger_delay,
                &self.timeouts,
            );
            if handle.is_some() {
                last_camera = handle;
            }
            playback_timeout = cycle::playback_timeout(&waveform, sample_rate, &self.timeouts);

            match outcome {
                CycleOutcome::Started => {
                    debug!(step = step.index, channel = %step.channel, "Cycle started");
                    summary.cycles_started += 1;
                }
                CycleOutcome::WriteFailed(e) => {
                    warn!(step = step.index, "Write failed, skipping step: {e}");
                    summary.write_failures += 1;
                }
                CycleOutcome::NotArmed => {
                    warn!(step = step.index, "Camera did not arm, skipping step");
                    summary.arm_failures += 1;
                }
                CycleOutcome::StartFailed(e) => {
                    warn!(
                        step = step.index,
                        "Start failed, camera will time out and drop its frame: {e}"
                    );
                    summary.start_failures += 1;
                }
            }
        }

        summary.teardown_failures =
            self.teardown(origin, restore_exposure, playback_timeout, last_camera);
        summary.frames = stats.frames();
        summary.camera_failures = stats.failures();

        info!(
            "Sequence finished: {} steps, {} frames, {} camera failures",
            summary.steps, summary.frames, summary.camera_failures
        );
        summary
    }

    /// Stop playback, park the outputs, wait for the last frame and put the
    /// camera and stage back. Every action runs even if an earlier one fails.
    ///
    /// Returns the number of failed actions.
    fn teardown(
        &mut self,
        origin: Option<(f64, f64)>,
        restore_exposure: Duration,
        playback_timeout: Duration,
        last_camera: Option<JoinHandle<()>>,
    ) -> usize {
        let mut failures = 0;
        let sample_rate = self.settings.sample_rate();

        if let Err(e) = cycle::finish_playback(&mut *self.task, playback_timeout) {
            error!("Teardown: stopping playback failed: {e}");
            failures += 1;
        }

        if let Err(e) = cycle::park(&mut *self.task, sample_rate, self.timeouts.playback_margin) {
            error!("Teardown: parking outputs failed: {e}");
            failures += 1;
        }

        if self.gate.wait_idle(self.timeouts.drain) {
            if let Some(handle) = last_camera {
                if handle.join().is_err() {
                    error!("Teardown: camera thread panicked");
                    failures += 1;
                }
            }
        } else {
            error!(
                "Teardown: camera still busy after {:?}, detaching",
                self.timeouts.drain
            );
            failures += 1;
        }

        {
            let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = camera.set_exposure(restore_exposure) {
                error!("Teardown: restoring camera exposure failed: {e}");
                failures += 1;
            }
        }

        if let (Some(stage), Some((x, y))) = (&self.stage, origin) {
            let mut stage = stage.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = stage.set_xy_position(x, y) {
                error!("Teardown: returning stage to origin failed: {e}");
                failures += 1;
            }
        }

        failures
    }

    fn camera_exposure(&self) -> Duration {
        self.camera
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exposure()
    }

    fn set_camera_exposure(&self, exposure: Duration) {
        let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = camera.set_exposure(exposure) {
            warn!("Setting camera exposure to {exposure:?} failed: {e}");
        }
    }

    fn stage_position(&self) -> Option<(f64, f64)> {
        let stage = self.stage.as_ref()?;
        let mut stage = stage.lock().unwrap_or_else(PoisonError::into_inner);
        match stage.xy_position() {
            Ok(position) => Some(position),
            Err(e) => {
                warn!("Reading stage position failed, origin will not be restored: {e}");
                None
            }
        }
    }

    fn move_stage(&self, origin: Option<(f64, f64)>, offset: (f64, f64), index: usize) {
        let (Some(stage), Some((x0, y0))) = (&self.stage, origin) else {
            return;
        };
        let mut stage = stage.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = stage.set_xy_position(x0 + offset.0, y0 + offset.1) {
            warn!(step = index, "Stage move failed: {e}");
        }
    }
}
