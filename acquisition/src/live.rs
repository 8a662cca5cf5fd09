//! Free-running live mode.
//!
//! A loop thread repeats one cycle on the live channel until cancelled,
//! paced to the live frame rate. The loop takes the output task lease when
//! it starts and gives it back when it ends, so a live loop and any other
//! user of the task can never drive it at the same time.
//!
//! When the loop is cancelled while a camera operation is still reading out,
//! it keeps the mechanics moving with safe cycles (light off, no trigger)
//! until that operation completes, then parks the outputs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hardware::{load_and_start, AnalogOutputTask, TaskLease, TaskOwner};
use serde::Serialize;
use shared::{CameraInterface, Settings, Step, WaveformMatrix};
use tracing::{debug, error, info, warn};

use crate::camera_gate::{CameraGate, InFlightToken};
use crate::camera_operation::{CameraOperation, CameraStats};
use crate::cycle::{self, CycleOutcome, EngineTimeouts};
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::frame_event::{FrameKind, SharedSink};
use crate::waveform::{CycleContext, CycleMode, WaveformLibrary};

/// Lease holder name used by the live loop.
pub const LIVE_HOLDER: &str = "live";

/// Lease holder name used by single snaps.
pub const SNAP_HOLDER: &str = "snap";

/// Polling interval for cancellable waits inside the loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest pause between checks while waiting for a loop to stop.
const MAX_RESTART_BACKOFF: Duration = Duration::from_millis(50);

/// What happened during one live loop or snap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveReport {
    pub cycles_started: usize,
    pub write_failures: usize,
    pub start_failures: usize,
    pub arm_failures: usize,
    /// Light-off cycles played while draining the last camera operation
    pub safe_cycles: usize,
    pub frames: u64,
    pub camera_failures: u64,
    /// Loop ended because a camera operation failed
    pub stopped_by_camera_failure: bool,
    /// Last camera operation was still running when the drain gave up
    pub drain_timed_out: bool,
    /// Loop ended on a configuration error
    pub aborted: Option<String>,
}

impl LiveReport {
    fn count(&mut self, outcome: &CycleOutcome, index: usize) {
        match outcome {
            CycleOutcome::Started => self.cycles_started += 1,
            CycleOutcome::WriteFailed(e) => {
                warn!(cycle = index, "Live write failed, skipping cycle: {e}");
                self.write_failures += 1;
            }
            CycleOutcome::NotArmed => {
                warn!(cycle = index, "Camera did not arm, skipping cycle");
                self.arm_failures += 1;
            }
            CycleOutcome::StartFailed(e) => {
                warn!(cycle = index, "Live start failed: {e}");
                self.start_failures += 1;
            }
        }
    }
}

/// Runs live mode and single snaps against a shared output task.
pub struct LiveAcquisitionEngine<T: AnalogOutputTask + 'static, C: CameraInterface + 'static> {
    owner: TaskOwner<T>,
    camera: Arc<Mutex<C>>,
    library: Arc<WaveformLibrary>,
    settings: Settings,
    sink: SharedSink,
    gate: Arc<CameraGate>,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<LiveReport>>,
    last_report: Option<LiveReport>,
    loops_started: u64,
    timeouts: EngineTimeouts,
}

impl<T: AnalogOutputTask + 'static, C: CameraInterface + 'static> LiveAcquisitionEngine<T, C> {
    pub fn new(
        owner: TaskOwner<T>,
        camera: Arc<Mutex<C>>,
        library: Arc<WaveformLibrary>,
        settings: Settings,
        sink: SharedSink,
    ) -> AcquisitionResult<Self> {
        library.validate(&settings)?;
        Ok(Self {
            owner,
            camera,
            library,
            settings,
            sink,
            gate: CameraGate::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            last_report: None,
            loops_started: 0,
            timeouts: EngineTimeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Timeouts used by loops started from now on.
    pub fn set_timeouts(&mut self, timeouts: EngineTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The gate guarding this engine's camera operations.
    pub fn gate(&self) -> Arc<CameraGate> {
        self.gate.clone()
    }

    /// True from [`start`](Self::start) until the loop has returned the task.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of loops started over the engine's lifetime.
    pub fn loops_started(&self) -> u64 {
        self.loops_started
    }

    /// Report of the most recently finished loop.
    pub fn last_report(&self) -> Option<&LiveReport> {
        self.last_report.as_ref()
    }

    /// Start the live loop.
    pub fn start(&mut self) -> AcquisitionResult<()> {
        if self.is_running() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        self.reap();

        let lease = self.owner.lease(LIVE_HOLDER)?;
        self.cancel.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let live_loop = self.make_loop(lease);
        let running = self.running.clone();
        let spawned = thread::Builder::new()
            .name("live-loop".to_string())
            .spawn(move || {
                let report = live_loop.run();
                running.store(false, Ordering::SeqCst);
                report
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.loops_started += 1;
                info!(
                    "Live mode started on channel {} at {} fps",
                    self.settings.live().channel,
                    self.settings.live().fps
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Cancel the loop and wait for it to hand the task back.
    ///
    /// Returns the loop's report, or None if nothing was running.
    pub fn stop(&mut self) -> Option<LiveReport> {
        self.cancel.store(true, Ordering::SeqCst);
        let report = self.reap();
        if report.is_some() {
            info!("Live mode stopped");
        }
        report
    }

    /// Cancel the running loop, wait for it to stop, and start a fresh one,
    /// optionally with new settings.
    pub fn restart(&mut self, settings: Option<Settings>) -> AcquisitionResult<()> {
        if let Some(settings) = &settings {
            self.library.validate(settings)?;
        }

        self.cancel.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.timeouts.restart;
        let mut backoff = Duration::from_millis(1);
        while self.is_running() {
            if Instant::now() >= deadline {
                return Err(AcquisitionError::RestartTimeout(self.timeouts.restart));
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
        }
        self.reap();

        if let Some(settings) = settings {
            self.settings = settings;
        }
        self.start()
    }

    /// Apply new settings, restarting the loop if it is running.
    pub fn update_settings(&mut self, settings: Settings) -> AcquisitionResult<()> {
        if self.is_running() {
            self.restart(Some(settings))
        } else {
            self.library.validate(&settings)?;
            self.settings = settings;
            Ok(())
        }
    }

    /// Run exactly one live cycle and wait for its frame.
    pub fn snap(&mut self) -> AcquisitionResult<LiveReport> {
        if self.is_running() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        self.reap();
        let lease = self.owner.lease(SNAP_HOLDER)?;
        Ok(self.make_loop(lease).snap())
    }

    fn make_loop(&self, lease: TaskLease<T>) -> LiveLoop<T, C> {
        LiveLoop {
            task: lease,
            camera: self.camera.clone(),
            library: self.library.clone(),
            settings: self.settings.clone(),
            sink: self.sink.clone(),
            gate: self.gate.clone(),
            cancel: self.cancel.clone(),
            timeouts: self.timeouts,
            stats: Arc::new(CameraStats::default()),
            camera_failed: Arc::new(AtomicBool::new(false)),
            last_camera: None,
            report: LiveReport::default(),
        }
    }

    /// Join a finished loop thread and keep its report.
    fn reap(&mut self) -> Option<LiveReport> {
        let handle = self.worker.take()?;
        match handle.join() {
            Ok(report) => {
                self.last_report = Some(report.clone());
                Some(report)
            }
            Err(_) => {
                error!("Live loop thread panicked");
                self.running.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

impl<T: AnalogOutputTask + 'static, C: CameraInterface + 'static> Drop
    for LiveAcquisitionEngine<T, C>
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by one live loop thread (or one snap).
struct LiveLoop<T: AnalogOutputTask, C: CameraInterface + 'static> {
    task: TaskLease<T>,
    camera: Arc<Mutex<C>>,
    library: Arc<WaveformLibrary>,
    settings: Settings,
    sink: SharedSink,
    gate: Arc<CameraGate>,
    cancel: Arc<AtomicBool>,
    timeouts: EngineTimeouts,
    stats: Arc<CameraStats>,
    camera_failed: Arc<AtomicBool>,
    last_camera: Option<JoinHandle<()>>,
    report: LiveReport,
}

impl<T: AnalogOutputTask, C: CameraInterface + 'static> LiveLoop<T, C> {
    fn live_step(&self, index: usize) -> Step {
        Step::new(index, self.settings.live().channel.clone())
    }

    fn compose(&self, step: &Step) -> Option<WaveformMatrix> {
        let ctx = CycleContext::new(&self.settings, CycleMode::Live, step, None);
        match self.library.compose(&ctx) {
            Ok(waveform) => Some(waveform),
            Err(e) => {
                error!("Cannot compose live cycle: {e}");
                None
            }
        }
    }

    fn prepare_camera(&self) {
        let exposure = self.settings.camera_exposure();
        let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = camera.set_exposure(exposure) {
            warn!("Setting live camera exposure to {exposure:?} failed: {e}");
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.camera_failed.load(Ordering::SeqCst)
    }

    /// Claim the gate, giving up if the loop is cancelled meanwhile.
    fn acquire_gate(&self) -> Option<InFlightToken> {
        loop {
            if self.cancelled() {
                return None;
            }
            if let Some(token) = self.gate.try_acquire_for(POLL_INTERVAL) {
                return Some(token);
            }
        }
    }

    /// Sleep for `duration`, returning early on cancel.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }

    /// Fire one cycle and wait for its playback.
    fn cycle(&mut self, token: InFlightToken, step: Step, kind: FrameKind, waveform: &WaveformMatrix) {
        let sample_rate = self.settings.sample_rate();
        let index = step.index;
        let operation = CameraOperation {
            camera: self.camera.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
            kind,
            step,
            cycle_samples: waveform.columns(),
            sample_rate,
            failure_flag: Some(self.camera_failed.clone()),
        };

        let (outcome, handle) = cycle::fire(
            &mut *self.task,
            &self.gate,
            token,
            operation,
            waveform,
            sample_rate,
            self.settings.pre_trigger_delay(),
            &self.timeouts,
        );
        if handle.is_some() {
            self.last_camera = handle;
        }
        self.report.count(&outcome, index);

        let timeout = cycle::playback_timeout(waveform, sample_rate, &self.timeouts);
        if let Err(e) = cycle::finish_playback(&mut *self.task, timeout) {
            warn!(cycle = index, "Live playback did not finish cleanly: {e}");
        }
    }

    fn run(mut self) -> LiveReport {
        self.prepare_camera();
        let period = self.settings.live_frame_period();
        let mut index = 0;

        while !self.cancelled() {
            let started = Instant::now();
            let step = self.live_step(index);
            let Some(waveform) = self.compose(&step) else {
                self.report.aborted = Some("live cycle could not be composed".to_string());
                break;
            };
            let Some(token) = self.acquire_gate() else {
                break;
            };
            self.cycle(token, step, FrameKind::Live, &waveform);
            index += 1;

            self.pause(period.saturating_sub(started.elapsed()));
        }

        if self.camera_failed.load(Ordering::SeqCst) {
            warn!("Live mode stopped after a camera failure");
            self.report.stopped_by_camera_failure = true;
        }
        self.shut_down()
    }

    fn snap(mut self) -> LiveReport {
        self.prepare_camera();
        let step = self.live_step(0);
        if let Some(waveform) = self.compose(&step) {
            let token = self.gate.acquire();
            self.cycle(token, step, FrameKind::Snap, &waveform);
        } else {
            self.report.aborted = Some("snap cycle could not be composed".to_string());
        }
        self.shut_down()
    }

    /// Drain the in-flight camera operation with safe cycles, park, and
    /// return the task.
    fn shut_down(mut self) -> LiveReport {
        let sample_rate = self.settings.sample_rate();
        let deadline = Instant::now() + self.timeouts.drain;

        if self.gate.is_in_flight() {
            let step = self.live_step(0);
            let ctx = CycleContext::new(&self.settings, CycleMode::Live, &step, None);
            match self.library.compose_safe(&ctx) {
                Ok(safe) => {
                    let timeout = cycle::playback_timeout(&safe, sample_rate, &self.timeouts);
                    while self.gate.is_in_flight() && Instant::now() < deadline {
                        let played = load_and_start(&mut *self.task, sample_rate, &safe)
                            .and_then(|_| cycle::finish_playback(&mut *self.task, timeout));
                        match played {
                            Ok(()) => self.report.safe_cycles += 1,
                            Err(e) => {
                                warn!("Safe cycle failed: {e}");
                                if let Err(e) = self.task.stop() {
                                    warn!("Stopping outputs after failed safe cycle: {e}");
                                }
                                thread::sleep(POLL_INTERVAL);
                            }
                        }
                    }
                }
                Err(e) => error!("Cannot compose safe cycle: {e}"),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.gate.wait_idle(remaining) {
            if let Some(handle) = self.last_camera.take() {
                if handle.join().is_err() {
                    error!("Live camera thread panicked");
                }
            }
        } else {
            warn!(
                "Camera still busy after {:?}, detaching",
                self.timeouts.drain
            );
            self.report.drain_timed_out = true;
        }

        if let Err(e) = cycle::park(&mut *self.task, sample_rate, self.timeouts.playback_margin) {
            error!("Parking outputs after live mode failed: {e}");
        }

        self.report.frames = self.stats.frames();
        self.report.camera_failures = self.stats.failures();
        debug!(
            "Live loop finished: {} cycles, {} safe cycles, {} frames",
            self.report.cycles_started, self.report.safe_cycles, self.report.frames
        );
        self.report
    }
}
