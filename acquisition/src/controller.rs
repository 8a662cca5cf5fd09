//! Switches the output task and camera between live mode and sequences.

use std::sync::{Arc, Mutex};

use hardware::{AnalogOutputTask, TaskOwner};
use shared::{CameraInterface, Settings, Step};
use tracing::info;

use crate::cycle::EngineTimeouts;
use crate::error::AcquisitionResult;
use crate::frame_event::SharedSink;
use crate::live::{LiveAcquisitionEngine, LiveReport};
use crate::sequenced::{CancelHandle, SequenceSummary, SequencedAcquisitionEngine, SharedStage};
use crate::waveform::WaveformLibrary;

/// Owns the output task, the camera and the current settings.
///
/// Live mode runs in the background between calls. Starting a sequence or a
/// snap stops live mode first and leaves it stopped.
pub struct AcquisitionController<T: AnalogOutputTask + 'static, C: CameraInterface + 'static> {
    owner: TaskOwner<T>,
    camera: Arc<Mutex<C>>,
    stage: Option<SharedStage>,
    library: Arc<WaveformLibrary>,
    settings: Settings,
    sink: SharedSink,
    live: LiveAcquisitionEngine<T, C>,
    cancel: CancelHandle,
    timeouts: EngineTimeouts,
}

impl<T: AnalogOutputTask + 'static, C: CameraInterface + 'static> AcquisitionController<T, C> {
    pub fn new(task: T, camera: C, settings: Settings, sink: SharedSink) -> AcquisitionResult<Self> {
        Self::with_library(task, camera, WaveformLibrary::new(), settings, sink)
    }

    /// Build around a custom device set.
    pub fn with_library(
        task: T,
        camera: C,
        library: WaveformLibrary,
        settings: Settings,
        sink: SharedSink,
    ) -> AcquisitionResult<Self> {
        let owner = TaskOwner::new(task);
        let camera = Arc::new(Mutex::new(camera));
        let library = Arc::new(library);
        let live = LiveAcquisitionEngine::new(
            owner.clone(),
            camera.clone(),
            library.clone(),
            settings.clone(),
            sink.clone(),
        )?;

        Ok(Self {
            owner,
            camera,
            stage: None,
            library,
            settings,
            sink,
            live,
            cancel: CancelHandle::default(),
            timeouts: EngineTimeouts::default(),
        })
    }

    pub fn with_stage(mut self, stage: SharedStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self.live.set_timeouts(timeouts);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registry holding the output task between runs.
    pub fn task_owner(&self) -> &TaskOwner<T> {
        &self.owner
    }

    pub fn camera(&self) -> Arc<Mutex<C>> {
        self.camera.clone()
    }

    /// Handle that cancels whichever sequence is running.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_live(&self) -> bool {
        self.live.is_running()
    }

    /// Number of live loops started so far.
    pub fn live_loops_started(&self) -> u64 {
        self.live.loops_started()
    }

    pub fn start_live(&mut self) -> AcquisitionResult<()> {
        self.live.start()
    }

    pub fn stop_live(&mut self) -> Option<LiveReport> {
        self.live.stop()
    }

    /// Validate and apply new settings. A running live loop is restarted on
    /// them.
    pub fn update_settings(&mut self, settings: Settings) -> AcquisitionResult<()> {
        self.live.update_settings(settings.clone())?;
        self.settings = settings;
        info!("Settings updated");
        Ok(())
    }

    /// Take a single frame on the live channel.
    pub fn snap(&mut self) -> AcquisitionResult<LiveReport> {
        self.stop_live();
        self.live.snap()
    }

    /// Run a sequence to completion, blocking the caller.
    pub fn run_sequence<I>(&mut self, steps: I) -> AcquisitionResult<SequenceSummary>
    where
        I: IntoIterator<Item = Step>,
    {
        if self.stop_live().is_some() {
            info!("Live mode stopped for sequence");
        }

        let mut engine = SequencedAcquisitionEngine::new(
            &self.owner,
            self.camera.clone(),
            self.library.clone(),
            self.settings.clone(),
            self.sink.clone(),
        )?
        .with_cancel_handle(self.cancel.clone())
        .with_timeouts(self.timeouts);
        if let Some(stage) = &self.stage {
            engine = engine.with_stage(stage.clone());
        }

        Ok(engine.run(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_event::CollectingSink;
    use hardware::SimulatedOutputTask;
    use shared::camera_interface::mock::MockCamera;
    use shared::trigger_line;
    use std::time::Duration;

    fn fast_settings() -> Settings {
        Settings::default()
            .edited(|file| {
                file.sample_rate = 1000.0;
                file.exposure_time = 0.02;
                file.readout_time = 0.01;
                file.pre_trigger_delay_ms = 0.0;
                file.live.fps = 50.0;
            })
            .unwrap()
    }

    fn controller(sink: &CollectingSink) -> AcquisitionController<SimulatedOutputTask, MockCamera> {
        let (tx, rx) = trigger_line();
        let task = SimulatedOutputTask::new().with_trigger(tx);
        let camera = MockCamera::new(4, 4).with_trigger(rx);
        AcquisitionController::new(task, camera, fast_settings(), Arc::new(sink.clone())).unwrap()
    }

    #[test]
    fn test_sequence_stops_live_first() {
        let sink = CollectingSink::new();
        let mut controller = controller(&sink);

        controller.start_live().unwrap();
        assert!(controller.is_live());
        assert!(controller.task_owner().is_leased());

        let steps = (0..3).map(|i| Step::new(i, "488"));
        let summary = controller.run_sequence(steps).unwrap();

        assert!(!controller.is_live());
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.frames, 3);
        assert!(!controller.task_owner().is_leased());
    }

    #[test]
    fn test_snap_produces_one_frame() {
        let sink = CollectingSink::new();
        let mut controller = controller(&sink);

        let report = controller.snap().unwrap();

        assert_eq!(report.cycles_started, 1);
        assert_eq!(report.frames, 1);
        assert_eq!(sink.len(), 1);
        assert!(!controller.task_owner().is_leased());
    }

    #[test]
    fn test_update_settings_restarts_live() {
        let sink = CollectingSink::new();
        let mut controller = controller(&sink);
        controller.start_live().unwrap();

        let faster = controller
            .settings()
            .edited(|file| file.exposure_time = 0.01)
            .unwrap();
        controller.update_settings(faster).unwrap();

        assert!(controller.is_live());
        assert_eq!(controller.live_loops_started(), 2);
        assert_eq!(controller.settings().exposure_time(), 0.01);
        controller.stop_live();
        assert!(!controller.is_live());
    }

    #[test]
    fn test_update_settings_while_idle_does_not_start_live() {
        let sink = CollectingSink::new();
        let mut controller = controller(&sink);

        let settings = controller
            .settings()
            .edited(|file| file.live.channel = "488".to_string())
            .unwrap();
        controller.update_settings(settings).unwrap();

        assert!(!controller.is_live());
        assert_eq!(controller.live_loops_started(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(sink.is_empty());
    }
}
