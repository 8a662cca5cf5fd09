//! Engine behavior against the simulated output task and the mock camera.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use acquisition::{
    CameraGate, CollectingSink, EngineTimeouts, LiveAcquisitionEngine, SequencePlan,
    SequencedAcquisitionEngine, SharedStage, WaveformLibrary,
};
use hardware::{SimulatedOutputTask, SimulatedStage, SimulatedTaskHandle, TaskOwner};
use shared::camera_interface::mock::{MockCamera, MockCameraStats};
use shared::camera_interface::{CameraResult, Frame};
use shared::{trigger_line, CameraInterface, OutputRow, Settings, Step};

/// 20 ms exposure and 10 ms readout at 1 kHz: 37-sample cycles.
fn fast_settings() -> Settings {
    Settings::default()
        .edited(|file| {
            file.sample_rate = 1000.0;
            file.exposure_time = 0.02;
            file.readout_time = 0.01;
            file.pre_trigger_delay_ms = 1.0;
            file.live.fps = 100.0;
        })
        .unwrap()
}

struct Rig {
    owner: TaskOwner<SimulatedOutputTask>,
    task: SimulatedTaskHandle,
    camera: Arc<Mutex<MockCamera>>,
    camera_stats: Arc<MockCameraStats>,
    sink: CollectingSink,
}

fn rig(readout: Duration) -> Rig {
    let (tx, rx) = trigger_line();
    let task = SimulatedOutputTask::new().with_trigger(tx);
    let handle = task.handle();
    let camera = MockCamera::new(8, 8).with_trigger(rx).with_readout(readout);
    let camera_stats = camera.stats();
    Rig {
        owner: TaskOwner::new(task),
        task: handle,
        camera: Arc::new(Mutex::new(camera)),
        camera_stats,
        sink: CollectingSink::new(),
    }
}

fn sequenced(rig: &Rig) -> SequencedAcquisitionEngine<SimulatedOutputTask, MockCamera> {
    SequencedAcquisitionEngine::new(
        &rig.owner,
        rig.camera.clone(),
        Arc::new(WaveformLibrary::new()),
        fast_settings(),
        Arc::new(rig.sink.clone()),
    )
    .unwrap()
}

fn live(rig: &Rig) -> LiveAcquisitionEngine<SimulatedOutputTask, MockCamera> {
    LiveAcquisitionEngine::new(
        rig.owner.clone(),
        rig.camera.clone(),
        Arc::new(WaveformLibrary::new()),
        fast_settings(),
        Arc::new(rig.sink.clone()),
    )
    .unwrap()
}

fn assert_parked(task: &SimulatedTaskHandle) {
    assert!(!task.is_running());
    assert!(task.last_played().unwrap().is_resting());
}

#[test]
fn test_sequence_delivers_one_frame_per_step() {
    let rig = rig(Duration::ZERO);
    let mut engine = sequenced(&rig);

    let plan = SequencePlan::new(["488", "561"]).with_z_positions(vec![0.0, 1.0]);
    let summary = engine.run(plan.steps());

    assert_eq!(summary.steps, 4);
    assert_eq!(summary.cycles_started, 4);
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.teardown_failures, 0);
    assert!(!summary.cancelled);

    let events = rig.sink.events();
    let indices: Vec<usize> = events.iter().map(|e| e.step.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    // The waveform already applied z, so it does not travel with the frame
    assert!(events.iter().all(|e| e.step.z.is_none()));

    // Four cycles plus the parking buffer
    assert_eq!(rig.task.start_count(), 5);
    assert_eq!(rig.task.pulse_count(), 4);
    assert_parked(&rig.task);
}

/// Mock camera that counts exposures made while the engine's gate was open.
struct GateWatchingCamera {
    inner: MockCamera,
    gate: Arc<OnceLock<Arc<CameraGate>>>,
    ungated: Arc<AtomicUsize>,
}

impl GateWatchingCamera {
    fn held(&self) -> bool {
        self.gate.get().is_some_and(|gate| gate.is_in_flight())
    }
}

impl CameraInterface for GateWatchingCamera {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn exposure(&self) -> Duration {
        self.inner.exposure()
    }

    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()> {
        self.inner.set_exposure(exposure)
    }

    fn expose_and_readout(&mut self) -> CameraResult<Frame> {
        let held_before = self.held();
        let frame = self.inner.expose_and_readout();
        if !held_before || !self.held() {
            self.ungated.fetch_add(1, Ordering::SeqCst);
        }
        frame
    }
}

#[test]
fn test_camera_operations_hold_gate_and_never_overlap() {
    // Readout longer than the cycle forces each step to wait on the gate
    let (tx, rx) = trigger_line();
    let task = SimulatedOutputTask::new().with_trigger(tx);
    let owner = TaskOwner::new(task);
    let gate_slot = Arc::new(OnceLock::new());
    let ungated = Arc::new(AtomicUsize::new(0));
    let camera = GateWatchingCamera {
        inner: MockCamera::new(8, 8)
            .with_trigger(rx)
            .with_readout(Duration::from_millis(50)),
        gate: gate_slot.clone(),
        ungated: ungated.clone(),
    };
    let sink = CollectingSink::new();
    let mut engine = SequencedAcquisitionEngine::new(
        &owner,
        Arc::new(Mutex::new(camera)),
        Arc::new(WaveformLibrary::new()),
        fast_settings(),
        Arc::new(sink.clone()),
    )
    .unwrap();
    let gate = engine.gate();
    gate_slot.set(gate.clone()).unwrap();

    let summary = engine.run((0..5).map(|i| Step::new(i, "488")));

    assert_eq!(summary.frames, 5);
    assert_eq!(ungated.load(Ordering::SeqCst), 0);
    assert_eq!(gate.acquisitions(), 5);
    assert!(!gate.is_in_flight());

    let events = sink.events();
    assert_eq!(events.len(), 5);
    for pair in events.windows(2) {
        assert!(pair[1].timing.armed_at >= pair[0].timing.completed_at);
    }
}

#[test]
fn test_teardown_after_write_and_camera_failures() {
    let rig = rig(Duration::ZERO);
    let stage = SimulatedStage::new(1000.0);
    let shared_stage: SharedStage = Arc::new(Mutex::new(stage.clone()));
    let mut engine = sequenced(&rig).with_stage(shared_stage);

    rig.task.fail_next_writes(1);
    rig.camera_stats.fail_next(1);

    let steps = (0..4).map(|i| Step::new(i, "561").with_xy(10.0 * i as f64, 0.0));
    let summary = engine.run(steps);

    assert_eq!(summary.steps, 4);
    assert_eq!(summary.write_failures, 1);
    assert_eq!(summary.cycles_started, 3);
    assert_eq!(summary.camera_failures, 1);
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.teardown_failures, 0);
    assert_eq!(rig.sink.len(), 2);

    assert_parked(&rig.task);
    assert_eq!(stage.moves().last(), Some(&(0.0, 0.0)));

    let exposure = rig.camera.lock().unwrap().exposure();
    assert_eq!(exposure, Duration::from_millis(100));
}

#[test]
fn test_start_failure_skips_step_and_still_parks() {
    let rig = rig(Duration::ZERO);
    let mut engine = sequenced(&rig).with_timeouts(EngineTimeouts {
        drain: Duration::from_secs(3),
        ..EngineTimeouts::default()
    });
    rig.task.fail_next_starts(1);

    let summary = engine.run((0..2).map(|i| Step::new(i, "488")));

    assert_eq!(summary.start_failures, 1);
    assert_eq!(summary.cycles_started, 1);
    assert_parked(&rig.task);
}

#[test]
fn test_cancel_stops_before_next_step() {
    let rig = rig(Duration::ZERO);
    let mut engine = sequenced(&rig);
    let cancel = engine.cancel_handle();

    let steps = (0..100).map(move |i| {
        if i == 3 {
            cancel.cancel();
        }
        Step::new(i, "488")
    });
    let summary = engine.run(steps);

    assert!(summary.cancelled);
    assert!(summary.steps < 100);
    assert_parked(&rig.task);
}

#[test]
fn test_sequence_holds_task_until_dropped() {
    let rig = rig(Duration::ZERO);
    let engine = sequenced(&rig);

    assert_eq!(rig.owner.holder().as_deref(), Some("sequence"));
    let mut live = live(&rig);
    assert!(live.start().is_err());
    assert!(!live.is_running());

    drop(engine);
    assert!(!rig.owner.is_leased());
}

#[test]
fn test_live_runs_until_stopped() {
    let rig = rig(Duration::ZERO);
    let mut engine = live(&rig);

    engine.start().unwrap();
    assert!(engine.is_running());
    assert!(engine.start().is_err());
    thread::sleep(Duration::from_millis(200));

    let report = engine.stop().unwrap();

    assert!(!engine.is_running());
    assert!(report.cycles_started >= 2);
    assert!(report.frames >= 1);
    assert!(!report.stopped_by_camera_failure);
    assert!(!rig.owner.is_leased());
    assert_parked(&rig.task);
    assert!(rig
        .sink
        .events()
        .iter()
        .all(|e| e.step.channel == fast_settings().live().channel));
}

#[test]
fn test_restart_converges_to_single_loop() {
    let rig = rig(Duration::ZERO);
    let mut engine = live(&rig);
    engine.start().unwrap();

    for _ in 0..5 {
        engine.restart(None).unwrap();
        assert!(engine.is_running());
        assert_eq!(rig.owner.holder().as_deref(), Some("live"));
    }

    assert_eq!(engine.loops_started(), 6);
    assert_eq!(rig.owner.leases_granted(), 6);

    engine.stop();
    assert!(!engine.is_running());
    assert!(!rig.owner.is_leased());
}

#[test]
fn test_live_cancel_mid_camera_operation_plays_safe_cycles() {
    // Readout far longer than a cycle keeps the camera busy after cancel
    let rig = rig(Duration::from_millis(300));
    let mut engine = live(&rig);

    engine.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(engine.gate().is_in_flight());

    let report = engine.stop().unwrap();

    assert!(report.safe_cycles >= 1);
    assert!(!report.drain_timed_out);
    assert!(!engine.gate().is_in_flight());
    assert_parked(&rig.task);

    let played = rig.task.played();
    let safe = &played[played.len() - 2];
    assert!(safe.is_safe());
    assert!(safe
        .row(OutputRow::CameraTrigger)
        .iter()
        .all(|&v| v == 0.0));
}

#[test]
fn test_live_drain_recovers_from_failed_safe_cycle() {
    let rig = rig(Duration::from_millis(300));
    let mut engine = live(&rig);

    engine.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(engine.gate().is_in_flight());

    // The loop is parked on the gate, so the first write is the drain's
    rig.task.fail_next_writes(1);
    let report = engine.stop().unwrap();

    assert!(report.safe_cycles >= 1);
    assert!(!report.drain_timed_out);
    assert!(!engine.gate().is_in_flight());
    assert!(!rig.owner.is_leased());
    assert_parked(&rig.task);
}

#[test]
fn test_live_stops_on_camera_failure() {
    let rig = rig(Duration::ZERO);
    rig.camera_stats.fail_next(1);
    let mut engine = live(&rig);

    engine.start().unwrap();
    let mut waited = Duration::ZERO;
    while engine.is_running() && waited < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }

    assert!(!engine.is_running());
    let report = engine.stop().unwrap();
    assert!(report.stopped_by_camera_failure);
    assert_eq!(report.camera_failures, 1);
    assert_parked(&rig.task);
}

#[test]
fn test_snap_takes_one_frame() {
    let rig = rig(Duration::ZERO);
    let mut engine = live(&rig);

    let report = engine.snap().unwrap();

    assert_eq!(report.cycles_started, 1);
    assert_eq!(report.frames, 1);
    assert_eq!(rig.sink.len(), 1);
    assert_eq!(rig.sink.events()[0].kind.to_string(), "snap");
    assert!(!rig.owner.is_leased());
    assert_parked(&rig.task);
}
