//! The short-lived thread that runs one camera exposure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use shared::{CameraInterface, Step};
use tracing::{error, warn};

use crate::camera_gate::InFlightToken;
use crate::frame_event::{FrameEvent, FrameKind, FrameTiming, SharedSink};

/// Outcome counters for the camera operations of one run.
#[derive(Debug, Default)]
pub struct CameraStats {
    frames: AtomicU64,
    failures: AtomicU64,
}

impl CameraStats {
    /// Frames returned by the camera.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Camera calls that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Everything a camera thread needs for one frame.
pub(crate) struct CameraOperation<C> {
    pub camera: Arc<Mutex<C>>,
    pub sink: SharedSink,
    pub stats: Arc<CameraStats>,
    pub kind: FrameKind,
    pub step: Step,
    pub cycle_samples: usize,
    pub sample_rate: f64,
    /// Raised if the camera call fails
    pub failure_flag: Option<Arc<AtomicBool>>,
}

impl<C: CameraInterface + 'static> CameraOperation<C> {
    /// Run the operation on its own thread, holding `token` until the camera
    /// returns.
    ///
    /// Returns None if the thread could not be spawned; the token is released
    /// in that case.
    pub fn spawn(self, token: InFlightToken) -> Option<JoinHandle<()>> {
        let index = self.step.index;
        match thread::Builder::new()
            .name(format!("camera-{}-{index}", self.kind))
            .spawn(move || self.run(token))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(step = index, "Failed to spawn camera thread: {e}");
                None
            }
        }
    }

    fn run(self, token: InFlightToken) {
        let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        token.mark_armed();
        let armed_at = Instant::now();
        let result = camera.expose_and_readout();
        drop(camera);
        let completed_at = Instant::now();

        match &result {
            Ok(_) => self.stats.frames.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.stats.failures.fetch_add(1, Ordering::SeqCst),
        };
        token.release();

        match result {
            Ok(frame) => self.sink.emit(FrameEvent {
                kind: self.kind,
                frame,
                step: self.step,
                timing: FrameTiming {
                    armed_at,
                    completed_at,
                    cycle_samples: self.cycle_samples,
                    sample_rate: self.sample_rate,
                },
            }),
            Err(e) => {
                warn!(
                    step = self.step.index,
                    kind = %self.kind,
                    "Camera operation failed, frame dropped: {e}"
                );
                if let Some(flag) = &self.failure_flag {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_gate::CameraGate;
    use crate::frame_event::CollectingSink;
    use shared::camera_interface::mock::MockCamera;
    use std::time::Duration;

    fn operation(
        camera: MockCamera,
        sink: &CollectingSink,
        flag: Option<Arc<AtomicBool>>,
    ) -> (CameraOperation<MockCamera>, Arc<CameraStats>) {
        let stats = Arc::new(CameraStats::default());
        let op = CameraOperation {
            camera: Arc::new(Mutex::new(camera)),
            sink: Arc::new(sink.clone()),
            stats: stats.clone(),
            kind: FrameKind::Snap,
            step: Step::new(4, "488"),
            cycle_samples: 100,
            sample_rate: 1000.0,
            failure_flag: flag,
        };
        (op, stats)
    }

    #[test]
    fn test_frame_emitted_after_release() {
        let gate = CameraGate::new();
        let sink = CollectingSink::new();
        let camera = MockCamera::new(4, 4).with_exposure(Duration::from_millis(5));
        let (op, stats) = operation(camera, &sink, None);

        let token = gate.acquire();
        let ticket = token.ticket();
        let handle = op.spawn(token).unwrap();

        assert!(gate.wait_armed(ticket, Duration::from_secs(1)));
        handle.join().unwrap();

        assert!(!gate.is_in_flight());
        assert_eq!(stats.frames(), 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step.index, 4);
        assert_eq!(events[0].kind, FrameKind::Snap);
        assert!(events[0].timing.camera_time() >= Duration::from_millis(5));
    }

    #[test]
    fn test_failure_raises_flag() {
        let gate = CameraGate::new();
        let sink = CollectingSink::new();
        let camera = MockCamera::new(4, 4).with_exposure(Duration::from_millis(1));
        camera.stats().fail_next(1);
        let flag = Arc::new(AtomicBool::new(false));
        let (op, stats) = operation(camera, &sink, Some(flag.clone()));

        op.spawn(gate.acquire()).unwrap().join().unwrap();

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(stats.failures(), 1);
        assert!(sink.is_empty());
        assert!(!gate.is_in_flight());
    }
}
