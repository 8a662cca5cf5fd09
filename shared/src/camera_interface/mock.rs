//! In-process camera for tests and dry runs.
//!
//! Optionally listens on a trigger line: each frame waits for a pulse, then
//! integrates for the configured exposure and spends the readout time before
//! returning. Without a trigger line the camera free-runs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array2;
use tracing::{debug, trace};

use super::{CameraError, CameraInterface, CameraResult, Frame, FrameTags, TriggerReceiver};

/// Counters shared between a [`MockCamera`] and whoever inspects it.
#[derive(Debug, Default)]
pub struct MockCameraStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    pending_faults: AtomicUsize,
    exposure_changes: AtomicU64,
}

impl MockCameraStats {
    /// Frames returned successfully.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Calls that returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Calls currently blocked in `expose_and_readout`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `expose_and_readout` calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `set_exposure` calls.
    pub fn exposure_changes(&self) -> u64 {
        self.exposure_changes.load(Ordering::SeqCst)
    }

    /// Make the next `count` frames fail with a capture error.
    pub fn fail_next(&self, count: usize) {
        self.pending_faults.fetch_add(count, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Mock camera producing a synthetic gradient image.
pub struct MockCamera {
    name: String,
    width: usize,
    height: usize,
    exposure: Duration,
    readout: Duration,
    trigger: Option<TriggerReceiver>,
    trigger_timeout: Option<Duration>,
    frame_number: u64,
    stats: Arc<MockCameraStats>,
}

impl MockCamera {
    /// Create a free-running mock camera.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            name: "MockCamera".to_string(),
            width,
            height,
            exposure: Duration::from_millis(100),
            readout: Duration::ZERO,
            trigger: None,
            trigger_timeout: None,
            frame_number: 0,
            stats: Arc::new(MockCameraStats::default()),
        }
    }

    /// Wait for a pulse on `trigger` before each frame (edge-trigger mode).
    pub fn with_trigger(mut self, trigger: TriggerReceiver) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Time spent transferring each frame after the exposure ends.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// How long to wait for a trigger pulse before failing.
    ///
    /// Defaults to the exposure plus one second.
    pub fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = Some(timeout);
        self
    }

    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Shared counters for this camera.
    pub fn stats(&self) -> Arc<MockCameraStats> {
        self.stats.clone()
    }

    fn capture(&mut self) -> CameraResult<Frame> {
        if self.stats.take_fault() {
            return Err(CameraError::CaptureError("injected fault".to_string()));
        }

        let started = Instant::now();
        if let Some(trigger) = &self.trigger {
            let timeout = self
                .trigger_timeout
                .unwrap_or(self.exposure + Duration::from_secs(1));
            let pulse = trigger
                .recv_timeout(timeout)
                .map_err(|_| CameraError::TriggerTimeout(timeout))?;
            trace!("Trigger received at sample {}", pulse.sample);
        }

        thread::sleep(self.exposure + self.readout);

        self.frame_number += 1;
        let frame_number = self.frame_number;
        let width = self.width;
        let image = Array2::from_shape_fn((self.height, self.width), |(r, c)| {
            ((r * width + c) as u64 + frame_number) as u16
        });

        let mut tags = FrameTags::new();
        tags.insert("Camera".to_string(), self.name.clone());
        tags.insert("ImageNumber".to_string(), frame_number.to_string());
        tags.insert(
            "Exposure-ms".to_string(),
            format!("{:.3}", self.exposure.as_secs_f64() * 1000.0),
        );
        tags.insert(
            "ElapsedTime-ms".to_string(),
            format!("{:.3}", started.elapsed().as_secs_f64() * 1000.0),
        );

        Ok(Frame { image, tags })
    }
}

impl CameraInterface for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn exposure(&self) -> Duration {
        self.exposure
    }

    fn set_exposure(&mut self, exposure: Duration) -> CameraResult<()> {
        if exposure.is_zero() {
            return Err(CameraError::InvalidExposure(exposure));
        }
        debug!("Mock camera exposure set to {:?}", exposure);
        self.exposure = exposure;
        self.stats.exposure_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn expose_and_readout(&mut self) -> CameraResult<Frame> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.capture();

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(_) => self.stats.completed.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::SeqCst),
        };
        result
    }
}
