//! In-process analog output task.
//!
//! Plays buffers against the wall clock instead of a DAQ card. When a trigger
//! line is attached, each start emits one [`TriggerPulse`] at the first rising
//! edge of the camera trigger row, so a mock camera sees the same timing it
//! would get from the real wiring.
//!
//! Everything the task does is recorded in a [`SimulatedTaskHandle`] that
//! tests keep after the task itself has been moved into an engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use shared::camera_interface::{TriggerPulse, TriggerSender};
use shared::{OutputRow, WaveformMatrix, ROW_COUNT};
use tracing::{debug, trace, warn};

use crate::analog_output::{AnalogOutputTask, OutputError, OutputResult};

/// Camera trigger threshold in volts.
pub const TRIGGER_THRESHOLD_V: f64 = 2.5;

/// Started buffers kept for inspection by default.
pub const DEFAULT_HISTORY: usize = 16;

#[derive(Debug)]
struct Playback {
    started: Instant,
    duration: Duration,
    generation: u64,
}

#[derive(Debug)]
struct TaskState {
    sample_rate: f64,
    samples_per_cycle: usize,
    loaded: Option<WaveformMatrix>,
    playback: Option<Playback>,
    generation: u64,
    writes: u64,
    starts: u64,
    stops: u64,
    pulses: u64,
    played: VecDeque<WaveformMatrix>,
    history: usize,
    pending_write_faults: usize,
    pending_start_faults: usize,
}

impl TaskState {
    fn new(history: usize) -> Self {
        Self {
            sample_rate: 0.0,
            samples_per_cycle: 0,
            loaded: None,
            playback: None,
            generation: 0,
            writes: 0,
            starts: 0,
            stops: 0,
            pulses: 0,
            played: VecDeque::with_capacity(history),
            history,
            pending_write_faults: 0,
            pending_start_faults: 0,
        }
    }

    fn record(&mut self, waveform: WaveformMatrix) {
        if self.history == 0 {
            return;
        }
        while self.played.len() >= self.history {
            self.played.pop_front();
        }
        self.played.push_back(waveform);
    }
}

/// Observer and fault injector for a [`SimulatedOutputTask`].
#[derive(Clone)]
pub struct SimulatedTaskHandle {
    state: Arc<Mutex<TaskState>>,
}

impl SimulatedTaskHandle {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recently started buffers, oldest first.
    ///
    /// Holds at most the task's history length; older buffers are dropped.
    pub fn played(&self) -> Vec<WaveformMatrix> {
        self.lock().played.iter().cloned().collect()
    }

    /// Most recently started buffer.
    pub fn last_played(&self) -> Option<WaveformMatrix> {
        self.lock().played.back().cloned()
    }

    /// Successful writes.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Successful starts.
    pub fn start_count(&self) -> u64 {
        self.lock().starts
    }

    /// Stops of a running task.
    pub fn stop_count(&self) -> u64 {
        self.lock().stops
    }

    /// Trigger pulses delivered to the camera.
    pub fn pulse_count(&self) -> u64 {
        self.lock().pulses
    }

    pub fn is_running(&self) -> bool {
        self.lock().playback.is_some()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().pending_write_faults += count;
    }

    /// Make the next `count` starts fail.
    pub fn fail_next_starts(&self, count: usize) {
        self.lock().pending_start_faults += count;
    }
}

/// Analog output task that plays buffers in real time.
pub struct SimulatedOutputTask {
    state: Arc<Mutex<TaskState>>,
    trigger: Option<TriggerSender>,
}

impl SimulatedOutputTask {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TaskState::new(DEFAULT_HISTORY))),
            trigger: None,
        }
    }

    /// Keep the last `len` started buffers instead of [`DEFAULT_HISTORY`].
    /// Zero disables recording.
    pub fn with_history(self, len: usize) -> Self {
        {
            let mut state = self.lock();
            state.history = len;
            while state.played.len() > len {
                state.played.pop_front();
            }
        }
        self
    }

    /// Drive `trigger` from the camera trigger row.
    pub fn with_trigger(mut self, trigger: TriggerSender) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn handle(&self) -> SimulatedTaskHandle {
        SimulatedTaskHandle {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_pulse(&self, edge: usize, delay: Duration, generation: u64) {
        let Some(trigger) = self.trigger.clone() else {
            return;
        };
        let state = self.state.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let still_playing = state
                .playback
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if !still_playing {
                trace!("Playback {generation} stopped before its trigger edge");
                return;
            }
            state.pulses += 1;
            drop(state);
            let pulse = TriggerPulse {
                emitted_at: Instant::now(),
                sample: edge,
            };
            if trigger.send(pulse).is_err() {
                trace!("Trigger line has no listener");
            }
        });
    }
}

impl Default for SimulatedOutputTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first rising edge through the trigger threshold.
pub fn first_rising_edge(waveform: &WaveformMatrix) -> Option<usize> {
    let row = waveform.row(OutputRow::CameraTrigger);
    let mut previous = 0.0;
    for (i, &v) in row.iter().enumerate() {
        if v > TRIGGER_THRESHOLD_V && previous <= TRIGGER_THRESHOLD_V {
            return Some(i);
        }
        previous = v;
    }
    None
}

impl AnalogOutputTask for SimulatedOutputTask {
    fn channel_count(&self) -> usize {
        ROW_COUNT
    }

    fn configure(&mut self, sample_rate: f64, samples_per_cycle: usize) -> OutputResult<()> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(OutputError::InvalidTiming(format!(
                "sample rate {sample_rate} must be positive"
            )));
        }
        if samples_per_cycle == 0 {
            return Err(OutputError::InvalidTiming(
                "buffer must hold at least one sample".to_string(),
            ));
        }
        let mut state = self.lock();
        if state.playback.is_some() {
            return Err(OutputError::Busy);
        }
        state.sample_rate = sample_rate;
        state.samples_per_cycle = samples_per_cycle;
        Ok(())
    }

    fn write(&mut self, waveform: &WaveformMatrix) -> OutputResult<()> {
        let mut state = self.lock();
        if state.pending_write_faults > 0 {
            state.pending_write_faults -= 1;
            return Err(OutputError::WriteFailed("injected fault".to_string()));
        }
        if state.playback.is_some() {
            return Err(OutputError::Busy);
        }
        let rows = waveform.samples().nrows();
        if rows != ROW_COUNT {
            return Err(OutputError::ChannelMismatch {
                expected: ROW_COUNT,
                actual: rows,
            });
        }
        if state.samples_per_cycle != waveform.columns() {
            return Err(OutputError::InvalidTiming(format!(
                "task configured for {} samples, buffer has {}",
                state.samples_per_cycle,
                waveform.columns()
            )));
        }
        state.loaded = Some(waveform.clone());
        state.writes += 1;
        Ok(())
    }

    fn start(&mut self) -> OutputResult<()> {
        let mut state = self.lock();
        if state.pending_start_faults > 0 {
            state.pending_start_faults -= 1;
            return Err(OutputError::StartFailed("injected fault".to_string()));
        }
        if state.playback.is_some() {
            return Err(OutputError::Busy);
        }
        let waveform = state.loaded.take().ok_or(OutputError::NoFreshSamples)?;

        let rate = state.sample_rate;
        state.generation += 1;
        let generation = state.generation;
        state.playback = Some(Playback {
            started: Instant::now(),
            duration: waveform.duration(rate),
            generation,
        });
        state.starts += 1;
        let edge = first_rising_edge(&waveform);
        state.record(waveform);
        drop(state);

        debug!("Simulated playback {generation} started");
        if let Some(edge) = edge {
            self.schedule_pulse(edge, Duration::from_secs_f64(edge as f64 / rate), generation);
        }
        Ok(())
    }

    fn wait_until_done(&mut self, timeout: Duration) -> OutputResult<()> {
        let remaining = {
            let state = self.lock();
            match &state.playback {
                Some(p) => (p.started + p.duration).saturating_duration_since(Instant::now()),
                None => return Ok(()),
            }
        };
        if remaining > timeout {
            thread::sleep(timeout);
            warn!("Simulated playback still running after {timeout:?}");
            return Err(OutputError::Timeout(timeout));
        }
        thread::sleep(remaining);
        Ok(())
    }

    fn stop(&mut self) -> OutputResult<()> {
        let mut state = self.lock();
        if state.playback.take().is_some() {
            state.stops += 1;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lock().playback.is_some()
    }
}
