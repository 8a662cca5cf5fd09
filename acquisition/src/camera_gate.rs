//! Handshake between an engine and its camera threads.
//!
//! The gate admits one camera operation at a time. An engine
//! [`acquire`](CameraGate::acquire)s it before spawning the camera thread and
//! hands the returned [`InFlightToken`] to that thread. The thread marks the
//! token armed right before it blocks on the camera, and dropping the token
//! releases the gate. The engine waits for the armed mark before starting
//! playback, so the trigger edge can never arrive before the camera listens
//! for it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Arming,
    Armed,
}

#[derive(Debug)]
struct GateState {
    phase: Phase,
    /// Ticket of the most recent acquisition
    ticket: u64,
    /// Highest ticket that has been marked armed
    armed_through: u64,
}

/// Admits at most one camera operation at a time.
#[derive(Debug)]
pub struct CameraGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl CameraGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                phase: Phase::Idle,
                ticket: 0,
                armed_through: 0,
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grant(self: &Arc<Self>, mut state: MutexGuard<'_, GateState>) -> InFlightToken {
        state.phase = Phase::Arming;
        state.ticket += 1;
        trace!("Camera gate granted ticket {}", state.ticket);
        InFlightToken {
            gate: self.clone(),
            ticket: state.ticket,
        }
    }

    /// Block until no camera operation is in flight, then claim the gate.
    pub fn acquire(self: &Arc<Self>) -> InFlightToken {
        let mut state = self.lock();
        while state.phase != Phase::Idle {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.grant(state)
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub fn try_acquire_for(self: &Arc<Self>, timeout: Duration) -> Option<InFlightToken> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.phase != Phase::Idle {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(self.grant(state))
    }

    /// Wait until the operation holding `ticket` has been marked armed.
    ///
    /// Returns false on timeout, or if that operation ended without arming.
    pub fn wait_armed(&self, ticket: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.armed_through >= ticket {
                return true;
            }
            if state.ticket != ticket || state.phase == Phase::Idle {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// True while a camera operation holds the gate.
    pub fn is_in_flight(&self) -> bool {
        self.lock().phase != Phase::Idle
    }

    /// Wait for the gate to be released. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.phase != Phase::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        state.phase == Phase::Idle
    }

    /// Number of operations admitted so far.
    pub fn acquisitions(&self) -> u64 {
        self.lock().ticket
    }
}

/// Proof that the holder owns the one in-flight camera operation.
///
/// Dropping the token releases the gate.
#[derive(Debug)]
pub struct InFlightToken {
    gate: Arc<CameraGate>,
    ticket: u64,
}

impl InFlightToken {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Signal that the camera is about to block waiting for its trigger.
    pub fn mark_armed(&self) {
        let mut state = self.gate.lock();
        state.phase = Phase::Armed;
        state.armed_through = state.armed_through.max(self.ticket);
        self.gate.changed.notify_all();
    }

    /// Release the gate now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.phase = Phase::Idle;
        trace!("Camera gate released ticket {}", self.ticket);
        self.gate.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_second_acquire_waits_for_release() {
        let gate = CameraGate::new();
        let token = gate.acquire();
        assert!(gate.is_in_flight());
        assert!(gate.try_acquire_for(Duration::from_millis(20)).is_none());

        token.release();
        assert!(!gate.is_in_flight());
        let token = gate.try_acquire_for(Duration::from_millis(20)).unwrap();
        assert_eq!(token.ticket(), 2);
    }

    #[test]
    fn test_wait_armed_sees_mark_from_other_thread() {
        let gate = CameraGate::new();
        let token = gate.acquire();
        let ticket = token.ticket();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            token.mark_armed();
            thread::sleep(Duration::from_millis(10));
        });

        assert!(gate.wait_armed(ticket, Duration::from_secs(1)));
        worker.join().unwrap();
        assert!(gate.wait_idle(Duration::from_secs(1)));
        // Still reported armed after the operation finished
        assert!(gate.wait_armed(ticket, Duration::ZERO));
    }

    #[test]
    fn test_wait_armed_fails_if_dropped_unarmed() {
        let gate = CameraGate::new();
        let token = gate.acquire();
        let ticket = token.ticket();
        drop(token);
        assert!(!gate.wait_armed(ticket, Duration::from_millis(50)));
    }

    #[test]
    fn test_wait_armed_times_out() {
        let gate = CameraGate::new();
        let token = gate.acquire();
        assert!(!gate.wait_armed(token.ticket(), Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_idle_times_out_while_held() {
        let gate = CameraGate::new();
        let _token = gate.acquire();
        assert!(!gate.wait_idle(Duration::from_millis(20)));
    }

    #[test]
    fn test_at_most_one_holder() {
        let gate = CameraGate::new();
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let holders = holders.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let token = gate.acquire();
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        token.mark_armed();
                        holders.fetch_sub(1, Ordering::SeqCst);
                        drop(token);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(gate.acquisitions(), 400);
    }
}
