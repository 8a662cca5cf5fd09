//! XY stage interface for positioned sequences.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

/// Errors from the stage controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Stage move failed: {0}")]
    MoveFailed(String),

    #[error("Target ({x}, {y}) outside travel range")]
    OutOfRange { x: f64, y: f64 },

    #[error("Stage not responding")]
    Disconnected,
}

/// Interface for XY stage control
///
/// Abstracts the stage hardware so sequenced acquisitions can move between
/// positions without a live controller.
pub trait XyStage: Send {
    /// Current position in micrometres
    fn xy_position(&mut self) -> Result<(f64, f64), StageError>;

    /// Move to an absolute position in micrometres
    fn set_xy_position(&mut self, x: f64, y: f64) -> Result<(), StageError>;
}

/// Stage that records moves without hardware.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    position: (f64, f64),
    travel: f64,
    moves: Arc<Mutex<Vec<(f64, f64)>>>,
}

impl SimulatedStage {
    /// Stage at the origin with ±`travel` µm on each axis.
    pub fn new(travel: f64) -> Self {
        Self {
            position: (0.0, 0.0),
            travel,
            moves: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every position commanded so far, shared across clones.
    pub fn moves(&self) -> Vec<(f64, f64)> {
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl XyStage for SimulatedStage {
    fn xy_position(&mut self) -> Result<(f64, f64), StageError> {
        Ok(self.position)
    }

    fn set_xy_position(&mut self, x: f64, y: f64) -> Result<(), StageError> {
        if x.abs() > self.travel || y.abs() > self.travel {
            return Err(StageError::OutOfRange { x, y });
        }
        debug!("Stage move to ({x:.2}, {y:.2})");
        self.position = (x, y);
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((x, y));
        Ok(())
    }
}
