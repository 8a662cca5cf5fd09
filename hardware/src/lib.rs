//! Hardware drivers for the acquisition engines.
//!
//! This crate provides the analog output task abstraction that plays waveform
//! buffers, exclusive task ownership, and the XY stage interface.
//!
//! # Features
//!
//! - `simulated` - In-process output task that plays buffers against the wall
//!   clock and drives a camera trigger line (enabled by default)

pub mod analog_output;
pub mod ownership;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod stage;

pub use analog_output::{load_and_start, AnalogOutputTask, OutputError, OutputResult};
pub use ownership::{OwnershipError, TaskLease, TaskOwner};
#[cfg(feature = "simulated")]
pub use simulated::{SimulatedOutputTask, SimulatedTaskHandle, DEFAULT_HISTORY};
pub use stage::{SimulatedStage, StageError, XyStage};
