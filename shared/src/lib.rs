//! Shared types for the acquisition workspace.
//!
//! - [`settings`]: validated acquisition settings and derived sample counts
//! - [`step`]: planned imaging steps
//! - [`waveform_matrix`]: the 8-row analog output buffer
//! - [`camera_interface`]: camera trait, trigger line and a mock camera
//! - [`settings_storage`]: JSON settings persistence

pub mod camera_interface;
pub mod settings;
#[cfg(feature = "settings-storage")]
pub mod settings_storage;
pub mod step;
pub mod waveform_matrix;

pub use camera_interface::{
    trigger_line, CameraError, CameraInterface, CameraResult, Frame, FrameTags, TriggerPulse,
    TriggerReceiver, TriggerSender,
};
pub use settings::{
    ChannelMap, LiveSettings, PowerTable, SampleCounts, Settings, SettingsError, SettingsFile,
    SettingsResult,
};
pub use step::{EncodedOverrides, Step};
pub use waveform_matrix::{MatrixShapeError, OutputRow, WaveformMatrix, ROW_COUNT};
