//! Command layer for a UI shell
//!
//! Thin wrappers over the capture controller, returning string errors.

mod commands;

pub use commands::{
    cancel_capture, get_status, retry_microphone, start_capture, stop_capture, test_microphone,
    update_audio_settings, AppState, CaptureSummary, DeviceEntry, MicrophoneStatus,
    MicrophoneTestResponse, StatusResponse,
};
