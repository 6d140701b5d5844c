//! Recitea - pronunciation practice client
//!
//! Microphone capture with voice activity detection: one session per
//! practised word, auto-stopped after silence or a time ceiling, producing
//! a single encoded clip for the scoring service.

pub mod audio;
pub mod config;
pub mod ipc;
pub mod practice;
pub mod session;
pub mod vad;

pub use audio::{CpalPlatform, EncodedClip, ErrorKind, MediaPlatform, MicrophoneCapability};
pub use config::{AppConfig, AudioSettings, CapturePolicy};
pub use session::{
    CaptureController, CaptureError, CaptureEvent, SessionId, SessionOutcome, SessionState,
};
pub use vad::{AutoStopReason, VoiceActivityDetector};
