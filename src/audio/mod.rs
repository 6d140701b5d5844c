//! Microphone capture
//!
//! Capability probe, stream acquisition, encoding and analysis on top of
//! the `MediaPlatform` seam.

mod acquire;
pub mod analyser;
pub mod diagnostics;
mod encoder;
mod error;
mod microphone;
mod platform;
mod probe;

#[cfg(test)]
pub(crate) mod fake;

pub use acquire::acquire;
pub use encoder::{
    negotiate_mime, supported_mime_types, EncodedClip, Encoder, EncoderError, MimeSelection,
    MIME_PRIORITY,
};
pub use error::ErrorKind;
pub use microphone::{CpalPlatform, StreamInfo, WAV_MIME};
pub use platform::{
    AnalyserNode, ChunkReceiver, ChunkSender, Constraints, DeviceDescriptor, LiveStream,
    MediaPlatform, PlatformError, PlatformErrorKind, PlatformQuirks, RecorderBackend, StreamGuard,
};
pub use probe::{probe, retry_probe, MicrophoneCapability};
