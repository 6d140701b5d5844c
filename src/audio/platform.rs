//! Platform seam for microphone capture
//!
//! Everything that touches real hardware (device enumeration, live streams,
//! analysis taps, encoders) goes through these traits, so the capture engine
//! runs the same against cpal on the desktop or an in-memory fake in tests.

use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error names as reported by the underlying media runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// Access refused by the user or the OS
    NotAllowed,
    /// Requested device does not exist
    NotFound,
    /// Device exists but cannot be read (held by another process)
    NotReadable,
    /// Constraints cannot be met by any device
    Overconstrained,
    /// Request interrupted before completion
    Abort,
    /// Blocked by a security policy (insecure origin, sandbox)
    Security,
    /// Malformed constraints
    Type,
    /// Operation not available in this runtime
    NotSupported,
    /// Any other named failure
    Other(String),
}

impl PlatformErrorKind {
    /// Map a runtime error name, including the legacy aliases some
    /// runtimes still emit
    pub fn from_name(name: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" => Self::NotAllowed,
            "NotFoundError" | "DevicesNotFoundError" => Self::NotFound,
            "NotReadableError" | "TrackStartError" => Self::NotReadable,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => Self::Overconstrained,
            "AbortError" => Self::Abort,
            "SecurityError" => Self::Security,
            "TypeError" => Self::Type,
            "NotSupportedError" => Self::NotSupported,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical name of this kind
    pub fn name(&self) -> &str {
        match self {
            Self::NotAllowed => "NotAllowedError",
            Self::NotFound => "NotFoundError",
            Self::NotReadable => "NotReadableError",
            Self::Overconstrained => "OverconstrainedError",
            Self::Abort => "AbortError",
            Self::Security => "SecurityError",
            Self::Type => "TypeError",
            Self::NotSupported => "NotSupportedError",
            Self::Other(name) => name,
        }
    }
}

/// Raw error reported by the platform, before classification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}", .kind.name())]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An audio input device
///
/// Labels are often empty until microphone permission has been granted.
#[derive(Debug, Clone, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Constraints passed to the platform when opening a stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Constraints {
    /// Exact device to open, or the platform default
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Preferred sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Preferred channel count
    pub channel_count: Option<u16>,
}

impl Constraints {
    /// Preferred sample rate for speech capture
    pub const PREFERRED_SAMPLE_RATE: u32 = 16000;

    /// Full processing chain: echo cancellation, noise suppression,
    /// auto gain, 16 kHz mono
    pub fn rich(device_id: Option<&str>) -> Self {
        Self {
            device_id: device_id.map(str::to_string),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: Some(Self::PREFERRED_SAMPLE_RATE),
            channel_count: Some(1),
        }
    }

    /// Whatever the device offers by default
    pub fn minimal(device_id: Option<&str>) -> Self {
        Self {
            device_id: device_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_minimal(&self) -> bool {
        !self.echo_cancellation
            && !self.noise_suppression
            && !self.auto_gain_control
            && self.sample_rate.is_none()
            && self.channel_count.is_none()
    }
}

/// Platform capability flags, injected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformQuirks {
    /// Skip codec negotiation and label the finished clip with the
    /// platform's native container (iOS-class runtimes mis-negotiate
    /// advanced codecs)
    pub reduced_encoder: bool,
}

impl PlatformQuirks {
    /// Derive quirks from a browser user agent string
    ///
    /// This is the only place where user agent sniffing happens.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        Self {
            reduced_encoder: ["iphone", "ipad", "ipod"].iter().any(|m| ua.contains(m)),
        }
    }
}

/// Frequency-domain analysis tap on a live stream
pub trait AnalyserNode: Send {
    /// Number of frequency bins filled by `byte_frequency_data`
    fn frequency_bin_count(&self) -> usize;

    /// Fill `out` with the current bin magnitudes (0-255)
    fn byte_frequency_data(&mut self, out: &mut [u8]);
}

/// Channel carrying encoded chunks from a recorder, in recording order
///
/// The recorder drops its sender once the final chunk after `stop` has been
/// delivered; an `Err` item signals an internal encoder failure.
pub type ChunkSender = mpsc::UnboundedSender<Result<Vec<u8>, PlatformError>>;
pub type ChunkReceiver = mpsc::UnboundedReceiver<Result<Vec<u8>, PlatformError>>;

/// Incremental encoder attached to a live stream
pub trait RecorderBackend: Send {
    fn start(&mut self) -> Result<(), PlatformError>;

    /// Ask the recorder to stop; remaining data is flushed through the
    /// chunk channel which is then closed
    fn stop(&mut self);

    /// MIME type the recorder claims to produce (may be empty)
    fn mime_type(&self) -> String;
}

/// A live audio input stream, exclusively owned by its holder
pub trait LiveStream: Send {
    fn id(&self) -> &str;

    /// Attach a frequency analysis tap
    fn analyser(&mut self) -> Result<Box<dyn AnalyserNode>, PlatformError>;

    /// Attach an encoder; `mime` is `None` to let the runtime choose
    fn create_recorder(
        &mut self,
        mime: Option<&str>,
        chunks: ChunkSender,
    ) -> Result<Box<dyn RecorderBackend>, PlatformError>;

    /// Stop every track; idempotent
    fn stop_tracks(&mut self);

    fn is_live(&self) -> bool;
}

/// Media runtime: device enumeration, stream acquisition, format support
pub trait MediaPlatform: Send + Sync + 'static {
    /// Stream acquisition and enumeration primitives exist
    fn supports_capture(&self) -> bool;

    fn quirks(&self) -> PlatformQuirks;

    /// Whether the runtime encoder can produce `mime`
    fn is_type_supported(&self, mime: &str) -> bool;

    /// Container the runtime encoder produces when no format is requested
    fn native_container(&self) -> &'static str;

    fn enumerate_input_devices(
        &self,
    ) -> impl Future<Output = Result<Vec<DeviceDescriptor>, PlatformError>> + Send;

    /// Open a live stream; suspends until access is granted or denied
    fn open_stream(
        &self,
        constraints: &Constraints,
    ) -> impl Future<Output = Result<Box<dyn LiveStream>, PlatformError>> + Send;
}

/// Stops the wrapped stream's tracks when dropped
pub struct StreamGuard {
    stream: Option<Box<dyn LiveStream>>,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn LiveStream>) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut (dyn LiveStream + 'static)> {
        self.stream.as_deref_mut()
    }

    /// Stop the tracks now instead of at drop
    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
            tracing::debug!("Stream {} released", stream.id());
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_error_names_map_to_the_same_kind() {
        assert_eq!(
            PlatformErrorKind::from_name("PermissionDeniedError"),
            PlatformErrorKind::NotAllowed
        );
        assert_eq!(
            PlatformErrorKind::from_name("DevicesNotFoundError"),
            PlatformErrorKind::NotFound
        );
        assert_eq!(
            PlatformErrorKind::from_name("TrackStartError"),
            PlatformErrorKind::NotReadable
        );
        assert_eq!(
            PlatformErrorKind::from_name("WeirdError"),
            PlatformErrorKind::Other("WeirdError".to_string())
        );
    }

    #[test]
    fn minimal_constraints_keep_the_device() {
        let c = Constraints::minimal(Some("mic-2"));
        assert!(c.is_minimal());
        assert_eq!(c.device_id.as_deref(), Some("mic-2"));
        assert!(!Constraints::rich(None).is_minimal());
    }

    #[test]
    fn ios_user_agents_need_the_reduced_encoder() {
        let quirks = PlatformQuirks::from_user_agent(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15",
        );
        assert!(quirks.reduced_encoder);

        let android = PlatformQuirks::from_user_agent("Mozilla/5.0 (Linux; Android 14; Pixel 8)");
        assert!(!android.reduced_encoder);

        assert_eq!(
            PlatformQuirks::from_user_agent("Mozilla/5.0 (X11; Linux x86_64)"),
            PlatformQuirks::default()
        );
    }

    #[test]
    fn devices_compare_by_id() {
        assert_eq!(
            DeviceDescriptor::new("a", ""),
            DeviceDescriptor::new("a", "USB Microphone")
        );
        assert_ne!(DeviceDescriptor::new("a", "x"), DeviceDescriptor::new("b", "x"));
    }
}
