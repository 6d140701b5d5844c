//! Capture error taxonomy

use super::platform::{PlatformError, PlatformErrorKind};
use thiserror::Error;

/// Classified capture failure, as surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("microphone capture is not supported on this runtime")]
    UnsupportedRuntime,

    #[error("no microphone detected")]
    NoDevice,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("microphone not found")]
    DeviceNotFound,

    #[error("microphone in use by another application")]
    DeviceBusy,

    #[error("audio constraints cannot be satisfied")]
    ConstraintsUnsatisfiable,

    #[error("invalid audio constraints")]
    InvalidConstraints,

    #[error("microphone access aborted")]
    Aborted,

    #[error("microphone blocked by security settings")]
    SecurityBlocked,

    #[error("operation not supported")]
    Unsupported,

    #[error("no usable audio was captured")]
    InsufficientAudio,

    #[error("recorder failed")]
    RecorderInternalError,

    #[error("microphone error: {0}")]
    Unknown(String),
}

impl ErrorKind {
    /// Classify a raw platform error
    pub fn classify(err: &PlatformError) -> Self {
        match &err.kind {
            PlatformErrorKind::NotAllowed => Self::PermissionDenied,
            PlatformErrorKind::NotFound => Self::DeviceNotFound,
            PlatformErrorKind::NotReadable => Self::DeviceBusy,
            PlatformErrorKind::Overconstrained => Self::ConstraintsUnsatisfiable,
            PlatformErrorKind::Abort => Self::Aborted,
            PlatformErrorKind::Security => Self::SecurityBlocked,
            PlatformErrorKind::Type => Self::InvalidConstraints,
            PlatformErrorKind::NotSupported => Self::Unsupported,
            PlatformErrorKind::Other(name) => Self::Unknown(name.clone()),
        }
    }

    /// Blocking errors: the UI should show a modal offering retry,
    /// diagnostics or the microphone-less mode
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedRuntime
                | Self::NoDevice
                | Self::PermissionDenied
                | Self::DeviceNotFound
                | Self::DeviceBusy
        )
    }

    /// Transient failure: reset to idle without any modal
    pub fn retry_silently(&self) -> bool {
        matches!(self, Self::InsufficientAudio)
    }

    /// Diagnosis shown to the learner
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedRuntime => {
                "Your browser does not support microphone access.".to_string()
            }
            Self::NoDevice => "No microphones detected on your device.".to_string(),
            Self::PermissionDenied => "Microphone access denied. Please allow microphone access \
                                       in your browser settings."
                .to_string(),
            Self::DeviceNotFound => {
                "No microphone found. Please connect a microphone and try again.".to_string()
            }
            Self::DeviceBusy => "Your microphone is in use by another application. Please close \
                                 other apps that might be using it."
                .to_string(),
            Self::ConstraintsUnsatisfiable => {
                "The requested microphone constraints cannot be satisfied.".to_string()
            }
            Self::InvalidConstraints => "Invalid audio constraints provided.".to_string(),
            Self::Aborted => "Microphone access was aborted. Please try again.".to_string(),
            Self::SecurityBlocked => {
                "Microphone access is blocked due to security settings.".to_string()
            }
            Self::Unsupported => "This audio operation is not supported.".to_string(),
            Self::InsufficientAudio => {
                "No audio detected. Please speak louder or check your microphone.".to_string()
            }
            Self::RecorderInternalError => {
                "The recorder stopped unexpectedly. Please try again.".to_string()
            }
            Self::Unknown(name) => format!("Microphone error: {}", name),
        }
    }
}

impl From<&PlatformError> for ErrorKind {
    fn from(err: &PlatformError) -> Self {
        Self::classify(err)
    }
}
