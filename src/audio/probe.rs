//! Microphone capability probe
//!
//! Decides up front whether capture can work at all on this runtime, so the
//! session layer can fail fast instead of trying to open a stream.

use super::error::ErrorKind;
use super::platform::{Constraints, DeviceDescriptor, MediaPlatform, StreamGuard};

/// Snapshot of microphone availability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrophoneCapability {
    pub supported: bool,
    pub devices: Vec<DeviceDescriptor>,
    pub last_error: Option<ErrorKind>,
}

impl MicrophoneCapability {
    fn available(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            supported: true,
            devices,
            last_error: None,
        }
    }

    fn unavailable(error: ErrorKind, devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            supported: false,
            devices,
            last_error: Some(error),
        }
    }
}

/// Probe the runtime: feature detection, enumeration, then a short-lived
/// permission check that opens and immediately releases a stream
pub async fn probe<P: MediaPlatform>(platform: &P) -> MicrophoneCapability {
    if !platform.supports_capture() {
        tracing::warn!("Microphone capture not supported by this runtime");
        return MicrophoneCapability::unavailable(ErrorKind::UnsupportedRuntime, Vec::new());
    }

    let devices = match platform.enumerate_input_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Device enumeration failed: {}", e);
            return MicrophoneCapability::unavailable(ErrorKind::classify(&e), Vec::new());
        }
    };

    if devices.is_empty() {
        tracing::warn!("No audio input device found");
        return MicrophoneCapability::unavailable(ErrorKind::NoDevice, devices);
    }

    let stream = match platform.open_stream(&Constraints::minimal(None)).await {
        Ok(stream) => stream,
        Err(e) => {
            let kind = ErrorKind::classify(&e);
            tracing::warn!("Microphone permission probe failed: {} ({:?})", e, kind);
            return MicrophoneCapability::unavailable(kind, devices);
        }
    };
    let mut guard = StreamGuard::new(stream);

    // Labels are only exposed once permission has been granted
    let labelled = platform.enumerate_input_devices().await;
    guard.release();

    let devices = match labelled {
        Ok(labelled) if !labelled.is_empty() => labelled,
        Ok(_) => devices,
        Err(e) => {
            tracing::debug!("Re-enumeration after permission failed: {}", e);
            devices
        }
    };

    tracing::info!("Microphone available, {} input device(s)", devices.len());
    MicrophoneCapability::available(devices)
}

/// Run the probe again, after the user fixed a permission or device issue
pub async fn retry_probe<P: MediaPlatform>(platform: &P) -> MicrophoneCapability {
    tracing::info!("Retrying microphone probe");
    probe(platform).await
}
