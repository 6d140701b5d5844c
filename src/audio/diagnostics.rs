//! Microphone self-test and diagnostics report

use super::analyser::average_level;
use super::encoder::{negotiate_mime, supported_mime_types, MimeSelection};
use super::error::ErrorKind;
use super::platform::{Constraints, DeviceDescriptor, MediaPlatform, PlatformQuirks, StreamGuard};
use tokio::time::{Duration, Instant};

/// Default length of the self-test
pub const TEST_WINDOW: Duration = Duration::from_secs(2);

/// Peak average bin level (0-255) the self-test must exceed
pub const DETECTION_LEVEL: f32 = 10.0;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// Result of `test_microphone`
#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneTest {
    pub success: bool,
    /// Peak volume seen during the test, 0-100
    pub volume_detected: f32,
    pub device_id: Option<String>,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

/// Open the microphone and check that it actually picks up sound
///
/// The stream is always released before returning.
pub async fn test_microphone<P: MediaPlatform>(
    platform: &P,
    device_id: Option<&str>,
    window: Duration,
) -> MicrophoneTest {
    let failed = |kind: ErrorKind| MicrophoneTest {
        success: false,
        volume_detected: 0.0,
        device_id: device_id.map(str::to_string),
        message: Some(kind.user_message()),
        error: Some(kind),
    };

    let stream = match platform.open_stream(&Constraints::minimal(device_id)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Microphone test could not open a stream: {}", e);
            return failed(ErrorKind::classify(&e));
        }
    };
    let mut guard = StreamGuard::new(stream);

    let mut analyser = match guard.stream_mut().map(|s| s.analyser()) {
        Some(Ok(analyser)) => analyser,
        Some(Err(e)) => return failed(ErrorKind::classify(&e)),
        None => return failed(ErrorKind::Unknown("stream released".to_string())),
    };
    let mut bins = vec![0u8; analyser.frequency_bin_count()];

    let started = Instant::now();
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    let mut peak = 0.0f32;
    loop {
        ticker.tick().await;
        analyser.byte_frequency_data(&mut bins);
        peak = peak.max(average_level(&bins));
        if started.elapsed() >= window {
            break;
        }
    }
    drop(analyser);
    guard.release();

    let volume_detected = peak / 255.0 * 100.0;
    let success = peak > DETECTION_LEVEL;
    tracing::info!(
        "Microphone test: peak level {:.1} ({:.1}%), {}",
        peak,
        volume_detected,
        if success { "ok" } else { "silent" }
    );

    MicrophoneTest {
        success,
        volume_detected,
        device_id: device_id.map(str::to_string),
        error: None,
        message: (!success).then(|| {
            "No audio input detected. Please check if your microphone is working and not muted."
                .to_string()
        }),
    }
}

/// What the runtime offers for capture
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub supports_capture: bool,
    pub quirks: PlatformQuirks,
    pub devices: Vec<DeviceDescriptor>,
    pub supported_mime_types: Vec<&'static str>,
    pub selected_mime: MimeSelection,
    pub enumeration_error: Option<ErrorKind>,
}

/// Collect capture support, devices and encoder formats, without opening
/// a stream
pub async fn report<P: MediaPlatform>(platform: &P) -> DiagnosticsReport {
    let supports_capture = platform.supports_capture();
    let (devices, enumeration_error) = if supports_capture {
        match platform.enumerate_input_devices().await {
            Ok(devices) => (devices, None),
            Err(e) => (Vec::new(), Some(ErrorKind::classify(&e))),
        }
    } else {
        (Vec::new(), Some(ErrorKind::UnsupportedRuntime))
    };

    DiagnosticsReport {
        supports_capture,
        quirks: platform.quirks(),
        devices,
        supported_mime_types: supported_mime_types(platform),
        selected_mime: negotiate_mime(platform),
        enumeration_error,
    }
}
