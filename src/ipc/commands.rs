//! Commands exposed to a UI shell
//!
//! Each command takes the shared state and returns `Result<_, String>` so
//! it can be wrapped as-is by a shell command handler.

use crate::audio::diagnostics::{self, TEST_WINDOW};
use crate::audio::{MediaPlatform, MicrophoneCapability};
use crate::config::{save_audio_settings, AudioSettings, SettingsStore};
use crate::session::{CaptureController, SessionOutcome, SessionState};
use serde::Serialize;
use std::sync::Arc;

/// State shared with the shell
pub struct AppState<P: MediaPlatform> {
    pub controller: CaptureController<P>,
    pub store: Arc<dyn SettingsStore>,
}

impl<P: MediaPlatform> AppState<P> {
    pub fn new(controller: CaptureController<P>, store: Arc<dyn SettingsStore>) -> Self {
        Self { controller, store }
    }
}

/// Status snapshot for the UI
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub state: SessionState,
    pub session: Option<String>,
    pub word: Option<String>,
    pub is_recording: bool,
    pub cooldown_ms: u64,
    pub microphone: Option<MicrophoneStatus>,
}

/// Microphone availability for the UI
#[derive(Debug, Clone, Serialize)]
pub struct MicrophoneStatus {
    pub supported: bool,
    pub devices: Vec<DeviceEntry>,
    pub error: Option<String>,
    /// Show the blocking modal (retry, diagnostics, no-mic mode)
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub label: String,
}

impl From<&MicrophoneCapability> for MicrophoneStatus {
    fn from(cap: &MicrophoneCapability) -> Self {
        Self {
            supported: cap.supported,
            devices: cap
                .devices
                .iter()
                .map(|d| DeviceEntry {
                    id: d.id.clone(),
                    label: d.label.clone(),
                })
                .collect(),
            error: cap.last_error.as_ref().map(|e| e.user_message()),
            critical: cap.last_error.as_ref().map(|e| e.is_critical()).unwrap_or(false),
        }
    }
}

/// How a capture ended
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub session: String,
    pub state: SessionState,
    pub mime_type: Option<String>,
    pub size: usize,
    pub error: Option<String>,
    pub retry_silently: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MicrophoneTestResponse {
    pub success: bool,
    pub volume_detected: f32,
    pub error: Option<String>,
}

/// Start capturing an answer for `word`
pub async fn start_capture<P: MediaPlatform>(
    state: &AppState<P>,
    word: String,
    device_id: Option<String>,
) -> Result<String, String> {
    let id = state
        .controller
        .request(&word, device_id.as_deref())
        .await
        .map_err(|e| match e {
            crate::session::CaptureError::Capture(kind) => kind.user_message(),
            other => other.to_string(),
        })?;
    Ok(id.to_string())
}

/// Stop the current capture and wait for its result
pub async fn stop_capture<P: MediaPlatform>(state: &AppState<P>) -> Result<CaptureSummary, String> {
    let id = state.controller.stop().await.map_err(|e| e.to_string())?;
    let outcome = state
        .controller
        .wait_finished(id)
        .await
        .ok_or_else(|| "Capture result lost".to_string())?;

    let mut summary = CaptureSummary {
        session: id.to_string(),
        state: outcome.state(),
        mime_type: None,
        size: 0,
        error: None,
        retry_silently: false,
    };
    match outcome {
        SessionOutcome::Completed(clip) => {
            summary.size = clip.len();
            summary.mime_type = Some(clip.mime_type);
        }
        SessionOutcome::Failed {
            kind,
            retry_silently,
        } => {
            summary.error = Some(kind.user_message());
            summary.retry_silently = retry_silently;
        }
        SessionOutcome::Cancelled => {}
    }
    Ok(summary)
}

/// Cancel the current capture without producing a clip
pub async fn cancel_capture<P: MediaPlatform>(state: &AppState<P>) -> Result<(), String> {
    state.controller.cancel().await.map_err(|e| e.to_string())?;
    Ok(())
}

pub async fn get_status<P: MediaPlatform>(state: &AppState<P>) -> Result<StatusResponse, String> {
    let status = state.controller.status().await;
    Ok(StatusResponse {
        state: status.state,
        session: status.session.map(|id| id.to_string()),
        word: status.word,
        is_recording: status.state == SessionState::Recording,
        cooldown_ms: status
            .cooldown_remaining
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        microphone: status.capability.as_ref().map(MicrophoneStatus::from),
    })
}

/// Probe the microphone again after the learner fixed the problem
pub async fn retry_microphone<P: MediaPlatform>(
    state: &AppState<P>,
) -> Result<MicrophoneStatus, String> {
    let capability = state.controller.retry_microphone().await;
    Ok(MicrophoneStatus::from(&capability))
}

/// Apply and persist new VAD settings; the current session is unaffected
pub async fn update_audio_settings<P: MediaPlatform>(
    state: &AppState<P>,
    settings: AudioSettings,
) -> Result<(), String> {
    state
        .controller
        .update_settings(settings)
        .await
        .map_err(|e| e.to_string())?;
    save_audio_settings(state.store.as_ref(), &settings).map_err(|e| e.to_string())
}

/// Run the two-second microphone self-test
pub async fn test_microphone<P: MediaPlatform>(
    state: &AppState<P>,
    device_id: Option<String>,
) -> Result<MicrophoneTestResponse, String> {
    let result = diagnostics::test_microphone(
        state.controller.platform(),
        device_id.as_deref(),
        TEST_WINDOW,
    )
    .await;
    Ok(MicrophoneTestResponse {
        success: result.success,
        volume_detected: result.volume_detected,
        error: result.message,
    })
}
