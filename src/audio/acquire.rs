//! Stream acquisition with constraint fallback

use super::error::ErrorKind;
use super::platform::{Constraints, LiveStream, MediaPlatform};

/// Open a live input stream
///
/// Tries the rich constraint set first and falls back once to the minimal
/// one. When both fail, the minimal attempt's error is the one surfaced;
/// the rich failure is only logged. The caller owns the returned stream and
/// must stop its tracks on release.
pub async fn acquire<P: MediaPlatform>(
    platform: &P,
    device_id: Option<&str>,
) -> Result<Box<dyn LiveStream>, ErrorKind> {
    let rich = Constraints::rich(device_id);
    match platform.open_stream(&rich).await {
        Ok(stream) => {
            tracing::info!("Stream {} acquired with rich constraints", stream.id());
            return Ok(stream);
        }
        Err(e) => {
            tracing::warn!("Rich constraints rejected, falling back to minimal: {}", e);
        }
    }

    let minimal = Constraints::minimal(device_id);
    match platform.open_stream(&minimal).await {
        Ok(stream) => {
            tracing::info!("Stream {} acquired with minimal constraints", stream.id());
            Ok(stream)
        }
        Err(e) => {
            let kind = ErrorKind::classify(&e);
            tracing::error!("Stream acquisition failed: {} ({:?})", e, kind);
            Err(kind)
        }
    }
}
