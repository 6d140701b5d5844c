//! Incremental encoder wrapping a live stream
//!
//! Negotiates a container/codec pair, accumulates encoded chunks in
//! recording order, and on finalize concatenates them into one clip.

use super::error::ErrorKind;
use super::platform::{ChunkReceiver, LiveStream, MediaPlatform, PlatformError, RecorderBackend};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Container/codec pairs, most preferred first
pub const MIME_PRIORITY: [&str; 5] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/mp4;codecs=mp4a.40.2",
    "audio/wav",
];

/// Label used when the runtime chose the format and did not say which
pub const UNLABELLED_MIME: &str = "application/octet-stream";

/// Outcome of MIME negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeSelection {
    /// First supported entry of `MIME_PRIORITY`
    Negotiated(String),
    /// Nothing supported; the runtime picks
    RuntimeDefault,
    /// Reduced path: no negotiation, label with the native container
    PlatformOverride(&'static str),
}

impl MimeSelection {
    /// MIME type to request from the recorder
    pub fn requested(&self) -> Option<&str> {
        match self {
            Self::Negotiated(mime) => Some(mime),
            Self::RuntimeDefault | Self::PlatformOverride(_) => None,
        }
    }
}

/// Pick the recorder format for this platform
pub fn negotiate_mime<P: MediaPlatform>(platform: &P) -> MimeSelection {
    if platform.quirks().reduced_encoder {
        return MimeSelection::PlatformOverride(platform.native_container());
    }

    MIME_PRIORITY
        .iter()
        .find(|mime| platform.is_type_supported(mime))
        .map(|mime| MimeSelection::Negotiated(mime.to_string()))
        .unwrap_or(MimeSelection::RuntimeDefault)
}

/// List every entry of `MIME_PRIORITY` the platform supports
pub fn supported_mime_types<P: MediaPlatform>(platform: &P) -> Vec<&'static str> {
    MIME_PRIORITY
        .iter()
        .copied()
        .filter(|mime| platform.is_type_supported(mime))
        .collect()
}

/// A finished recording, ready for upload or playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl EncodedClip {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension matching the container
    pub fn extension(&self) -> &'static str {
        let container = self.mime_type.split(';').next().unwrap_or("").trim();
        match container {
            "audio/webm" => "webm",
            "audio/ogg" => "ogg",
            "audio/mp4" | "audio/x-m4a" => "m4a",
            "audio/wav" | "audio/wave" | "audio/x-wav" => "wav",
            "audio/mpeg" => "mp3",
            _ => "bin",
        }
    }
}

/// Encoder errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Insufficient audio: {size} bytes (minimum {min})")]
    InsufficientAudio { size: usize, min: usize },

    #[error("Recorder error: {0}")]
    Internal(String),
}

impl EncoderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientAudio { .. } => ErrorKind::InsufficientAudio,
            Self::Internal(_) => ErrorKind::RecorderInternalError,
        }
    }
}

impl From<PlatformError> for EncoderError {
    fn from(err: PlatformError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Encoder bound 1:1 to a live stream
pub struct Encoder {
    backend: Box<dyn RecorderBackend>,
    selection: MimeSelection,
    collector: JoinHandle<Result<Vec<Vec<u8>>, PlatformError>>,
    fault_rx: Option<oneshot::Receiver<PlatformError>>,
    min_clip_bytes: usize,
}

impl Encoder {
    /// Attach an encoder to `stream` and start recording
    pub fn open<P: MediaPlatform>(
        platform: &P,
        stream: &mut dyn LiveStream,
        min_clip_bytes: usize,
    ) -> Result<Self, EncoderError> {
        let selection = negotiate_mime(platform);
        tracing::info!("Recorder format: {:?}", selection);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let mut backend = stream.create_recorder(selection.requested(), chunk_tx)?;

        let (fault_tx, fault_rx) = oneshot::channel();
        let collector = tokio::spawn(collect_chunks(chunk_rx, fault_tx));

        if let Err(e) = backend.start() {
            collector.abort();
            return Err(e.into());
        }

        Ok(Self {
            backend,
            selection,
            collector,
            fault_rx: Some(fault_rx),
            min_clip_bytes,
        })
    }

    /// Receiver resolving when the recorder fails mid-recording
    pub fn take_fault(&mut self) -> Option<oneshot::Receiver<PlatformError>> {
        self.fault_rx.take()
    }

    /// Stop the recorder, wait for the final chunk and build the clip
    pub async fn finalize(mut self) -> Result<EncodedClip, EncoderError> {
        let advertised = self.backend.mime_type();
        self.backend.stop();
        drop(self.backend);

        let chunks = self
            .collector
            .await
            .map_err(|e| EncoderError::Internal(format!("chunk collector: {}", e)))??;

        let bytes = chunks.concat();
        if bytes.len() < self.min_clip_bytes {
            tracing::warn!(
                "Recording too small: {} bytes in {} chunk(s)",
                bytes.len(),
                chunks.len()
            );
            return Err(EncoderError::InsufficientAudio {
                size: bytes.len(),
                min: self.min_clip_bytes,
            });
        }

        let mime_type = match &self.selection {
            MimeSelection::Negotiated(mime) => mime.clone(),
            MimeSelection::PlatformOverride(container) => container.to_string(),
            MimeSelection::RuntimeDefault if advertised.is_empty() => UNLABELLED_MIME.to_string(),
            MimeSelection::RuntimeDefault => advertised,
        };

        tracing::info!(
            "Recording finalized: {} bytes, {} chunk(s), {}",
            bytes.len(),
            chunks.len(),
            mime_type
        );
        Ok(EncodedClip { bytes, mime_type })
    }

    /// Drop everything recorded so far
    pub fn discard(mut self) {
        self.backend.stop();
        self.collector.abort();
        tracing::debug!("Recorder discarded");
    }
}

async fn collect_chunks(
    mut rx: ChunkReceiver,
    fault_tx: oneshot::Sender<PlatformError>,
) -> Result<Vec<Vec<u8>>, PlatformError> {
    let mut chunks = Vec::new();
    let mut fault_tx = Some(fault_tx);
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) if chunk.is_empty() => {}
            Ok(chunk) => {
                chunks.push(chunk);
            }
            Err(e) => {
                tracing::error!("Recorder failure: {}", e);
                if let Some(tx) = fault_tx.take() {
                    let _ = tx.send(e.clone());
                }
                return Err(e);
            }
        }
    }
    Ok(chunks)
}
