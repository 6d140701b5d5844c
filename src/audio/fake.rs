//! In-memory media platform for unit tests
//!
//! Counts live streams so leak checks are exact, and lets a test drive the
//! signal level, inject chunks or faults and script acquisition failures.

use super::platform::{
    AnalyserNode, ChunkSender, Constraints, DeviceDescriptor, LiveStream, MediaPlatform,
    PlatformError, PlatformErrorKind, PlatformQuirks, RecorderBackend,
};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::time::{Duration, Instant};

const BIN_COUNT: usize = 128;

struct Shared {
    supports_capture: AtomicBool,
    quirks: Mutex<PlatformQuirks>,
    devices: Mutex<Vec<DeviceDescriptor>>,
    labelled_after_open: AtomicBool,
    granted: AtomicBool,
    rich_error: Mutex<Option<PlatformError>>,
    minimal_error: Mutex<Option<PlatformError>>,
    open_delay: Mutex<Duration>,
    supported_mime: Mutex<Vec<String>>,
    advertised_mime: Mutex<String>,
    native_container: Mutex<&'static str>,
    level: AtomicU8,
    live_streams: AtomicUsize,
    open_attempts: Mutex<Vec<Constraints>>,
    final_chunk: Mutex<Vec<u8>>,
    finalize_delay: Mutex<Duration>,
    recorder_stops: Mutex<Vec<Instant>>,
    requested_mime: Mutex<Vec<Option<String>>>,
    chunk_tx: Mutex<Option<WeakUnboundedSender<Result<Vec<u8>, PlatformError>>>>,
}

#[derive(Clone)]
pub(crate) struct FakePlatform {
    shared: Arc<Shared>,
}

impl FakePlatform {
    /// One microphone, permission granted, WebM/Opus support
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                supports_capture: AtomicBool::new(true),
                quirks: Mutex::new(PlatformQuirks::default()),
                devices: Mutex::new(vec![DeviceDescriptor::new("mic-1", "Built-in Microphone")]),
                labelled_after_open: AtomicBool::new(true),
                granted: AtomicBool::new(false),
                rich_error: Mutex::new(None),
                minimal_error: Mutex::new(None),
                open_delay: Mutex::new(Duration::ZERO),
                supported_mime: Mutex::new(vec![
                    "audio/webm;codecs=opus".to_string(),
                    "audio/webm".to_string(),
                ]),
                advertised_mime: Mutex::new("audio/webm;codecs=opus".to_string()),
                native_container: Mutex::new("audio/mp4"),
                level: AtomicU8::new(0),
                live_streams: AtomicUsize::new(0),
                open_attempts: Mutex::new(Vec::new()),
                final_chunk: Mutex::new(vec![7u8; 4096]),
                finalize_delay: Mutex::new(Duration::ZERO),
                recorder_stops: Mutex::new(Vec::new()),
                requested_mime: Mutex::new(Vec::new()),
                chunk_tx: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_supports_capture(&self, supported: bool) {
        self.shared.supports_capture.store(supported, Ordering::SeqCst);
    }

    pub(crate) fn set_quirks(&self, quirks: PlatformQuirks) {
        *self.shared.quirks.lock().unwrap() = quirks;
    }

    pub(crate) fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.shared.devices.lock().unwrap() = devices;
    }

    pub(crate) fn fail_rich(&self, kind: PlatformErrorKind) {
        *self.shared.rich_error.lock().unwrap() = Some(PlatformError::new(kind, "rich rejected"));
    }

    pub(crate) fn fail_minimal(&self, kind: PlatformErrorKind) {
        *self.shared.minimal_error.lock().unwrap() =
            Some(PlatformError::new(kind, "minimal rejected"));
    }

    /// Both constraint sets fail with `kind`
    pub(crate) fn fail_open(&self, kind: PlatformErrorKind) {
        self.fail_rich(kind.clone());
        self.fail_minimal(kind);
    }

    pub(crate) fn clear_failures(&self) {
        *self.shared.rich_error.lock().unwrap() = None;
        *self.shared.minimal_error.lock().unwrap() = None;
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        *self.shared.open_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_supported_mime(&self, types: &[&str]) {
        *self.shared.supported_mime.lock().unwrap() =
            types.iter().map(|t| t.to_string()).collect();
    }

    pub(crate) fn set_advertised_mime(&self, mime: &str) {
        *self.shared.advertised_mime.lock().unwrap() = mime.to_string();
    }

    pub(crate) fn set_native_container(&self, mime: &'static str) {
        *self.shared.native_container.lock().unwrap() = mime;
    }

    /// Value reported in every frequency bin
    pub(crate) fn set_level(&self, level: u8) {
        self.shared.level.store(level, Ordering::SeqCst);
    }

    pub(crate) fn set_final_chunk(&self, chunk: Vec<u8>) {
        *self.shared.final_chunk.lock().unwrap() = chunk;
    }

    /// Hold the final chunk back for `delay` after the recorder is stopped
    pub(crate) fn set_finalize_delay(&self, delay: Duration) {
        *self.shared.finalize_delay.lock().unwrap() = delay;
    }

    /// Deliver a chunk through the most recent recorder
    pub(crate) fn push_chunk(&self, chunk: Vec<u8>) {
        if let Some(tx) = self.chunk_sender() {
            let _ = tx.send(Ok(chunk));
        }
    }

    /// Make the most recent recorder fail
    pub(crate) fn push_fault(&self, message: &str) {
        if let Some(tx) = self.chunk_sender() {
            let _ = tx.send(Err(PlatformError::new(
                PlatformErrorKind::Other("EncodingError".to_string()),
                message,
            )));
        }
    }

    fn chunk_sender(&self) -> Option<ChunkSender> {
        self.shared
            .chunk_tx
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    pub(crate) fn live_streams(&self) -> usize {
        self.shared.live_streams.load(Ordering::SeqCst)
    }

    pub(crate) fn open_attempts(&self) -> Vec<Constraints> {
        self.shared.open_attempts.lock().unwrap().clone()
    }

    pub(crate) fn recorder_stops(&self) -> Vec<Instant> {
        self.shared.recorder_stops.lock().unwrap().clone()
    }

    pub(crate) fn requested_mime(&self) -> Vec<Option<String>> {
        self.shared.requested_mime.lock().unwrap().clone()
    }
}

impl MediaPlatform for FakePlatform {
    fn supports_capture(&self) -> bool {
        self.shared.supports_capture.load(Ordering::SeqCst)
    }

    fn quirks(&self) -> PlatformQuirks {
        *self.shared.quirks.lock().unwrap()
    }

    fn is_type_supported(&self, mime: &str) -> bool {
        self.shared
            .supported_mime
            .lock()
            .unwrap()
            .iter()
            .any(|t| t == mime)
    }

    fn native_container(&self) -> &'static str {
        *self.shared.native_container.lock().unwrap()
    }

    async fn enumerate_input_devices(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        let granted = self.shared.granted.load(Ordering::SeqCst);
        let labelled = self.shared.labelled_after_open.load(Ordering::SeqCst);
        let devices = self.shared.devices.lock().unwrap().clone();
        if granted || !labelled {
            return Ok(devices);
        }
        // Labels stay hidden until permission is granted
        Ok(devices
            .into_iter()
            .map(|d| DeviceDescriptor::new(d.id, ""))
            .collect())
    }

    async fn open_stream(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn LiveStream>, PlatformError> {
        self.shared
            .open_attempts
            .lock()
            .unwrap()
            .push(constraints.clone());

        let delay = *self.shared.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let error = if constraints.is_minimal() {
            self.shared.minimal_error.lock().unwrap().clone()
        } else {
            self.shared.rich_error.lock().unwrap().clone()
        };
        if let Some(err) = error {
            return Err(err);
        }

        self.shared.granted.store(true, Ordering::SeqCst);
        self.shared.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            shared: Arc::clone(&self.shared),
            live: true,
        }))
    }
}

struct FakeStream {
    shared: Arc<Shared>,
    live: bool,
}

impl LiveStream for FakeStream {
    fn id(&self) -> &str {
        "fake-stream"
    }

    fn analyser(&mut self) -> Result<Box<dyn AnalyserNode>, PlatformError> {
        Ok(Box::new(FakeAnalyser {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn create_recorder(
        &mut self,
        mime: Option<&str>,
        chunks: ChunkSender,
    ) -> Result<Box<dyn RecorderBackend>, PlatformError> {
        self.shared
            .requested_mime
            .lock()
            .unwrap()
            .push(mime.map(str::to_string));
        *self.shared.chunk_tx.lock().unwrap() = Some(chunks.downgrade());
        Ok(Box::new(FakeRecorder {
            shared: Arc::clone(&self.shared),
            chunks: Some(chunks),
        }))
    }

    fn stop_tracks(&mut self) {
        if self.live {
            self.live = false;
            self.shared.live_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

struct FakeAnalyser {
    shared: Arc<Shared>,
}

impl AnalyserNode for FakeAnalyser {
    fn frequency_bin_count(&self) -> usize {
        BIN_COUNT
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) {
        out.fill(self.shared.level.load(Ordering::SeqCst));
    }
}

struct FakeRecorder {
    shared: Arc<Shared>,
    chunks: Option<ChunkSender>,
}

impl RecorderBackend for FakeRecorder {
    fn start(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.chunks.take() {
            self.shared
                .recorder_stops
                .lock()
                .unwrap()
                .push(Instant::now());
            let last = self.shared.final_chunk.lock().unwrap().clone();
            let delay = *self.shared.finalize_delay.lock().unwrap();
            if delay.is_zero() {
                if !last.is_empty() {
                    let _ = tx.send(Ok(last));
                }
                return;
            }
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !last.is_empty() {
                    let _ = tx.send(Ok(last));
                }
            });
        }
    }

    fn mime_type(&self) -> String {
        self.shared.advertised_mime.lock().unwrap().clone()
    }
}
