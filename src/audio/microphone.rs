//! Desktop media platform backed by cpal
//!
//! Each stream is captured in a dedicated thread (cpal streams are not
//! `Send`), downmixed to mono and fanned out to a ring-buffer tap for the
//! analyser and to an in-memory recorder that encodes WAV with hound.

use super::analyser::{FrequencyAnalyser, FFT_SIZE};
use super::platform::{
    AnalyserNode, ChunkSender, Constraints, DeviceDescriptor, LiveStream, MediaPlatform,
    PlatformError, PlatformErrorKind, PlatformQuirks, RecorderBackend,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

/// The only container this backend can produce
pub const WAV_MIME: &str = "audio/wav";

/// Analyser tap capacity (one second at 48 kHz)
const TAP_CAPACITY: usize = 48000;

static STREAM_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Commands to control a capture thread
enum StreamCommand {
    Stop,
}

/// Format actually negotiated with the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Media platform over the default cpal host
#[derive(Debug, Clone, Default)]
pub struct CpalPlatform {
    quirks: PlatformQuirks,
}

impl CpalPlatform {
    pub fn new(quirks: PlatformQuirks) -> Self {
        Self { quirks }
    }
}

impl MediaPlatform for CpalPlatform {
    fn supports_capture(&self) -> bool {
        !cpal::available_hosts().is_empty()
    }

    fn quirks(&self) -> PlatformQuirks {
        self.quirks
    }

    fn is_type_supported(&self, mime: &str) -> bool {
        mime == WAV_MIME
    }

    fn native_container(&self) -> &'static str {
        WAV_MIME
    }

    async fn enumerate_input_devices(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        tokio::task::spawn_blocking(list_input_devices)
            .await
            .map_err(|e| PlatformError::new(PlatformErrorKind::Abort, e.to_string()))?
    }

    async fn open_stream(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn LiveStream>, PlatformError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel();
        let (producer, consumer) = HeapRb::<f32>::new(TAP_CAPACITY).split();
        let buffer = Arc::new(RecordingBuffer::default());

        let thread_constraints = constraints.clone();
        let thread_buffer = Arc::clone(&buffer);
        thread::Builder::new()
            .name("recitea-capture".to_string())
            .spawn(move || {
                run_capture(
                    thread_constraints,
                    producer,
                    thread_buffer,
                    ready_tx,
                    command_rx,
                )
            })
            .map_err(|e| PlatformError::new(PlatformErrorKind::NotReadable, e.to_string()))?;

        let info = ready_rx.await.map_err(|_| {
            PlatformError::new(PlatformErrorKind::Abort, "capture thread exited early")
        })??;

        let id = format!(
            "cpal-{}",
            STREAM_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
        );
        tracing::info!(
            "Stream {} open on {:?}: {}Hz {}ch",
            id,
            info.device_name,
            info.sample_rate,
            info.channels
        );

        Ok(Box::new(CpalStream {
            id,
            info,
            command_tx,
            tap: Some(consumer),
            buffer,
            live: true,
        }))
    }
}

/// List input devices; the device name doubles as its id
fn list_input_devices() -> Result<Vec<DeviceDescriptor>, PlatformError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| PlatformError::new(PlatformErrorKind::NotReadable, e.to_string()))?;
    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| DeviceDescriptor::new(name.clone(), name))
        .collect())
}

fn find_device(device_id: Option<&str>) -> Result<cpal::Device, PlatformError> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .input_devices()
            .map_err(|e| PlatformError::new(PlatformErrorKind::NotReadable, e.to_string()))?
            .find(|d| d.name().map(|name| name == id).unwrap_or(false))
            .ok_or_else(|| {
                PlatformError::new(PlatformErrorKind::NotFound, format!("no device {:?}", id))
            }),
        None => host.default_input_device().ok_or_else(|| {
            PlatformError::new(PlatformErrorKind::NotFound, "no default input device")
        }),
    }
}

/// Pick the device configuration for `constraints`
///
/// The rich set needs a mono configuration at the preferred rate; the
/// minimal set takes the device default.
fn select_config(
    device: &cpal::Device,
    constraints: &Constraints,
) -> Result<cpal::SupportedStreamConfig, PlatformError> {
    if constraints.is_minimal() {
        return device.default_input_config().map_err(default_config_error);
    }

    let rate = constraints
        .sample_rate
        .unwrap_or(Constraints::PREFERRED_SAMPLE_RATE);
    let channels = constraints.channel_count.unwrap_or(1);
    device
        .supported_input_configs()
        .map_err(supported_configs_error)?
        .filter(|c| c.channels() == channels)
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .find(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        .map(|c| c.with_sample_rate(SampleRate(rate)))
        .ok_or_else(|| {
            PlatformError::new(
                PlatformErrorKind::Overconstrained,
                format!("no {}ch {}Hz input configuration", channels, rate),
            )
        })
}

/// Run audio capture (in a dedicated thread)
fn run_capture(
    constraints: Constraints,
    producer: HeapProd<f32>,
    buffer: Arc<RecordingBuffer>,
    ready: oneshot::Sender<Result<StreamInfo, PlatformError>>,
    command_rx: mpsc::Receiver<StreamCommand>,
) {
    let opened = (|| -> Result<(cpal::Stream, StreamInfo), PlatformError> {
        let device = find_device(constraints.device_id.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = select_config(&device, &constraints)?;
        let info = StreamInfo {
            device_name,
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        };
        let config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, buffer),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, buffer),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, producer, buffer),
            other => Err(PlatformError::new(
                PlatformErrorKind::NotSupported,
                format!("sample format {:?}", other),
            )),
        }?;
        stream.play().map_err(play_error)?;
        Ok((stream, info))
    })();

    let stream = match opened {
        Ok((stream, info)) => {
            if ready.send(Ok(info)).is_err() {
                // Nobody is waiting for this stream anymore
                return;
            }
            stream
        }
        Err(e) => {
            tracing::warn!("Cannot open input stream: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        match command_rx.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(StreamCommand::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }
    drop(stream);
    tracing::info!("Audio capture stopped");
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
    buffer: Arc<RecordingBuffer>,
) -> Result<cpal::Stream, PlatformError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                // A full tap drops the newest samples; the analyser drains it every tick
                producer.push_slice(&mono);
                buffer.append(&mono);
            },
            |err| {
                tracing::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(build_error)
}

/// Convert interleaved frames to mono f32
fn downmix<T>(data: &[T], channels: u16) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = channels.max(1) as usize;
    data.chunks(channels)
        .map(|frame| {
            frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
        })
        .collect()
}

/// Encode mono samples as 16-bit PCM WAV
fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, PlatformError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_error = |e: hound::Error| {
        PlatformError::new(
            PlatformErrorKind::Other("EncodingError".to_string()),
            format!("WAV error: {}", e),
        )
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
        for &sample in samples {
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16).map_err(wav_error)?;
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok(cursor.into_inner())
}

fn build_error(e: cpal::BuildStreamError) -> PlatformError {
    let kind = match &e {
        cpal::BuildStreamError::DeviceNotAvailable => PlatformErrorKind::NotFound,
        cpal::BuildStreamError::StreamConfigNotSupported => PlatformErrorKind::Overconstrained,
        cpal::BuildStreamError::InvalidArgument => PlatformErrorKind::Type,
        _ => PlatformErrorKind::NotReadable,
    };
    PlatformError::new(kind, e.to_string())
}

fn play_error(e: cpal::PlayStreamError) -> PlatformError {
    let kind = match &e {
        cpal::PlayStreamError::DeviceNotAvailable => PlatformErrorKind::NotFound,
        _ => PlatformErrorKind::NotReadable,
    };
    PlatformError::new(kind, e.to_string())
}

fn default_config_error(e: cpal::DefaultStreamConfigError) -> PlatformError {
    let kind = match &e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => PlatformErrorKind::NotFound,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => PlatformErrorKind::NotSupported,
        _ => PlatformErrorKind::NotReadable,
    };
    PlatformError::new(kind, e.to_string())
}

fn supported_configs_error(e: cpal::SupportedStreamConfigsError) -> PlatformError {
    let kind = match &e {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => PlatformErrorKind::NotFound,
        cpal::SupportedStreamConfigsError::InvalidArgument => PlatformErrorKind::Type,
        _ => PlatformErrorKind::NotReadable,
    };
    PlatformError::new(kind, e.to_string())
}

/// Samples accumulated while a recorder is running
#[derive(Default)]
struct RecordingBuffer {
    recording: AtomicBool,
    samples: Mutex<Vec<f32>>,
}

impl RecordingBuffer {
    fn append(&self, samples: &[f32]) {
        if !self.recording.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend_from_slice(samples);
        }
    }

    fn begin(&self) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.clear();
        }
        self.recording.store(true, Ordering::Release);
    }

    fn end(&self) -> Vec<f32> {
        self.recording.store(false, Ordering::Release);
        self.samples
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

struct CpalStream {
    id: String,
    info: StreamInfo,
    command_tx: mpsc::Sender<StreamCommand>,
    tap: Option<HeapCons<f32>>,
    buffer: Arc<RecordingBuffer>,
    live: bool,
}

impl LiveStream for CpalStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn analyser(&mut self) -> Result<Box<dyn AnalyserNode>, PlatformError> {
        let consumer = self.tap.take().ok_or_else(|| {
            PlatformError::new(PlatformErrorKind::NotSupported, "analyser already attached")
        })?;
        Ok(Box::new(CpalAnalyser::new(consumer)))
    }

    fn create_recorder(
        &mut self,
        mime: Option<&str>,
        chunks: ChunkSender,
    ) -> Result<Box<dyn RecorderBackend>, PlatformError> {
        if let Some(mime) = mime {
            if mime != WAV_MIME {
                return Err(PlatformError::new(
                    PlatformErrorKind::NotSupported,
                    format!("cannot record {}", mime),
                ));
            }
        }
        Ok(Box::new(WavRecorder {
            buffer: Arc::clone(&self.buffer),
            sample_rate: self.info.sample_rate,
            chunks: Some(chunks),
        }))
    }

    fn stop_tracks(&mut self) {
        if self.live {
            self.live = false;
            // Fire-and-forget: the capture thread drops the cpal stream
            let _ = self.command_tx.send(StreamCommand::Stop);
            tracing::debug!("Stream {} stop requested", self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

/// Analyser fed from the capture thread's ring buffer
struct CpalAnalyser {
    consumer: HeapCons<f32>,
    window: Vec<f32>,
    scratch: Vec<f32>,
    analyser: FrequencyAnalyser,
}

impl CpalAnalyser {
    fn new(consumer: HeapCons<f32>) -> Self {
        Self {
            consumer,
            window: Vec::with_capacity(FFT_SIZE * 2),
            scratch: vec![0.0; 1024],
            analyser: FrequencyAnalyser::new(FFT_SIZE),
        }
    }

    /// Move everything pending in the tap into the analysis window
    fn drain(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            self.window.extend_from_slice(&self.scratch[..n]);
            if self.window.len() > FFT_SIZE {
                let excess = self.window.len() - FFT_SIZE;
                self.window.drain(..excess);
            }
        }
    }
}

impl AnalyserNode for CpalAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.analyser.bin_count()
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) {
        self.drain();
        self.analyser.analyse(&self.window, out);
    }
}

/// Recorder emitting a single WAV chunk when stopped
struct WavRecorder {
    buffer: Arc<RecordingBuffer>,
    sample_rate: u32,
    chunks: Option<ChunkSender>,
}

impl RecorderBackend for WavRecorder {
    fn start(&mut self) -> Result<(), PlatformError> {
        self.buffer.begin();
        tracing::debug!("WAV recorder started at {}Hz", self.sample_rate);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(tx) = self.chunks.take() else {
            return;
        };
        let samples = self.buffer.end();
        let duration_secs = samples.len() as f32 / self.sample_rate.max(1) as f32;
        let encoded = samples_to_wav(&samples, self.sample_rate);
        if let Ok(wav) = &encoded {
            tracing::debug!("WAV recorder stopped: {:.1}s, {} bytes", duration_secs, wav.len());
        }
        let _ = tx.send(encoded);
    }

    fn mime_type(&self) -> String {
        WAV_MIME.to_string()
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if self.chunks.is_some() {
            self.buffer.end();
        }
    }
}
