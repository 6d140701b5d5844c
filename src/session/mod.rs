//! Capture session state machine
//!
//! One controller owns at most one session at a time. A session goes
//! `Idle -> Requesting -> Recording -> Stopping -> {Completed, Failed}`,
//! and can be cancelled from any active state. The live stream, encoder
//! and VAD loop belong to the session and are released on every terminal
//! transition, and again defensively before a new session starts.

mod state;

pub use state::{
    CaptureEvent, FinishedSession, SessionId, SessionOutcome, SessionState, StopTrigger,
};

use crate::audio::{
    acquire, probe, retry_probe, Encoder, EncoderError, ErrorKind, LiveStream, MediaPlatform,
    MicrophoneCapability,
};
use crate::config::{AudioSettings, CapturePolicy, ConfigError};
use crate::vad::{AutoStopReason, VadHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

/// Finished sessions kept for `wait_finished`
const HISTORY_LEN: usize = 16;

/// Most recent finished sessions, plus how many finished in total
#[derive(Default)]
struct FinishedLog {
    recent: VecDeque<FinishedSession>,
    total: u64,
}

impl FinishedLog {
    fn outcome(&self, id: SessionId) -> Option<&SessionOutcome> {
        self.recent.iter().find(|f| f.id == id).map(|f| &f.outcome)
    }
}

/// Controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error(transparent)]
    Capture(#[from] ErrorKind),

    #[error("Capture cooling down, retry in {} ms", .remaining.as_millis())]
    CoolingDown { remaining: Duration },

    #[error("No active capture session")]
    NoActiveSession,

    #[error("Capture session cancelled")]
    Cancelled,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStatus {
    pub session: Option<SessionId>,
    pub word: Option<String>,
    pub state: SessionState,
    pub cooldown_remaining: Option<Duration>,
    pub capability: Option<MicrophoneCapability>,
}

struct ActiveSession {
    id: SessionId,
    word: String,
    state: SessionState,
    settings: AudioSettings,
    started_at: Option<Instant>,
    stop_pending: bool,
    stream: Option<Box<dyn LiveStream>>,
    encoder: Option<Encoder>,
    vad: Option<VadHandle>,
    watcher: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(word: &str, settings: AudioSettings) -> Self {
        Self {
            id: SessionId::new(),
            word: word.to_string(),
            state: SessionState::Requesting,
            settings,
            started_at: None,
            stop_pending: false,
            stream: None,
            encoder: None,
            vad: None,
            watcher: None,
        }
    }

    fn holds_handles(&self) -> bool {
        self.stream.is_some() || self.encoder.is_some() || self.vad.is_some()
    }

    /// Stop the VAD, drop the encoder and stop the stream tracks
    fn release(&mut self) {
        if let Some(mut vad) = self.vad.take() {
            vad.stop();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(encoder) = self.encoder.take() {
            encoder.discard();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
            tracing::debug!(session = %self.id, "Stream {} released", stream.id());
        }
    }
}

struct Inner {
    session: Option<ActiveSession>,
    cooldown_until: Option<Instant>,
}

impl Inner {
    fn session_mut(&mut self, id: SessionId) -> Option<&mut ActiveSession> {
        self.session.as_mut().filter(|s| s.id == id)
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Drives capture sessions against a media platform
pub struct CaptureController<P: MediaPlatform> {
    platform: Arc<P>,
    settings: Arc<RwLock<AudioSettings>>,
    policy: CapturePolicy,
    capability: Arc<RwLock<Option<MicrophoneCapability>>>,
    inner: Arc<Mutex<Inner>>,
    event_tx: broadcast::Sender<CaptureEvent>,
    finished_tx: Arc<watch::Sender<FinishedLog>>,
}

impl<P: MediaPlatform> Clone for CaptureController<P> {
    fn clone(&self) -> Self {
        Self {
            platform: Arc::clone(&self.platform),
            settings: Arc::clone(&self.settings),
            policy: self.policy,
            capability: Arc::clone(&self.capability),
            inner: Arc::clone(&self.inner),
            event_tx: self.event_tx.clone(),
            finished_tx: Arc::clone(&self.finished_tx),
        }
    }
}

impl<P: MediaPlatform> CaptureController<P> {
    pub fn new(platform: P, settings: AudioSettings, policy: CapturePolicy) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (finished_tx, _) = watch::channel(FinishedLog::default());

        Self {
            platform: Arc::new(platform),
            settings: Arc::new(RwLock::new(settings)),
            policy,
            capability: Arc::new(RwLock::new(None)),
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                cooldown_until: None,
            })),
            event_tx,
            finished_tx: Arc::new(finished_tx),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Subscribe to state, auto-stop, error and completion events
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    /// Probe the microphone and cache the result for fail-fast checks
    pub async fn probe(&self) -> MicrophoneCapability {
        let capability = probe(&*self.platform).await;
        *self.capability.write().await = Some(capability.clone());
        capability
    }

    /// Re-probe after the learner fixed a permission or device problem
    pub async fn retry_microphone(&self) -> MicrophoneCapability {
        let capability = retry_probe(&*self.platform).await;
        *self.capability.write().await = Some(capability.clone());
        capability
    }

    pub async fn capability(&self) -> Option<MicrophoneCapability> {
        self.capability.read().await.clone()
    }

    pub async fn settings(&self) -> AudioSettings {
        *self.settings.read().await
    }

    /// Replace the shared settings; only sessions requested afterwards
    /// see the change
    pub async fn update_settings(&self, settings: AudioSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.settings.write().await = settings;
        tracing::info!("Audio settings updated: {:?}", settings);
        Ok(())
    }

    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub async fn status(&self) -> CaptureStatus {
        let capability = self.capability().await;
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref();
        CaptureStatus {
            session: session.map(|s| s.id),
            word: session.map(|s| s.word.clone()),
            state: session.map(|s| s.state).unwrap_or(SessionState::Idle),
            cooldown_remaining: inner.cooldown_remaining(Instant::now()),
            capability,
        }
    }

    /// Start a capture session for `word`
    ///
    /// Suspends while the platform grants the stream. Returns once the
    /// session is recording; its outcome is delivered through events and
    /// `wait_finished`.
    pub async fn request(
        &self,
        word: &str,
        device_id: Option<&str>,
    ) -> Result<SessionId, CaptureError> {
        let settings = self.settings().await;
        let id = {
            let mut inner = self.inner.lock().await;
            if let Some(remaining) = inner.cooldown_remaining(Instant::now()) {
                tracing::debug!("Request ignored, cooling down for {:?}", remaining);
                return Err(CaptureError::CoolingDown { remaining });
            }

            self.release_previous(&mut inner);

            if let Some(remaining) = inner.cooldown_remaining(Instant::now()) {
                return Err(CaptureError::CoolingDown { remaining });
            }

            let session = ActiveSession::new(word, settings);
            let id = session.id;
            inner.session = Some(session);
            tracing::info!(session = %id, "Capture requested for {:?}", word);
            self.emit_state(id, SessionState::Requesting);

            let known_failure = self
                .capability
                .read()
                .await
                .as_ref()
                .filter(|cap| !cap.supported)
                .and_then(|cap| cap.last_error.clone());
            if let Some(kind) = known_failure {
                tracing::warn!(session = %id, "Microphone known unavailable: {}", kind);
                if let Some(session) = inner.session_mut(id) {
                    self.finish(session, SessionOutcome::failed(kind.clone()));
                }
                return Err(kind.into());
            }
            id
        };

        let acquired = acquire(&*self.platform, device_id).await;

        let mut inner = self.inner.lock().await;
        let session = match inner.session_mut(id) {
            Some(session) if session.state == SessionState::Requesting => session,
            _ => {
                // Cancelled or superseded while the platform was busy
                if let Ok(mut stream) = acquired {
                    stream.stop_tracks();
                }
                tracing::info!(session = %id, "Stream arrived after cancellation, released");
                return Err(CaptureError::Cancelled);
            }
        };

        let stream = match acquired {
            Ok(stream) => stream,
            Err(kind) => {
                self.finish(session, SessionOutcome::failed(kind.clone()));
                return Err(kind.into());
            }
        };

        if let Err(kind) = self.start_recording(session, stream) {
            self.finish(session, SessionOutcome::failed(kind.clone()));
            return Err(kind.into());
        }

        Ok(id)
    }

    /// Attach encoder and VAD, then move to `Recording`
    fn start_recording(
        &self,
        session: &mut ActiveSession,
        mut stream: Box<dyn LiveStream>,
    ) -> Result<(), ErrorKind> {
        let id = session.id;

        let mut encoder =
            match Encoder::open(&*self.platform, stream.as_mut(), self.policy.min_clip_bytes) {
                Ok(encoder) => encoder,
                Err(e) => {
                    tracing::error!(session = %id, "Cannot start recorder: {}", e);
                    stream.stop_tracks();
                    return Err(e.kind());
                }
            };

        let analyser = match stream.analyser() {
            Ok(analyser) => analyser,
            Err(e) => {
                tracing::error!(session = %id, "Cannot attach analyser: {}", e);
                encoder.discard();
                stream.stop_tracks();
                return Err(ErrorKind::classify(&e));
            }
        };

        let started_at = Instant::now();
        let (auto_tx, auto_rx) = oneshot::channel();
        let vad = VadHandle::start(
            analyser,
            &session.settings,
            started_at,
            self.policy.tick_interval(),
            auto_tx,
        );
        let fault_rx = encoder.take_fault();

        let controller = self.clone();
        let watcher = tokio::spawn(async move {
            let fault = async {
                match fault_rx {
                    Some(rx) => rx.await.ok(),
                    None => None,
                }
            };
            // Act from a separate task: releasing the session aborts this one
            tokio::select! {
                Ok(reason) = auto_rx => {
                    tokio::spawn(async move {
                        controller.stop_session(id, StopTrigger::Auto(reason)).await;
                    });
                }
                Some(err) = fault => {
                    tokio::spawn(async move {
                        controller
                            .fail_recording(id, ErrorKind::RecorderInternalError, err.to_string())
                            .await;
                    });
                }
                else => {}
            }
        });

        session.stream = Some(stream);
        session.encoder = Some(encoder);
        session.vad = Some(vad);
        session.watcher = Some(watcher);
        session.started_at = Some(started_at);
        session.state = SessionState::Recording;
        tracing::info!(session = %id, "Recording started");
        self.emit_state(id, SessionState::Recording);
        Ok(())
    }

    /// Explicitly stop the current recording
    ///
    /// Returns immediately; finalization is scheduled no earlier than the
    /// stop guard after recording started. A session still waiting for its
    /// stream can only be cancelled.
    pub async fn stop(&self) -> Result<SessionId, CaptureError> {
        let id = {
            let inner = self.inner.lock().await;
            match inner.session.as_ref() {
                Some(s) if matches!(s.state, SessionState::Recording | SessionState::Stopping) => {
                    s.id
                }
                _ => return Err(CaptureError::NoActiveSession),
            }
        };

        let controller = self.clone();
        tokio::spawn(async move {
            controller.stop_session(id, StopTrigger::Explicit).await;
        });
        Ok(id)
    }

    /// Move `id` from `Recording` through `Stopping` to a terminal state;
    /// only the first trigger is honoured
    async fn stop_session(&self, id: SessionId, trigger: StopTrigger) {
        let started_at = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session_mut(id) else {
                return;
            };
            if session.state != SessionState::Recording || session.stop_pending {
                tracing::debug!(
                    session = %id,
                    "Stop ({:?}) ignored in {:?}",
                    trigger,
                    session.state
                );
                return;
            }
            session.stop_pending = true;
            if let Some(vad) = session.vad.as_mut() {
                vad.stop();
            }
            session.started_at.unwrap_or_else(Instant::now)
        };

        if let StopTrigger::Auto(reason) = trigger {
            let _ = self.event_tx.send(CaptureEvent::AutoStopTriggered {
                session: id,
                reason,
            });
        }

        let earliest = started_at + self.policy.stop_guard();
        if Instant::now() < earliest {
            tracing::debug!(session = %id, "Stop deferred until the recorder settles");
            sleep_until(earliest).await;
        }

        let encoder = {
            let mut inner = self.inner.lock().await;
            let cooldown_until = Instant::now() + self.policy.cooldown();
            let Some(session) = inner.session_mut(id) else {
                return;
            };
            if session.state != SessionState::Recording {
                return;
            }
            session.state = SessionState::Stopping;
            if let Some(watcher) = session.watcher.take() {
                watcher.abort();
            }
            let encoder = session.encoder.take();
            inner.cooldown_until = Some(cooldown_until);
            tracing::info!(session = %id, "Stopping ({:?})", trigger);
            self.emit_state(id, SessionState::Stopping);
            encoder
        };

        let result = match encoder {
            Some(encoder) => encoder.finalize().await,
            None => Err(EncoderError::Internal("recorder missing".to_string())),
        };

        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session_mut(id) else {
            return;
        };
        if session.state != SessionState::Stopping {
            tracing::debug!(session = %id, "Finalized after cancellation, clip dropped");
            return;
        }
        let outcome = match result {
            Ok(clip) => SessionOutcome::Completed(clip),
            Err(e) => {
                tracing::warn!(session = %id, "Finalize failed: {}", e);
                SessionOutcome::failed(e.kind())
            }
        };
        self.finish(session, outcome);
    }

    /// Fail a recording session because of an encoder fault
    async fn fail_recording(&self, id: SessionId, kind: ErrorKind, reason: String) {
        let mut inner = self.inner.lock().await;
        let cooldown_until = Instant::now() + self.policy.cooldown();
        let Some(session) = inner.session_mut(id) else {
            return;
        };
        if session.state != SessionState::Recording {
            return;
        }
        tracing::error!(session = %id, "Recording failed: {}", reason);
        self.finish(session, SessionOutcome::failed(kind));
        inner.cooldown_until = Some(cooldown_until);
    }

    /// Cancel the active session; no clip is produced
    pub async fn cancel(&self) -> Result<SessionId, CaptureError> {
        let mut inner = self.inner.lock().await;
        let cooldown_until = Instant::now() + self.policy.cooldown();
        let session = match inner.session.as_mut() {
            Some(s) if s.state.is_active() => s,
            _ => return Err(CaptureError::NoActiveSession),
        };
        let id = session.id;
        let was_recording = session.state == SessionState::Recording;
        tracing::info!(session = %id, "Cancelling from {:?}", session.state);
        self.finish(session, SessionOutcome::Cancelled);
        if was_recording {
            inner.cooldown_until = Some(cooldown_until);
        }
        Ok(id)
    }

    /// Wait for session `id` to reach a terminal state
    ///
    /// `None` when the id is unknown or its outcome is no longer retained.
    pub async fn wait_finished(&self, id: SessionId) -> Option<SessionOutcome> {
        let (mut rx, finished_before) = {
            let inner = self.inner.lock().await;
            let rx = self.finished_tx.subscribe();
            let (outcome, total) = {
                let log = rx.borrow();
                (log.outcome(id).cloned(), log.total)
            };
            if outcome.is_some() {
                return outcome;
            }
            if inner.session.as_ref().map(|s| s.id) != Some(id) {
                return None;
            }
            (rx, total)
        };

        // `id` is the current session, so it is the next one to finish: once
        // the total moves, its outcome is either retained or already evicted
        let log = rx
            .wait_for(|log| log.total > finished_before)
            .await
            .ok()?;
        log.outcome(id).cloned()
    }

    /// Release whatever the previous session still holds
    fn release_previous(&self, inner: &mut Inner) {
        let cooldown_until = Instant::now() + self.policy.cooldown();
        let Some(previous) = inner.session.as_mut() else {
            return;
        };

        if previous.state.is_active() {
            let was_recording = previous.state == SessionState::Recording;
            tracing::warn!(
                session = %previous.id,
                "Superseded while {:?}, cancelling",
                previous.state
            );
            self.finish(previous, SessionOutcome::Cancelled);
            if was_recording {
                inner.cooldown_until = Some(cooldown_until);
            }
        } else if previous.holds_handles() {
            tracing::warn!(session = %previous.id, "Terminal session still held handles");
            previous.release();
        }
    }

    /// Release handles, enter the outcome's terminal state and publish it
    fn finish(&self, session: &mut ActiveSession, outcome: SessionOutcome) {
        session.release();
        session.state = outcome.state();
        let id = session.id;
        tracing::info!(session = %id, "Session finished: {:?}", session.state);
        self.emit_state(id, session.state);

        match &outcome {
            SessionOutcome::Completed(clip) => {
                let _ = self.event_tx.send(CaptureEvent::Completed {
                    session: id,
                    clip: clip.clone(),
                });
            }
            SessionOutcome::Failed {
                kind,
                retry_silently,
            } => {
                let _ = self.event_tx.send(CaptureEvent::Error {
                    session: id,
                    kind: kind.clone(),
                    message: kind.user_message(),
                    retry_silently: *retry_silently,
                });
            }
            SessionOutcome::Cancelled => {}
        }

        let finished = FinishedSession {
            id,
            word: session.word.clone(),
            outcome,
        };
        self.finished_tx.send_modify(|log| {
            log.recent.push_back(finished);
            log.total += 1;
            if log.recent.len() > HISTORY_LEN {
                log.recent.pop_front();
            }
        });
    }

    fn emit_state(&self, session: SessionId, state: SessionState) {
        let _ = self
            .event_tx
            .send(CaptureEvent::StateChanged { session, state });
    }
}
