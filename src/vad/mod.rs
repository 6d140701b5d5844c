//! Voice-activity detection
//!
//! Samples the stream's analyser on every tick, and asks for an automatic
//! stop once silence has been confirmed (after a warm-up floor) or the
//! recording hit its hard ceiling.

use crate::audio::analyser::average_volume;
use crate::audio::AnalyserNode;
use crate::config::AudioSettings;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant, MissedTickBehavior};

/// Why the detector asked for a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStopReason {
    /// Sustained silence after the warm-up
    Silence,
    /// Recording reached the maximum duration
    MaxDuration,
}

/// Result of one detector tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadDecision {
    Continue,
    AutoStop(AutoStopReason),
    /// The detector already fired; nothing left to do
    Finished,
}

/// Observable detector state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadState {
    /// Volume (0-100) seen on the last tick
    pub volume: f32,
    pub silence_started_at: Option<Instant>,
    /// Past the warm-up floor
    pub listening: bool,
}

/// Silence confirmation logic, independent of any clock or task
pub struct VoiceActivityDetector {
    settings: AudioSettings,
    started_at: Instant,
    state: VadState,
    fired: bool,
}

impl VoiceActivityDetector {
    pub fn new(settings: &AudioSettings, started_at: Instant) -> Self {
        Self {
            settings: *settings,
            started_at,
            state: VadState {
                volume: 0.0,
                silence_started_at: None,
                listening: false,
            },
            fired: false,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Process one frame of frequency bins
    pub fn tick(&mut self, now: Instant, bins: &[u8]) -> VadDecision {
        self.observe(now, average_volume(bins))
    }

    /// Process one volume sample (0-100)
    pub fn observe(&mut self, now: Instant, volume: f32) -> VadDecision {
        if self.fired {
            return VadDecision::Finished;
        }
        self.state.volume = volume;

        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed >= self.settings.max_recording() {
            return self.fire(AutoStopReason::MaxDuration);
        }

        if elapsed < self.settings.min_recording() {
            self.state.listening = false;
            return VadDecision::Continue;
        }
        self.state.listening = true;

        if volume < self.settings.silence_threshold as f32 {
            match self.state.silence_started_at {
                None => self.state.silence_started_at = Some(now),
                Some(since) => {
                    if now.saturating_duration_since(since) > self.settings.silence_duration() {
                        return self.fire(AutoStopReason::Silence);
                    }
                }
            }
        } else {
            self.state.silence_started_at = None;
        }

        VadDecision::Continue
    }

    /// Fire the hard ceiling from an external timer
    pub fn expire(&mut self) -> VadDecision {
        if self.fired {
            return VadDecision::Finished;
        }
        self.fire(AutoStopReason::MaxDuration)
    }

    fn fire(&mut self, reason: AutoStopReason) -> VadDecision {
        self.fired = true;
        VadDecision::AutoStop(reason)
    }
}

/// Detector loop running on the tokio runtime
///
/// The auto-stop callback is a oneshot, so it can be delivered at most once.
pub struct VadHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    task: JoinHandle<()>,
}

impl VadHandle {
    pub fn start(
        mut analyser: Box<dyn AnalyserNode>,
        settings: &AudioSettings,
        started_at: Instant,
        tick: Duration,
        on_auto_stop: oneshot::Sender<AutoStopReason>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let mut detector = VoiceActivityDetector::new(settings, started_at);
        let ceiling_at = started_at + settings.max_recording();

        let task = tokio::spawn(async move {
            let mut bins = vec![0u8; analyser.frequency_bin_count()];
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let ceiling = sleep_until(ceiling_at);
            tokio::pin!(ceiling);

            let decision = loop {
                let decision = tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break VadDecision::Finished,
                    _ = &mut ceiling => detector.expire(),
                    _ = ticker.tick() => {
                        analyser.byte_frequency_data(&mut bins);
                        detector.tick(Instant::now(), &bins)
                    }
                };
                if decision != VadDecision::Continue {
                    break decision;
                }
            };

            if let VadDecision::AutoStop(reason) = decision {
                tracing::info!("VAD auto-stop: {:?}", reason);
                let _ = on_auto_stop.send(reason);
            } else {
                tracing::debug!("VAD loop stopped");
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop the loop; idempotent
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for VadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_ignored_during_warm_up() {
        let t0 = Instant::now();
        let mut vad = VoiceActivityDetector::new(&AudioSettings::default(), t0);

        for step in 0..31 {
            let now = t0 + ms(step * 16);
            assert_eq!(vad.observe(now, 0.0), VadDecision::Continue);
        }
        assert!(!vad.state().listening);
        assert_eq!(vad.state().silence_started_at, None);

        assert_eq!(vad.observe(t0 + ms(500), 0.0), VadDecision::Continue);
        assert!(vad.state().listening);
        assert_eq!(vad.state().silence_started_at, Some(t0 + ms(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_must_be_sustained_past_the_duration() {
        let t0 = Instant::now();
        let mut vad = VoiceActivityDetector::new(&AudioSettings::default(), t0);

        vad.observe(t0 + ms(1000), 0.0);
        assert_eq!(vad.observe(t0 + ms(2000), 0.0), VadDecision::Continue);
        assert_eq!(
            vad.observe(t0 + ms(2001), 0.0),
            VadDecision::AutoStop(AutoStopReason::Silence)
        );
        assert_eq!(vad.observe(t0 + ms(2100), 0.0), VadDecision::Finished);
        assert!(vad.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn speech_resets_the_confirmation_timer() {
        let t0 = Instant::now();
        let mut vad = VoiceActivityDetector::new(&AudioSettings::default(), t0);

        // 999 ms of silence, one loud frame, then silence again
        vad.observe(t0 + ms(1000), 0.0);
        assert_eq!(vad.observe(t0 + ms(1999), 0.0), VadDecision::Continue);
        assert_eq!(vad.observe(t0 + ms(2000), 50.0), VadDecision::Continue);
        assert_eq!(vad.state().silence_started_at, None);

        vad.observe(t0 + ms(2016), 0.0);
        assert_eq!(vad.observe(t0 + ms(3000), 0.0), VadDecision::Continue);
        assert_eq!(
            vad.observe(t0 + ms(3017), 0.0),
            VadDecision::AutoStop(AutoStopReason::Silence)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_fires_regardless_of_signal() {
        let t0 = Instant::now();
        let mut vad = VoiceActivityDetector::new(&AudioSettings::default(), t0);

        assert_eq!(vad.observe(t0 + ms(7999), 90.0), VadDecision::Continue);
        assert_eq!(
            vad.observe(t0 + ms(8000), 90.0),
            VadDecision::AutoStop(AutoStopReason::MaxDuration)
        );
        assert_eq!(vad.expire(), VadDecision::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_strict() {
        let t0 = Instant::now();
        let mut vad = VoiceActivityDetector::new(&AudioSettings::default(), t0);
        vad.observe(t0 + ms(600), 15.0);
        assert_eq!(vad.state().silence_started_at, None);
        vad.observe(t0 + ms(616), 14.9);
        assert!(vad.state().silence_started_at.is_some());
    }

    struct LevelAnalyser(Arc<AtomicU8>);

    impl AnalyserNode for LevelAnalyser {
        fn frequency_bin_count(&self) -> usize {
            64
        }

        fn byte_frequency_data(&mut self, out: &mut [u8]) {
            out.fill(self.0.load(Ordering::SeqCst));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reports_silence_once_confirmed() {
        let level = Arc::new(AtomicU8::new(200));
        let (tx, rx) = oneshot::channel();
        let t0 = Instant::now();
        let _vad = VadHandle::start(
            Box::new(LevelAnalyser(Arc::clone(&level))),
            &AudioSettings::default(),
            t0,
            ms(16),
            tx,
        );

        tokio::time::sleep(ms(2000)).await;
        level.store(0, Ordering::SeqCst);

        let reason = rx.await.unwrap();
        assert_eq!(reason, AutoStopReason::Silence);
        let elapsed = t0.elapsed();
        assert!(elapsed >= ms(3000) && elapsed <= ms(3100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_enforces_the_ceiling() {
        let (tx, rx) = oneshot::channel();
        let t0 = Instant::now();
        let _vad = VadHandle::start(
            Box::new(LevelAnalyser(Arc::new(AtomicU8::new(255)))),
            &AudioSettings::default(),
            t0,
            ms(16),
            tx,
        );

        assert_eq!(rx.await.unwrap(), AutoStopReason::MaxDuration);
        assert!(t0.elapsed() <= ms(8016));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_loop_never_fires() {
        let (tx, rx) = oneshot::channel();
        let mut vad = VadHandle::start(
            Box::new(LevelAnalyser(Arc::new(AtomicU8::new(0)))),
            &AudioSettings::default(),
            Instant::now(),
            ms(16),
            tx,
        );

        tokio::time::sleep(ms(100)).await;
        vad.stop();
        vad.stop();
        // Sender dropped without a value
        assert!(rx.await.is_err());
        assert!(vad.is_finished());
    }
}
