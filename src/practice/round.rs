//! One practice round: prompt, capture, score

use super::{Prompt, PronunciationService, Score, ServiceError};
use crate::audio::{ErrorKind, MediaPlatform};
use crate::session::{CaptureController, CaptureError, SessionOutcome};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Playback failed: {0}")]
pub struct PlaybackError(pub String);

/// Plays the spoken prompt; capture starts once it returns
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PromptPlayer: Send + Sync {
    async fn play(&self, prompt: &Prompt) -> Result<(), PlaybackError>;
}

/// Player for shells without audio output
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentPlayer;

#[async_trait]
impl PromptPlayer for SilentPlayer {
    async fn play(&self, prompt: &Prompt) -> Result<(), PlaybackError> {
        tracing::debug!(
            "Prompt for {:?} not played ({} bytes {})",
            prompt.word,
            prompt.audio.len(),
            prompt.mime_type
        );
        Ok(())
    }
}

/// Errors that abort a round
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Scored { word: String, score: Score },
    /// Nothing usable was recorded; start over without an error modal
    RetrySilently { word: String },
    Failed { word: String, kind: ErrorKind },
    Cancelled { word: String },
}

/// Fetch the next word, play its prompt, record the answer and score it
pub async fn run_round<P, S, Pl>(
    controller: &CaptureController<P>,
    service: &S,
    player: &Pl,
    lang: &str,
    device_id: Option<&str>,
) -> Result<RoundOutcome, RoundError>
where
    P: MediaPlatform,
    S: PronunciationService + ?Sized,
    Pl: PromptPlayer + ?Sized,
{
    let prompt = service.next_word(lang).await?;
    let word = prompt.word.clone();
    player.play(&prompt).await?;

    let id = match controller.request(&word, device_id).await {
        Ok(id) => id,
        Err(CaptureError::Capture(kind)) => return Ok(RoundOutcome::Failed { word, kind }),
        Err(CaptureError::Cancelled) => return Ok(RoundOutcome::Cancelled { word }),
        Err(e) => return Err(e.into()),
    };

    let outcome = controller
        .wait_finished(id)
        .await
        .ok_or(CaptureError::NoActiveSession)?;

    match outcome {
        SessionOutcome::Completed(clip) => {
            let score = service.score_pronunciation(&word, &clip).await?;
            Ok(RoundOutcome::Scored { word, score })
        }
        SessionOutcome::Failed {
            retry_silently: true,
            ..
        } => {
            tracing::info!("Nothing recorded for {:?}, retrying silently", word);
            Ok(RoundOutcome::RetrySilently { word })
        }
        SessionOutcome::Failed { kind, .. } => Ok(RoundOutcome::Failed { word, kind }),
        SessionOutcome::Cancelled => Ok(RoundOutcome::Cancelled { word }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakePlatform;
    use crate::audio::PlatformErrorKind;
    use crate::config::{AudioSettings, CapturePolicy};
    use crate::practice::MockPronunciationService;

    fn prompt(word: &str) -> Prompt {
        Prompt {
            word: word.to_string(),
            audio: vec![0u8; 16],
            mime_type: "audio/mpeg".to_string(),
            audio_settings: None,
            metadata: None,
        }
    }

    fn controller(platform: &FakePlatform) -> CaptureController<FakePlatform> {
        CaptureController::new(
            platform.clone(),
            AudioSettings::default(),
            CapturePolicy::default(),
        )
    }

    fn service_for(word: &'static str) -> MockPronunciationService {
        let mut service = MockPronunciationService::new();
        service
            .expect_next_word()
            .times(1)
            .returning(move |_| Ok(prompt(word)));
        service
    }

    fn player() -> MockPromptPlayer {
        let mut player = MockPromptPlayer::new();
        player.expect_play().times(1).returning(|_| Ok(()));
        player
    }

    #[tokio::test(start_paused = true)]
    async fn completed_clip_is_scored() {
        let platform = FakePlatform::new();
        let c = controller(&platform);
        let mut service = service_for("שלום");
        service
            .expect_score_pronunciation()
            .times(1)
            .returning(|word, clip| {
                assert_eq!(word.to_string(), "שלום");
                assert_eq!(clip.len(), 4096);
                Ok(Score {
                    transcript: "shalom".to_string(),
                    is_correct: true,
                    correct_answer: "hello".to_string(),
                    score: 92,
                })
            });

        let outcome = run_round(&c, &service, &player(), "iw", None).await.unwrap();
        match outcome {
            RoundOutcome::Scored { word, score } => {
                assert_eq!(word, "שלום");
                assert_eq!(score.score, 92);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(platform.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_recording_retries_silently() {
        let platform = FakePlatform::new();
        platform.set_final_chunk(Vec::new());
        let c = controller(&platform);
        let mut service = service_for("ספר");
        service.expect_score_pronunciation().never();

        let outcome = run_round(&c, &service, &player(), "iw", None).await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::RetrySilently {
                word: "ספר".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn denied_microphone_fails_the_round() {
        let platform = FakePlatform::new();
        platform.fail_open(PlatformErrorKind::NotAllowed);
        let c = controller(&platform);
        let mut service = service_for("מים");
        service.expect_score_pronunciation().never();

        let outcome = run_round(&c, &service, &player(), "iw", None).await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Failed {
                word: "מים".to_string(),
                kind: ErrorKind::PermissionDenied
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn capture_waits_for_the_prompt() {
        let platform = FakePlatform::new();
        let c = controller(&platform);
        let service = service_for("בית");
        let mut player = MockPromptPlayer::new();
        player
            .expect_play()
            .returning(|_| Err(PlaybackError("no output device".to_string())));

        let err = run_round(&c, &service, &player, "iw", None).await.unwrap_err();
        assert!(matches!(err, RoundError::Playback(_)));
        assert!(platform.open_attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn service_errors_abort_the_round() {
        let platform = FakePlatform::new();
        let c = controller(&platform);
        let mut service = MockPronunciationService::new();
        service
            .expect_next_word()
            .returning(|_| Err(ServiceError::Status { status: 500, body: "boom".to_string() }));

        let err = run_round(&c, &service, &SilentPlayer, "iw", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoundError::Service(ServiceError::Status {
                status: 500,
                body: "boom".to_string()
            })
        );
    }
}
