//! Practice loop collaborators
//!
//! The scoring/TTS service is consumed through `PronunciationService`; the
//! capture core only hands it finished clips.

mod http;
pub mod round;

pub use http::HttpPronunciationService;
pub use round::{run_round, PlaybackError, PromptPlayer, RoundError, RoundOutcome, SilentPlayer};

use crate::audio::EncodedClip;
use crate::config::AudioSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Service error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Vocabulary details attached to a prompt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WordMetadata {
    pub hebrew: Option<String>,
    pub english: Option<String>,
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub pronunciation_guide: Option<String>,
    pub example_sentence: Option<String>,
}

/// Spoken prompt for one word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub word: String,
    pub audio: Vec<u8>,
    pub mime_type: String,
    /// Settings suggested by the service alongside the word
    pub audio_settings: Option<AudioSettings>,
    pub metadata: Option<WordMetadata>,
}

/// Verdict on a recorded answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    #[serde(rename = "user_response")]
    pub transcript: String,
    pub is_correct: bool,
    #[serde(default)]
    pub correct_answer: String,
    /// 0-100
    #[serde(rename = "pronunciation_score")]
    pub score: u32,
}

/// Scoring and text-to-speech service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PronunciationService: Send + Sync {
    /// Pick the next word to practise, with its spoken prompt
    async fn next_word(&self, lang: &str) -> Result<Prompt, ServiceError>;

    /// Score a recorded answer; the clip is sent verbatim
    async fn score_pronunciation(
        &self,
        word: &str,
        clip: &EncodedClip,
    ) -> Result<Score, ServiceError>;

    /// Remote default VAD settings
    async fn get_audio_settings(&self) -> Result<AudioSettings, ServiceError>;
}
