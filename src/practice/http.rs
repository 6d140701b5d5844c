//! HTTP client for the scoring/TTS service

use super::{Prompt, PronunciationService, Score, ServiceError, WordMetadata};
use crate::audio::EncodedClip;
use crate::config::AudioSettings;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Prompts are synthesized as MP3
const PROMPT_MIME: &str = "audio/mpeg";

#[derive(Debug, Deserialize)]
struct PromptResponse {
    word: String,
    audio_base64: String,
    #[serde(default)]
    audio_settings: Option<AudioSettings>,
    #[serde(default)]
    metadata: Option<WordMetadata>,
}

impl PromptResponse {
    fn into_prompt(self) -> Result<Prompt, ServiceError> {
        let audio = STANDARD
            .decode(self.audio_base64.trim())
            .map_err(|e| ServiceError::Decode(format!("prompt audio: {}", e)))?;
        Ok(Prompt {
            word: self.word,
            audio,
            mime_type: PROMPT_MIME.to_string(),
            audio_settings: self.audio_settings,
            metadata: self.metadata,
        })
    }
}

/// `PronunciationService` over the service's REST API
#[derive(Debug, Clone)]
pub struct HttpPronunciationService {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpPronunciationService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// `check_answer` URL with the word as an encoded path segment
    fn check_answer_url(&self, word: &str) -> Result<reqwest::Url, ServiceError> {
        let mut url = reqwest::Url::parse(&self.url("check_answer"))
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::InvalidRequest(format!("bad base URL {}", self.base_url)))?
            .push(word);
        Ok(url)
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ServiceError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ServiceError> {
        let response = self
            .http_client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl PronunciationService for HttpPronunciationService {
    async fn next_word(&self, lang: &str) -> Result<Prompt, ServiceError> {
        let response: PromptResponse = self.get("next_word", &[("lang", lang)]).await?;
        let prompt = response.into_prompt()?;
        tracing::info!("Next word {:?}: {} bytes of prompt audio", prompt.word, prompt.audio.len());
        Ok(prompt)
    }

    async fn score_pronunciation(
        &self,
        word: &str,
        clip: &EncodedClip,
    ) -> Result<Score, ServiceError> {
        let url = self.check_answer_url(word)?;
        tracing::info!(
            "Sending answer for {:?}: {} bytes {}",
            word,
            clip.len(),
            clip.mime_type
        );

        let file_part = reqwest::multipart::Part::bytes(clip.bytes.clone())
            .file_name(format!("recording.{}", clip.extension()))
            .mime_str(&clip.mime_type)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", file_part);

        let response = self
            .http_client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        let score: Score = Self::read_json(response).await?;
        tracing::info!(
            "Answer scored: {:?} correct={} score={}",
            score.transcript,
            score.is_correct,
            score.score
        );
        Ok(score)
    }

    async fn get_audio_settings(&self) -> Result<AudioSettings, ServiceError> {
        self.get("get_audio_settings", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_encoded_in_the_answer_path() {
        let service = HttpPronunciationService::new("http://localhost:8000/api/");
        assert_eq!(service.base_url(), "http://localhost:8000/api");

        let url = service.check_answer_url("שלום").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/check_answer/%D7%A9%D7%9C%D7%95%D7%9D"
        );

        let url = service.check_answer_url("a/b").unwrap();
        assert!(url.as_str().ends_with("/check_answer/a%2Fb"));
    }

    #[test]
    fn prompt_payload_is_decoded() {
        let json = r#"{
            "word": "שלום",
            "audio_base64": "SUQzBAA=",
            "audio_settings": {"silenceThreshold": 20},
            "metadata": {"english": "hello", "category": "greeting"}
        }"#;
        let response: PromptResponse = serde_json::from_str(json).unwrap();
        let prompt = response.into_prompt().unwrap();

        assert_eq!(prompt.word, "שלום");
        assert_eq!(&prompt.audio[..3], b"ID3");
        assert_eq!(prompt.mime_type, PROMPT_MIME);
        assert_eq!(prompt.audio_settings.unwrap().silence_threshold, 20);
        assert_eq!(prompt.metadata.unwrap().english.as_deref(), Some("hello"));
    }

    #[test]
    fn bad_prompt_audio_is_a_decode_error() {
        let response = PromptResponse {
            word: "x".to_string(),
            audio_base64: "not base64!".to_string(),
            audio_settings: None,
            metadata: None,
        };
        assert!(matches!(
            response.into_prompt(),
            Err(ServiceError::Decode(_))
        ));
    }

    #[test]
    fn score_payload_uses_service_field_names() {
        let json = r#"{
            "user_response": "shalom",
            "is_correct": true,
            "correct_answer": "hello",
            "pronunciation_score": 87,
            "metadata": {}
        }"#;
        let score: Score = serde_json::from_str(json).unwrap();
        assert_eq!(score.transcript, "shalom");
        assert!(score.is_correct);
        assert_eq!(score.score, 87);
    }
}
