//! OpenAI-compatible client for the speech and polish collaborators.
//!
//! Enabled when `OPENAI_API_KEY` is set; `OPENAI_BASE_URL` points it at any
//! compatible server. Absence simply disables voice transcription and
//! polishing - the coordinator falls back to raw content.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ccbridge_core::notify_surface::{Polisher, SpeechService};
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_STT_MODEL: &str = "whisper-1";
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_TTS_VOICE: &str = "alloy";

const POLISH_PROMPT: &str = "You clean up dictated text. Fix punctuation, casing and \
obvious speech-to-text mistakes. Keep the author's words and intent. Reply with the \
cleaned text only.";
const SUMMARIZE_PROMPT: &str = "Summarize the following assistant reply in at most \
three short sentences for a phone notification. Reply with the summary only.";

pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    stt_model: String,
    tts_model: String,
    tts_voice: String,
}

impl OpenAiClient {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Some(Self {
            http: Client::new(),
            base_url,
            api_key,
            chat_model: std::env::var("CCBRIDGE_CHAT_MODEL")
                .unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string()),
            stt_model: std::env::var("CCBRIDGE_STT_MODEL")
                .unwrap_or_else(|_| DEFAULT_STT_MODEL.to_string()),
            tts_model: std::env::var("CCBRIDGE_TTS_MODEL")
                .unwrap_or_else(|_| DEFAULT_TTS_MODEL.to_string()),
            tts_voice: std::env::var("CCBRIDGE_TTS_VOICE")
                .unwrap_or_else(|_| DEFAULT_TTS_VOICE.to_string()),
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.2,
        });

        let response: Value = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("chat completion request")?
            .error_for_status()
            .context("chat completion status")?
            .json()
            .await?;

        response
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow!("chat completion returned no content"))
    }
}

#[async_trait]
impl SpeechService for OpenAiClient {
    async fn transcribe(&self, audio: Vec<u8>, file_name_hint: Option<&str>) -> Result<String> {
        let file_name = file_name_hint
            .map(|hint| {
                std::path::Path::new(hint)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| hint.to_string())
            })
            .unwrap_or_else(|| "voice.ogg".to_string());

        let form = reqwest::multipart::Form::new()
            .text("model", self.stt_model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio).file_name(file_name),
            );

        let url = format!("{}/audio/transcriptions", self.base_url);
        let response: Value = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("transcription request")?
            .error_for_status()
            .context("transcription status")?
            .json()
            .await?;

        let text = response
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("transcription returned no text"))?
            .trim()
            .to_string();
        if text.is_empty() {
            bail!("transcription was empty");
        }
        Ok(text)
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/audio/speech", self.base_url);
        let payload = json!({
            "model": self.tts_model,
            "voice": self.tts_voice,
            "input": text,
            "response_format": "opus",
        });

        let bytes = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("speech request")?
            .error_for_status()
            .context("speech status")?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Polisher for OpenAiClient {
    async fn polish(&self, raw_transcript: &str) -> Result<String> {
        self.chat(POLISH_PROMPT, raw_transcript).await
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        self.chat(SUMMARIZE_PROMPT, text).await
    }
}
