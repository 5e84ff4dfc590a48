//! OpenAI client: Assistants v2 threads and runs, plus audio, vision and summarization.
//!
//! Base URL is configurable so any compatible server (or a test double) can stand in.

use crate::llm::{ConversationEngine, EngineError, RunStatus};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ASSISTANTS_BETA: &str = "assistants=v2";
const SUMMARY_INPUT_LIMIT: usize = 12_000;

const VISION_PROMPT: &str = "Analyze and objectively describe the image:";
const SUMMARY_PROMPT: &str = "You summarize documents. Summarize the provided text concisely, keeping the main ideas.";

/// Models, voice and credentials for the engine client.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub base_url: Option<String>,
    pub api_key: String,
    pub assistant_id: String,
    pub chat_model: String,
    pub transcribe_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f64,
    pub timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: String::new(),
            assistant_id: String::new(),
            chat_model: "gpt-4o-mini".to_string(),
            transcribe_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "onyx".to_string(),
            tts_speed: 1.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Engine backed by the OpenAI HTTP API.
#[derive(Clone)]
pub struct OpenAiEngine {
    base_url: String,
    settings: EngineSettings,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiEngine {
    pub fn new(settings: EngineSettings) -> Result<Self, EngineError> {
        let base_url = settings
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            base_url,
            settings,
            client,
        })
    }

    fn assistants_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.settings.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA)
    }

    fn assistants_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.settings.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.settings.api_key)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, EngineError> {
        let res = self.post("/chat/completions").json(&request).send().await?;
        let res = ensure_success(res, "chat completion").await?;
        let data: CompletionResponse = res.json().await?;
        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(EngineError::Empty("completion choice"))
    }
}

/// Turn a non-2xx response into `EngineError::Api` with status and body.
async fn ensure_success(
    res: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, EngineError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(EngineError::Api(format!("{} {} {}", what, status, body)))
}

/// Cut `text` to at most `limit` bytes on a char boundary.
fn truncate_on_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl ConversationEngine for OpenAiEngine {
    /// POST /threads
    async fn create_conversation(&self) -> Result<String, EngineError> {
        let res = self.assistants_post("/threads").json(&json!({})).send().await?;
        let res = ensure_success(res, "create thread").await?;
        let thread: IdResponse = res.json().await?;
        Ok(thread.id)
    }

    /// POST /threads/{id}/messages
    async fn append_message(&self, handle: &str, text: &str) -> Result<(), EngineError> {
        let body = json!({
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        });
        let res = self
            .assistants_post(&format!("/threads/{}/messages", handle))
            .json(&body)
            .send()
            .await?;
        ensure_success(res, "add message").await?;
        Ok(())
    }

    /// POST /threads/{id}/runs
    async fn start_run(&self, handle: &str) -> Result<String, EngineError> {
        let body = json!({ "assistant_id": self.settings.assistant_id });
        let res = self
            .assistants_post(&format!("/threads/{}/runs", handle))
            .json(&body)
            .send()
            .await?;
        let res = ensure_success(res, "create run").await?;
        let run: IdResponse = res.json().await?;
        Ok(run.id)
    }

    /// GET /threads/{id}/runs/{run_id}
    async fn get_run_status(&self, handle: &str, run_id: &str) -> Result<RunStatus, EngineError> {
        let res = self
            .assistants_get(&format!("/threads/{}/runs/{}", handle, run_id))
            .send()
            .await?;
        let res = ensure_success(res, "get run").await?;
        let run: RunResponse = res.json().await?;
        Ok(RunStatus::from_engine(&run.status))
    }

    /// GET /threads/{id}/messages?order=desc&limit=1
    async fn get_latest_reply(&self, handle: &str) -> Result<String, EngineError> {
        let res = self
            .assistants_get(&format!("/threads/{}/messages?order=desc&limit=1", handle))
            .send()
            .await?;
        let res = ensure_success(res, "list messages").await?;
        let list: MessageList = res.json().await?;
        list.data
            .into_iter()
            .next()
            .and_then(|m| m.content.into_iter().find_map(|c| c.text))
            .map(|t| t.value)
            .ok_or(EngineError::Empty("assistant text"))
    }

    /// POST /audio/speech (mp3)
    async fn synthesize_speech(&self, text: &str) -> Result<Bytes, EngineError> {
        let body = json!({
            "model": self.settings.tts_model,
            "input": text,
            "voice": self.settings.tts_voice,
            "speed": self.settings.tts_speed,
            "response_format": "mp3",
        });
        let res = self.post("/audio/speech").json(&body).send().await?;
        let res = ensure_success(res, "speech").await?;
        Ok(res.bytes().await?)
    }

    /// POST /audio/transcriptions (multipart)
    async fn transcribe(&self, audio: &[u8]) -> Result<String, EngineError> {
        let part = Part::bytes(audio.to_vec()).file_name("audio.ogg");
        let form = Form::new()
            .text("model", self.settings.transcribe_model.clone())
            .part("file", part);
        let res = self
            .post("/audio/transcriptions")
            .multipart(form)
            .send()
            .await?;
        let res = ensure_success(res, "transcribe").await?;
        let out: TranscriptionResponse = res.json().await?;
        Ok(out.text)
    }

    async fn describe_image(&self, url: &str) -> Result<String, EngineError> {
        self.complete(CompletionRequest {
            model: self.settings.chat_model.clone(),
            messages: vec![json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": VISION_PROMPT },
                    { "type": "image_url", "image_url": { "url": url } },
                ],
            })],
            max_tokens: 400,
            temperature: None,
        })
        .await
    }

    async fn summarize(&self, text: &str) -> Result<String, EngineError> {
        let input = truncate_on_boundary(text, SUMMARY_INPUT_LIMIT);
        self.complete(CompletionRequest {
            model: self.settings.chat_model.clone(),
            messages: vec![
                json!({ "role": "system", "content": SUMMARY_PROMPT }),
                json!({ "role": "user", "content": input }),
            ],
            max_tokens: 512,
            temperature: Some(0.3),
        })
        .await
    }
}
