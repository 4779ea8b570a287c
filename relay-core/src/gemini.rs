//! Gemini `generateContent` client for multi-turn chat.
//!
//! The API is stateless, so `GeminiChat` owns the running [`Transcript`] and
//! sends all of it on every turn. A client is cheap to build and is meant to
//! live for a single turn: load the persisted transcript, send one message,
//! then hand the transcript back for storage.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::models::turn::{Part, Role, Transcript, Turn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const GEMINI_PRO: &str = "gemini-pro";

/// Models this client knows how to talk to.
pub const SUPPORTED_MODELS: &[&str] = &[GEMINI_PRO];

pub fn is_supported(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model {0} is not supported")]
    UnsupportedModel(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// The request URL carries `?key=`; keep it out of error text and logs.
impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl ModelSettings {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Point the client somewhere else (for testing / proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl From<&ModelConfig> for ModelSettings {
    fn from(config: &ModelConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.name.clone(),
            base_url: config.base_url.clone(),
            timeout: Duration::from_secs(config.request_timeout_seconds),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

/// Every harm category set to `BLOCK_NONE`, so replies are never silently
/// filtered out of a conversation.
const BLOCK_NOTHING: [SafetySetting; 4] = [
    SafetySetting {
        category: "HARM_CATEGORY_HARASSMENT",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_HATE_SPEECH",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        threshold: "BLOCK_NONE",
    },
    SafetySetting {
        category: "HARM_CATEGORY_DANGEROUS_CONTENT",
        threshold: "BLOCK_NONE",
    },
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: &'a Transcript,
    safety_settings: &'a [SafetySetting],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyRating {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub probability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Absent when the candidate was stopped before producing text.
    #[serde(default, deserialize_with = "lenient_content")]
    pub content: Option<Turn>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub safety_ratings: Vec<SafetyRating>,
}

/// Response-side content, where `role` may be missing and `{}` may stand in
/// for no content at all.
#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(default)]
    role: Option<Role>,
}

fn lenient_content<'de, D>(deserializer: D) -> Result<Option<Turn>, D::Error>
where
    D: Deserializer<'de>,
{
    let wire = Option::<WireContent>::deserialize(deserializer)?;
    Ok(wire.and_then(|w| {
        if w.parts.is_empty() && w.role.is_none() {
            return None;
        }
        Some(Turn {
            parts: w.parts,
            role: w.role.unwrap_or(Role::Model),
        })
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub safety_ratings: Vec<SafetyRating>,
}

/// Decoded `generateContent` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReply {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl ModelReply {
    /// Flattens every part of every candidate, in response order, with no
    /// separator.
    pub fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .map(|part| part.text.as_str())
            .collect()
    }

    fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.candidates.iter().filter_map(|c| c.content.as_ref())
    }
}

// ============================================================================
// GeminiChat
// ============================================================================

#[derive(Debug, Clone)]
pub struct GeminiChat {
    client: Client,
    settings: ModelSettings,
    transcript: Transcript,
}

impl GeminiChat {
    pub fn new(settings: ModelSettings) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Self::with_client(client, settings)
    }

    /// Build on an existing HTTP client so connection pools are shared between
    /// per-turn instances.
    pub fn with_client(client: Client, settings: ModelSettings) -> Result<Self, ModelError> {
        if !is_supported(&settings.model) {
            return Err(ModelError::UnsupportedModel(settings.model));
        }
        if settings.api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        Ok(Self {
            client,
            settings,
            transcript: Transcript::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Replace the in-memory transcript wholesale.
    pub fn load_transcript(&mut self, transcript: Transcript) {
        self.transcript = transcript;
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }

    /// Append a user turn, send the whole transcript, and append every
    /// returned candidate. One attempt, no retry.
    pub async fn send_turn(&mut self, text: &str) -> Result<ModelReply, ModelError> {
        self.transcript.push(Turn::user(text));

        let body = serde_json::to_vec(&GenerateRequest {
            contents: &self.transcript,
            safety_settings: &BLOCK_NOTHING,
        })?;

        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url, self.settings.model
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.settings.api_key.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;

        if !status.is_success() {
            tracing::error!(
                status = status.as_u16(),
                body = %raw,
                model = %self.settings.model,
                "Gemini API error"
            );
            return Err(ModelError::Api {
                status: status.as_u16(),
                body: raw,
            });
        }

        let reply: ModelReply = serde_json::from_str(&raw)?;

        for turn in reply.turns() {
            self.transcript.push(turn.clone());
        }

        tracing::debug!(
            candidates = reply.candidates.len(),
            turns = self.transcript.len(),
            "Gemini turn completed"
        );

        Ok(reply)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> ModelSettings {
        ModelSettings::new("test-api-key", GEMINI_PRO).with_base_url(server.uri())
    }

    fn reply_json(candidates: &[&[&str]]) -> serde_json::Value {
        let candidates: Vec<serde_json::Value> = candidates
            .iter()
            .enumerate()
            .map(|(i, parts)| {
                let parts: Vec<serde_json::Value> = parts
                    .iter()
                    .map(|t| serde_json::json!({ "text": t }))
                    .collect();
                serde_json::json!({
                    "content": { "parts": parts, "role": "model" },
                    "finishReason": "STOP",
                    "index": i,
                    "safetyRatings": [
                        { "category": "HARM_CATEGORY_HARASSMENT", "probability": "NEGLIGIBLE" }
                    ]
                })
            })
            .collect();
        serde_json::json!({
            "candidates": candidates,
            "promptFeedback": { "safetyRatings": [] }
        })
    }

    fn two_turn_history() -> Transcript {
        Transcript::from(vec![
            Turn::user("earlier question"),
            Turn::model(vec![Part::text("earlier answer")]),
        ])
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported("gemini-pro"));
        assert!(!is_supported("dummy-model"));
        assert!(!is_supported(""));
        assert!(!is_supported("gemini-pro "));
        assert!(!is_supported("Gemini-Pro"));
        assert!(!is_supported("gemini"));
    }

    #[test]
    fn test_new_rejects_unsupported_model() {
        let result = GeminiChat::new(ModelSettings::new("key", "dummy-model"));
        match result {
            Err(ModelError::UnsupportedModel(model)) => assert_eq!(model, "dummy-model"),
            other => panic!("Expected UnsupportedModel, got {:?}", other),
        }
    }

    #[test]
    fn test_new_rejects_missing_api_key() {
        let result = GeminiChat::new(ModelSettings::new("", GEMINI_PRO));
        assert!(matches!(result, Err(ModelError::MissingApiKey)));
    }

    #[test]
    fn test_reply_text_flattens_all_candidates_in_order() {
        let reply: ModelReply = serde_json::from_value(reply_json(&[&["a", "b"], &["c"]])).unwrap();
        assert_eq!(reply.text(), "abc");
    }

    #[test]
    fn test_reply_decodes_candidate_without_content() {
        let reply: ModelReply = serde_json::from_value(serde_json::json!({
            "candidates": [{ "finishReason": "SAFETY", "index": 0 }]
        }))
        .unwrap();
        assert_eq!(reply.candidates.len(), 1);
        assert!(reply.candidates[0].content.is_none());
        assert_eq!(reply.text(), "");
    }

    #[test]
    fn test_reply_decodes_empty_or_roleless_content() {
        let reply: ModelReply = serde_json::from_value(serde_json::json!({
            "candidates": [
                { "content": {}, "finishReason": "OTHER" },
                { "content": { "parts": [{ "text": "x" }] }, "index": 1 },
                { "content": null, "index": 2 }
            ]
        }))
        .expect("lenient candidate content");

        assert_eq!(reply.candidates.len(), 3);
        assert!(reply.candidates[0].content.is_none());
        assert_eq!(
            reply.candidates[1].content,
            Some(Turn::model(vec![Part::text("x")]))
        );
        assert!(reply.candidates[2].content.is_none());
        assert_eq!(reply.text(), "x");
    }

    #[tokio::test]
    async fn test_send_turn_keeps_roleless_candidate_in_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [
                    { "content": {}, "finishReason": "OTHER" },
                    { "content": { "parts": [{ "text": "still here" }] }, "finishReason": "STOP" }
                ]
            })))
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        let reply = chat.send_turn("hi").await.expect("reply decodes");

        assert_eq!(reply.text(), "still here");
        assert_eq!(chat.transcript().len(), 2);
        assert_eq!(chat.transcript().turns()[1].role, Role::Model);
    }

    #[tokio::test]
    async fn test_transport_error_hides_api_key() {
        // Nothing listens on port 1, so the request fails before any response.
        let settings = ModelSettings::new("SECRET-KEY-123", GEMINI_PRO)
            .with_base_url("http://127.0.0.1:1");
        let mut chat = GeminiChat::new(settings).unwrap();

        let err = chat.send_turn("hi").await.unwrap_err();
        assert!(matches!(err, ModelError::Http(_)), "got {:?}", err);
        assert!(!err.to_string().contains("SECRET-KEY-123"), "leaked: {}", err);
        assert!(!format!("{:?}", err).contains("SECRET-KEY-123"));
    }

    #[tokio::test]
    async fn test_send_turn_posts_full_transcript_with_safety_settings() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(query_param("key", "test-api-key"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "contents": [
                    { "parts": [{ "text": "earlier question" }], "role": "user" },
                    { "parts": [{ "text": "earlier answer" }], "role": "model" },
                    { "parts": [{ "text": "hi" }], "role": "user" }
                ],
                "safetySettings": [
                    { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
                    { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
                    { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
                    { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_json(&[&["hello!"]])))
            .expect(1)
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        chat.load_transcript(two_turn_history());

        let reply = chat.send_turn("hi").await.expect("send_turn failed");
        assert_eq!(reply.text(), "hello!");

        // N + user turn + one candidate turn
        let transcript = chat.transcript();
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript.turns()[2], Turn::user("hi"));
        assert_eq!(transcript.turns()[3].role, Role::Model);
        assert_eq!(transcript.turns()[3].text(), "hello!");
    }

    #[tokio::test]
    async fn test_send_turn_appends_every_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_json(&[&["a", "b"], &["c"]])))
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        let reply = chat.send_turn("hi").await.unwrap();

        assert_eq!(reply.text(), "abc");
        assert_eq!(chat.transcript().len(), 3);
        assert_eq!(chat.transcript().turns()[1].text(), "ab");
        assert_eq!(chat.transcript().turns()[2].text(), "c");
    }

    #[tokio::test]
    async fn test_send_turn_with_no_candidates_only_adds_user_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "promptFeedback": { "blockReason": "OTHER" }
            })))
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        let reply = chat.send_turn("hi").await.unwrap();

        assert!(reply.candidates.is_empty());
        assert_eq!(reply.text(), "");
        assert_eq!(
            reply.prompt_feedback.and_then(|f| f.block_reason).as_deref(),
            Some("OTHER")
        );
        assert_eq!(chat.transcript().len(), 1);
    }

    #[tokio::test]
    async fn test_send_turn_returns_api_error_with_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request body"))
            .expect(1)
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        match chat.send_turn("hi").await {
            Err(ModelError::Api { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad request body");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_turn_rejects_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"candidates\": ["))
            .mount(&server)
            .await;

        let mut chat = GeminiChat::new(settings(&server)).unwrap();
        let result = chat.send_turn("hi").await;
        assert!(matches!(result, Err(ModelError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_replayed_transcript_builds_identical_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_json(&[&["ok"]])))
            .mount(&server)
            .await;

        // Live: two turns on one instance.
        let mut live = GeminiChat::new(settings(&server)).unwrap();
        live.send_turn("first").await.unwrap();
        let after_first = live.transcript().clone();
        live.send_turn("second").await.unwrap();

        // Resumed: fresh instance replaying the stored transcript.
        let stored = after_first.to_json().unwrap();
        let mut resumed = GeminiChat::new(settings(&server)).unwrap();
        resumed.load_transcript(Transcript::from_json(&stored).unwrap());
        resumed.send_turn("second").await.unwrap();

        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].body, requests[2].body);
        assert_eq!(live.transcript(), resumed.transcript());
    }
}
