//! Content generator abstraction layer.
//!
//! This module provides:
//! - [`ContentGenerator`] trait, implemented once per backend family
//! - [`create_content_generator`] selecting the implementation from config
//! - Concrete implementations: Gemini (API key or Vertex) and
//!   OpenAI-compatible endpoints
//!
//! # Adding a New Backend
//!
//! 1. Create a new file (e.g., `anthropic.rs`)
//! 2. Implement [`ContentGenerator`] and a [`StreamDecoder`]
//! 3. Add an [`AuthType`] variant and wire it in `create_content_generator()`

mod accumulator;
pub mod gemini;
pub mod openai;
pub mod transport;
mod types;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent::collaborators::ToolSchema;
use crate::agent::content::{Content, Part, Role};
use crate::agent::events::{FinishReason, ToolCallRequest, UsageMetadata};
use crate::config::{AuthConfig, AuthType};
use crate::error::Error;
use crate::Result;

pub use accumulator::ToolCallAccumulator;
pub use gemini::{GeminiEndpoint, GeminiGenerator};
pub use openai::OpenAiGenerator;
pub use transport::{HttpTransport, ReqwestTransport, SseStream};

/// Directive added to the system prompt when structured output is requested.
pub const JSON_DIRECTIVE: &str =
    "Respond with a single valid JSON object only. Do not wrap it in markdown code fences or add any other text.";

/// Sampling parameters and output shape of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Ask for a bare JSON object as the reply.
    #[serde(default)]
    pub json_output: bool,
}

/// A backend-agnostic generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub config: GenerationConfig,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            ..Default::default()
        }
    }

    /// Same request aimed at another model.
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }
}

/// A complete, non-streaming reply in canonical form.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: Content,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UsageMetadata>,
}

impl GenerateResponse {
    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &Part> {
        self.content.function_calls()
    }

    /// Model text reply with no calls; mostly useful in tests.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: Content::new(Role::Model, vec![Part::text(text)]),
            finish_reason: Some(FinishReason::Stop),
            usage: None,
        }
    }
}

/// Decoded streaming output of a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    TextDelta(String),
    ThoughtDelta(String),
    ToolCall(ToolCallRequest),
    MalformedToolCall {
        id: String,
        name: String,
        raw: String,
        message: String,
    },
    Usage(UsageMetadata),
    Finished(FinishReason),
}

/// Lazy, finite sequence of decoded stream events.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent>> + Send>>;

/// Capability interface implemented once per backend family.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Single request, single reply.
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    /// Streaming request. Connection-level failures surface here, before any
    /// event is produced; later failures arrive as stream items.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ResponseStream>;

    /// Token count of `contents` for `model`.
    async fn count_tokens(&self, model: &str, contents: &[Content]) -> Result<usize>;

    /// Embedding vectors, one per input text.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Backend family name, for diagnostics.
    fn backend(&self) -> &'static str;
}

/// Incremental decoder from raw stream payloads to [`ResponseEvent`]s.
pub trait StreamDecoder: Send + 'static {
    /// Decode one payload.
    fn push(&mut self, data: &str) -> Result<Vec<ResponseEvent>>;

    /// Flush state once the stream closed.
    fn finish(self) -> Vec<ResponseEvent>;
}

struct DecodeState<D> {
    raw: SseStream,
    decoder: Option<D>,
    pending: VecDeque<Result<ResponseEvent>>,
}

/// Drive `decoder` over `raw`, yielding events as payloads arrive.
///
/// The stream ends after the decoder is flushed, or right after the first
/// error.
pub(crate) fn decode_stream<D: StreamDecoder>(raw: SseStream, decoder: D) -> ResponseStream {
    let state = DecodeState {
        raw,
        decoder: Some(decoder),
        pending: VecDeque::new(),
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            let decoder = state.decoder.as_mut()?;
            match state.raw.next().await {
                Some(Ok(data)) => match decoder.push(&data) {
                    Ok(events) => state.pending.extend(events.into_iter().map(Ok)),
                    Err(e) => {
                        state.pending.push_back(Err(e));
                        state.decoder = None;
                    }
                },
                Some(Err(e)) => {
                    state.pending.push_back(Err(e));
                    state.decoder = None;
                }
                None => {
                    let decoder = state.decoder.take()?;
                    state.pending.extend(decoder.finish().into_iter().map(Ok));
                }
            }
        }
    }))
}

/// Error carried inside a stream payload, classified like an HTTP failure.
pub(crate) fn stream_api_error(event: &serde_json::Value) -> Option<Error> {
    let error = event.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .unwrap_or("An error occurred during streaming")
        .to_string();
    let status = error
        .get("code")
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok());
    Some(match status {
        Some(status) => Error::from_http_status(status, message),
        None => Error::TransientBackend {
            status: None,
            message,
        },
    })
}

/// Strip a markdown code fence wrapped around a JSON reply.
pub fn strip_json_fence(text: &str) -> String {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)^```(?:json)?[ \t]*\r?\n(.*?)\r?\n?```$").ok());

    match fence.as_ref().and_then(|re| re.captures(text.trim())) {
        Some(captures) => captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        None => text.to_string(),
    }
}

/// Create the content generator described by `auth`.
///
/// Fails fast with [`Error::Config`] on an unsupported combination, before
/// any network call is made.
pub fn create_content_generator(auth: &AuthConfig) -> Result<Arc<dyn ContentGenerator>> {
    create_with_transport(auth, Arc::new(ReqwestTransport::new()))
}

/// Like [`create_content_generator`], over an explicit transport.
pub fn create_with_transport(
    auth: &AuthConfig,
    transport: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn ContentGenerator>> {
    let api_key = auth.api_key.as_deref().filter(|k| !k.is_empty());
    match auth.auth_type {
        AuthType::GeminiApiKey => {
            let key = api_key.ok_or_else(|| {
                Error::Config("gemini-api-key auth requires an API key (GEMINI_API_KEY)".to_string())
            })?;
            let endpoint = GeminiEndpoint::ApiKey {
                api_key: key.to_string(),
                base_url: auth.base_url.clone(),
            };
            Ok(Arc::new(GeminiGenerator::new(endpoint, auth.embedding_model.clone(), transport)))
        }
        AuthType::VertexAi => {
            let token = api_key.ok_or_else(|| {
                Error::Config("vertex-ai auth requires an access token".to_string())
            })?;
            let project = auth.project.clone().filter(|p| !p.is_empty()).ok_or_else(|| {
                Error::Config("vertex-ai auth requires a project (GOOGLE_CLOUD_PROJECT)".to_string())
            })?;
            let location = auth
                .location
                .clone()
                .filter(|l| !l.is_empty())
                .ok_or_else(|| {
                    Error::Config(
                        "vertex-ai auth requires a location (GOOGLE_CLOUD_LOCATION)".to_string(),
                    )
                })?;
            let endpoint = GeminiEndpoint::Vertex {
                access_token: token.to_string(),
                project,
                location,
                base_url: auth.base_url.clone(),
            };
            Ok(Arc::new(GeminiGenerator::new(endpoint, auth.embedding_model.clone(), transport)))
        }
        AuthType::OpenAiCompatible => {
            let base_url = auth.base_url.clone().filter(|u| !u.is_empty());
            if api_key.is_none() && base_url.is_none() {
                return Err(Error::Config(
                    "openai-compatible auth requires an API key or a custom base URL".to_string(),
                ));
            }
            Ok(Arc::new(OpenAiGenerator::new(
                api_key.map(str::to_string),
                base_url,
                auth.embedding_model.clone(),
                transport,
            )))
        }
    }
}

/// Scripted generator for tests.
#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::agent::tokens::estimate_message_tokens;

    /// One scripted reply to a streaming call.
    pub enum StreamScript {
        Events(Vec<ResponseEvent>),
        /// Events followed by a mid-stream failure.
        EventsThenError(Vec<ResponseEvent>, Error),
        Fail(Error),
    }

    /// Replays canned replies and records every request it receives.
    #[derive(Default)]
    pub struct FakeContentGenerator {
        streams: Mutex<VecDeque<StreamScript>>,
        replies: Mutex<VecDeque<Result<GenerateResponse>>>,
        /// Streaming calls on this model always fail with a quota error.
        quota_exhausted_model: Option<String>,
        pub requests: Mutex<Vec<GenerateRequest>>,
    }

    impl FakeContentGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_streams(streams: Vec<StreamScript>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
                ..Default::default()
            }
        }

        pub fn text_turns(texts: &[&str]) -> Self {
            Self::with_streams(
                texts
                    .iter()
                    .map(|t| StreamScript::Events(vec![ResponseEvent::TextDelta(t.to_string())]))
                    .collect(),
            )
        }

        pub fn quota_exhausted_on(mut self, model: &str) -> Self {
            self.quota_exhausted_model = Some(model.to_string());
            self
        }

        pub fn push_stream(&self, script: StreamScript) {
            self.streams.lock().unwrap().push_back(script);
        }

        pub fn push_reply(&self, reply: Result<GenerateResponse>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn stream_calls(&self) -> usize {
            self.requests().len()
        }
    }

    #[async_trait]
    impl ContentGenerator for FakeContentGenerator {
        async fn generate(&self, _request: &GenerateRequest) -> Result<GenerateResponse> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Other("No more fake replies".to_string())))
        }

        async fn generate_stream(&self, request: &GenerateRequest) -> Result<ResponseStream> {
            self.requests.lock().unwrap().push(request.clone());
            if self.quota_exhausted_model.as_deref() == Some(request.model.as_str()) {
                return Err(Error::Quota {
                    message: format!("Quota exceeded for {}", request.model),
                });
            }
            let script = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Other("No more fake streams".to_string()))?;
            match script {
                StreamScript::Events(events) => {
                    Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
                }
                StreamScript::EventsThenError(events, error) => Ok(Box::pin(stream::iter(
                    events
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(error))),
                ))),
                StreamScript::Fail(error) => Err(error),
            }
        }

        async fn count_tokens(&self, _model: &str, contents: &[Content]) -> Result<usize> {
            let texts: Vec<String> = contents.iter().map(Content::text).collect();
            Ok(estimate_message_tokens(&texts))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn backend(&self) -> &'static str {
            "fake"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    struct LineDecoder {
        seen: usize,
    }

    impl StreamDecoder for LineDecoder {
        fn push(&mut self, data: &str) -> Result<Vec<ResponseEvent>> {
            if data == "bad" {
                return Err(Error::malformed("bad chunk", data));
            }
            self.seen += 1;
            Ok(vec![ResponseEvent::TextDelta(data.to_string())])
        }

        fn finish(self) -> Vec<ResponseEvent> {
            vec![ResponseEvent::Finished(FinishReason::Other(self.seen.to_string()))]
        }
    }

    fn raw(items: Vec<Result<String>>) -> SseStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_decode_stream_flushes_at_end() {
        let events: Vec<_> = decode_stream(
            raw(vec![Ok("a".to_string()), Ok("b".to_string())]),
            LineDecoder { seen: 0 },
        )
        .collect()
        .await;

        let events: Vec<ResponseEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ResponseEvent::TextDelta("a".to_string()),
                ResponseEvent::TextDelta("b".to_string()),
                ResponseEvent::Finished(FinishReason::Other("2".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_stops_after_error() {
        let events: Vec<_> = decode_stream(
            raw(vec![
                Ok("a".to_string()),
                Ok("bad".to_string()),
                Ok("c".to_string()),
            ]),
            LineDecoder { seen: 0 },
        )
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
    }

    #[test]
    fn test_strip_json_fence() {
        assert_eq!(strip_json_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fence("  ```\n{\"a\":1}\n```  "), "{\"a\":1}");
        assert_eq!(strip_json_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_json_fence("plain text"), "plain text");
    }

    #[test]
    fn test_factory_rejects_missing_key() {
        let auth = AuthConfig {
            auth_type: AuthType::GeminiApiKey,
            ..Default::default()
        };
        assert!(matches!(create_content_generator(&auth), Err(Error::Config(_))));
    }

    #[test]
    fn test_factory_rejects_incomplete_vertex() {
        let auth = AuthConfig {
            auth_type: AuthType::VertexAi,
            api_key: Some("token".to_string()),
            project: Some("proj".to_string()),
            ..Default::default()
        };
        assert!(matches!(create_content_generator(&auth), Err(Error::Config(_))));
    }

    #[test]
    fn test_factory_selects_backend() {
        let auth = AuthConfig {
            auth_type: AuthType::OpenAiCompatible,
            base_url: Some("http://localhost:11434/v1".to_string()),
            ..Default::default()
        };
        let generator = create_content_generator(&auth).unwrap();
        assert_eq!(generator.backend(), "openai-compatible");

        let auth = AuthConfig {
            auth_type: AuthType::GeminiApiKey,
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        let generator = create_content_generator(&auth).unwrap();
        assert_eq!(generator.backend(), "gemini");
    }

    #[tokio::test]
    async fn test_fake_generator_replays_scripts() {
        let fake = FakeContentGenerator::text_turns(&["Hello!"]);
        let request = GenerateRequest::new("fake-model", vec![]);
        let events: Vec<_> = fake
            .generate_stream(&request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(fake.generate_stream(&request).await.is_err());
        assert_eq!(fake.stream_calls(), 2);
    }
}
