//! OpenAI-compatible content generator.
//!
//! Works against any `/chat/completions` endpoint (OpenAI, DeepSeek, Qwen,
//! local servers). Tool calls stream as indexed fragments and are reassembled
//! with the [`ToolCallAccumulator`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::agent::collaborators::ToolSchema;
use crate::agent::content::{Content, Part, Role};
use crate::agent::events::{FinishReason, UsageMetadata};
use crate::agent::tokens::estimate_message_tokens;
use crate::error::Error;
use crate::Result;

use super::accumulator::ToolCallAccumulator;
use super::transport::HttpTransport;
use super::{
    decode_stream, strip_json_fence, stream_api_error, ContentGenerator, GenerateRequest,
    GenerateResponse, ResponseEvent, ResponseStream, StreamDecoder, JSON_DIRECTIVE,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const STREAM_DONE: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
    prompt_tokens_details: Option<PromptTokensDetails>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

impl From<OpenAiUsage> for UsageMetadata {
    fn from(usage: OpenAiUsage) -> Self {
        Self {
            prompt_token_count: usage.prompt_tokens,
            candidates_token_count: usage.completion_tokens,
            total_token_count: usage.total_tokens,
            cached_content_token_count: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
            thoughts_token_count: usage
                .completion_tokens_details
                .and_then(|d| d.reasoning_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: Option<u32>,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

/// Streaming `delta`, or the complete `message` of a non-streaming reply.
#[derive(Debug, Default, Deserialize)]
struct Message {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default, alias = "message")]
    delta: Message,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" | "tool_calls" | "function_call" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "content_filter" => FinishReason::Safety,
        other => FinishReason::Other(other.to_string()),
    }
}

/// OpenAI chat-completions client.
#[derive(Clone)]
pub struct OpenAiGenerator {
    api_key: Option<String>,
    base_url: String,
    embedding_model: String,
    transport: Arc<dyn HttpTransport>,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        embedding_model: Option<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| OPENAI_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            api_key,
            base_url,
            embedding_model: embedding_model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            transport,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.api_key
            .iter()
            .map(|key| ("Authorization".to_string(), format!("Bearer {key}")))
            .collect()
    }
}

fn user_content(parts: &[&Part]) -> Value {
    let has_media = parts.iter().any(|p| matches!(p, Part::InlineData { .. }));
    if !has_media {
        let text: Vec<&str> = parts.iter().filter_map(|p| p.as_text()).collect();
        return json!(text.join("\n"));
    }

    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(json!({ "type": "text", "text": text })),
            Part::InlineData { mime_type, data } => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", mime_type, STANDARD.encode(data)) }
            })),
            _ => None,
        })
        .collect();
    json!(blocks)
}

/// Canonical history -> chat `messages` array.
///
/// Function responses become `tool` messages. A model call without a
/// matching response (typically the trailing one still being executed) is
/// left out, since the endpoint rejects unanswered `tool_calls`.
fn convert_messages(system: Option<&str>, contents: &[Content]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(contents.len() + 1);
    if let Some(system) = system {
        messages.push(json!({ "role": "system", "content": system }));
    }

    let answered: HashSet<&str> = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| match p {
            Part::FunctionResponse { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();

    for content in contents {
        match content.role {
            Role::User => {
                let mut other: Vec<&Part> = Vec::new();
                for part in &content.parts {
                    match part {
                        Part::FunctionResponse { id, response, .. } => {
                            let body = match response {
                                Value::String(s) => s.clone(),
                                v => v.to_string(),
                            };
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": id,
                                "content": body
                            }));
                        }
                        Part::FunctionCall { .. } => {}
                        p => other.push(p),
                    }
                }
                if !other.is_empty() {
                    messages.push(json!({ "role": "user", "content": user_content(&other) }));
                }
            }
            Role::Model => {
                let text = content.text();
                let tool_calls: Vec<Value> = content
                    .function_calls()
                    .filter_map(|p| match p {
                        Part::FunctionCall {
                            id,
                            name,
                            arguments,
                        } if answered.contains(id.as_str()) => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments }
                        })),
                        _ => None,
                    })
                    .collect();

                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                let mut message = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { json!(text) }
                });
                if !tool_calls.is_empty() {
                    message["tool_calls"] = json!(tool_calls);
                }
                messages.push(message);
            }
        }
    }

    messages
}

fn convert_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters
                }
            })
        })
        .collect()
}

/// Canonical request -> chat-completions body.
///
/// With structured output requested and no system instruction present, a
/// system message carrying [`JSON_DIRECTIVE`] is added.
pub fn to_backend_request(request: &GenerateRequest, stream: bool) -> Value {
    let system = request
        .system_instruction
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(request.config.json_output.then_some(JSON_DIRECTIVE));

    let mut body = json!({
        "model": request.model,
        "messages": convert_messages(system, &request.contents),
    });

    let config = &request.config;
    if let Some(t) = config.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = config.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(max) = config.max_output_tokens {
        body["max_tokens"] = json!(max);
    }
    if !config.stop_sequences.is_empty() {
        body["stop"] = json!(config.stop_sequences);
    }
    if config.json_output {
        body["response_format"] = json!({ "type": "json_object" });
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(convert_tools(&request.tools));
        body["tool_choice"] = json!("auto");
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

/// Chat-completions reply -> canonical response.
pub fn from_backend_response(raw: Value, json_mode: bool) -> Result<GenerateResponse> {
    if let Some(error) = stream_api_error(&raw) {
        return Err(error);
    }
    let completion: ChatCompletion = serde_json::from_value(raw.clone()).map_err(|e| {
        Error::malformed(format!("unexpected chat completion: {e}"), raw.to_string())
    })?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed("No choices in response", raw.to_string()))?;

    let mut parts = Vec::new();
    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
        parts.push(Part::text(if json_mode { strip_json_fence(&text) } else { text }));
    }
    for (position, call) in choice.delta.tool_calls.into_iter().enumerate() {
        let function = call.function.unwrap_or(FunctionFragment {
            name: None,
            arguments: None,
        });
        let name = function.name.unwrap_or_default();
        let id = call
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{name}:{position}"));
        parts.push(Part::function_call(id, name, function.arguments.unwrap_or_default()));
    }

    Ok(GenerateResponse {
        content: Content::new(Role::Model, parts),
        finish_reason: choice.finish_reason.as_deref().map(finish_reason),
        usage: completion.usage.map(UsageMetadata::from),
    })
}

/// Decoder for chat-completions SSE chunks.
#[derive(Default)]
pub struct OpenAiStreamDecoder {
    calls: ToolCallAccumulator,
    usage: Option<UsageMetadata>,
    done: bool,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn push(&mut self, data: &str) -> Result<Vec<ResponseEvent>> {
        let data = data.trim();
        if data == STREAM_DONE {
            self.done = true;
            return Ok(Vec::new());
        }
        if self.done || data.is_empty() {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_str(data)
            .map_err(|e| Error::malformed(format!("SSE parsing error: {e}"), data))?;
        if let Some(error) = stream_api_error(&value) {
            return Err(error);
        }
        let chunk: ChatCompletion = serde_json::from_value(value)
            .map_err(|e| Error::malformed(format!("SSE data schema error: {e}"), data))?;

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut events = Vec::new();
        // The final usage chunk arrives with `choices: []`.
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(events);
        };

        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            events.push(ResponseEvent::ThoughtDelta(reasoning));
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            events.push(ResponseEvent::TextDelta(text));
        }
        for call in delta.tool_calls {
            let (name, arguments) = match &call.function {
                Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
                None => (None, None),
            };
            self.calls
                .push(call.index, call.id.as_deref(), name, arguments);
        }

        if let Some(reason) = choice.finish_reason {
            events.extend(self.calls.drain());
            events.push(ResponseEvent::Finished(finish_reason(&reason)));
        }
        Ok(events)
    }

    fn finish(mut self) -> Vec<ResponseEvent> {
        let mut events = self.calls.drain();
        if let Some(usage) = self.usage.take() {
            events.push(ResponseEvent::Usage(usage));
        }
        events
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let body = to_backend_request(request, false);
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %request.model, "OpenAI chat completion");

        let raw = self.transport.post_json(&url, &self.headers(), &body).await?;
        trace!("OpenAI response: {}", raw);
        from_backend_response(raw, request.config.json_output)
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ResponseStream> {
        let body = to_backend_request(request, true);
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %request.model, "OpenAI streaming chat completion");

        let raw = self.transport.post_sse(&url, &self.headers(), &body).await?;
        Ok(decode_stream(raw, OpenAiStreamDecoder::default()))
    }

    /// Chat endpoints expose no counting API; the count is an estimate over
    /// the converted message contents.
    async fn count_tokens(&self, _model: &str, contents: &[Content]) -> Result<usize> {
        let texts: Vec<String> = convert_messages(None, contents)
            .iter()
            .map(|m| {
                let mut text = match &m["content"] {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                if let Some(calls) = m.get("tool_calls") {
                    text.push_str(&calls.to_string());
                }
                text
            })
            .collect();
        Ok(estimate_message_tokens(&texts))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({ "model": self.embedding_model, "input": texts });

        let raw = self.transport.post_json(&url, &self.headers(), &body).await?;
        let reply: EmbeddingsResponse = serde_json::from_value(raw)?;
        Ok(reply.data.into_iter().map(|d| d.embedding).collect())
    }

    fn backend(&self) -> &'static str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::GenerationConfig;
    use crate::agent::llm::SseStream;
    use futures_util::{stream, StreamExt};
    use std::sync::Mutex;

    #[test]
    fn test_tool_round_trip_messages() {
        let contents = vec![
            Content::user("read x"),
            Content::new(
                Role::Model,
                vec![Part::function_call("call_1", "read_file", r#"{"path":"x"}"#)],
            ),
            Content::new(
                Role::User,
                vec![Part::function_response("call_1", "read_file", json!({"output": "hi"}))],
            ),
            Content::new(
                Role::Model,
                vec![Part::function_call("call_2", "ls", "{}")],
            ),
        ];

        let messages = convert_messages(Some("sys"), &contents);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "read x");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"path":"x"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        // The unanswered trailing call is not sent.
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn test_json_directive_only_without_system_instruction() {
        let mut request = GenerateRequest::new("gpt-4o", vec![Content::user("hi")]);
        request.config = GenerationConfig {
            json_output: true,
            max_output_tokens: Some(100),
            stop_sequences: vec!["END".to_string()],
            ..Default::default()
        };

        let body = to_backend_request(&request, false);
        assert_eq!(body["messages"][0]["content"], JSON_DIRECTIVE);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stop"][0], "END");

        request.system_instruction = Some("You are terse.".to_string());
        let body = to_backend_request(&request, true);
        assert_eq!(body["messages"][0]["content"], "You are terse.");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_response_strips_fence_in_json_mode() {
        let raw = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "```json\n{\"next_speaker\":\"user\"}\n```" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });

        let response = from_backend_response(raw.clone(), true).unwrap();
        assert_eq!(response.text(), "{\"next_speaker\":\"user\"}");
        assert_eq!(response.usage.unwrap().total_token_count, 15);

        let response = from_backend_response(raw, false).unwrap();
        assert!(response.text().starts_with("```json"));
    }

    #[test]
    fn test_stream_decoder_reassembles_fragmented_call() {
        let mut decoder = OpenAiStreamDecoder::default();
        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"foo","arguments":"{\"a\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
            "[DONE]",
        ];
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk).unwrap());
        }
        events.extend(decoder.finish());

        assert_eq!(events.len(), 3);
        match &events[0] {
            ResponseEvent::ToolCall(call) => {
                assert_eq!(call.id, "c1");
                assert_eq!(call.name, "foo");
                assert_eq!(call.arguments, json!({"a": 1}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert_eq!(events[1], ResponseEvent::Finished(FinishReason::Stop));
        assert!(matches!(&events[2], ResponseEvent::Usage(u) if u.total_token_count == 10));
    }

    #[test]
    fn test_stream_decoder_reports_truncated_arguments() {
        let mut decoder = OpenAiStreamDecoder::default();
        decoder
            .push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"foo","arguments":"{\"a\":"}}]}}]}"#)
            .unwrap();
        let events = decoder.finish();

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ResponseEvent::MalformedToolCall { raw, .. } if raw == "{\"a\":"
        ));
    }

    #[test]
    fn test_stream_decoder_text_and_reasoning() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events = decoder
            .push(r#"{"choices":[{"delta":{"reasoning_content":"think","content":"Hi"}}]}"#)
            .unwrap();
        assert_eq!(
            events,
            vec![
                ResponseEvent::ThoughtDelta("think".to_string()),
                ResponseEvent::TextDelta("Hi".to_string()),
            ]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_stream_decoder_rejects_garbage() {
        let mut decoder = OpenAiStreamDecoder::default();
        let err = decoder.push("not json").unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { raw, .. } if raw == "not json"));
    }

    /// Transport answering every call with canned payloads.
    struct CannedTransport {
        reply: Value,
        chunks: Vec<String>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn post_json(&self, url: &str, _headers: &[(String, String)], _body: &Value) -> Result<Value> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(self.reply.clone())
        }

        async fn post_sse(&self, url: &str, _headers: &[(String, String)], _body: &Value) -> Result<SseStream> {
            self.urls.lock().unwrap().push(url.to_string());
            let chunks: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    #[tokio::test]
    async fn test_generator_streams_through_transport() {
        let transport = Arc::new(CannedTransport {
            reply: json!({ "data": [{ "embedding": [0.5, 0.25] }] }),
            chunks: vec![
                r#"{"choices":[{"delta":{"content":"Hello"}}]}"#.to_string(),
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#.to_string(),
                "[DONE]".to_string(),
            ],
            urls: Mutex::new(Vec::new()),
        });
        let generator = OpenAiGenerator::new(
            None,
            Some("http://localhost:8000/v1/".to_string()),
            None,
            transport.clone(),
        );

        let request = GenerateRequest::new("local", vec![Content::user("hi")]);
        let events: Vec<_> = generator
            .generate_stream(&request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &ResponseEvent::TextDelta("Hello".to_string())
        );

        let vectors = generator.embed(&["x".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.25]]);

        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls[0], "http://localhost:8000/v1/chat/completions");
        assert_eq!(urls[1], "http://localhost:8000/v1/embeddings");
    }
}
