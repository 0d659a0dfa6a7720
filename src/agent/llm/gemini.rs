//! Gemini content generator (API key or Vertex AI endpoint).

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::agent::collaborators::ToolSchema;
use crate::agent::content::{parse_arguments, Content, Part, Role};
use crate::agent::events::UsageMetadata;
use crate::error::Error;
use crate::Result;

use super::accumulator::complete_call;
use super::transport::HttpTransport;
use super::types::{
    finish_reason, BatchEmbedResponse, CountTokensResponse, GeminiResponse, PredictResponse,
};
use super::{
    decode_stream, strip_json_fence, stream_api_error, ContentGenerator, GenerateRequest,
    GenerateResponse, ResponseEvent, ResponseStream, StreamDecoder,
};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Where and how Gemini requests are sent.
#[derive(Debug, Clone)]
pub enum GeminiEndpoint {
    /// Hosted Gemini API with an API key.
    ApiKey {
        api_key: String,
        base_url: Option<String>,
    },
    /// Vertex AI with a pre-obtained OAuth access token.
    Vertex {
        access_token: String,
        project: String,
        location: String,
        base_url: Option<String>,
    },
}

impl GeminiEndpoint {
    fn url(&self, model: &str, method: &str) -> String {
        match self {
            GeminiEndpoint::ApiKey { base_url, .. } => {
                let base = base_url.as_deref().unwrap_or(GEMINI_API_URL);
                format!("{}/models/{}:{}", base.trim_end_matches('/'), model, method)
            }
            GeminiEndpoint::Vertex {
                project,
                location,
                base_url,
                ..
            } => {
                let base = base_url
                    .clone()
                    .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com/v1"));
                format!(
                    "{}/projects/{}/locations/{}/publishers/google/models/{}:{}",
                    base.trim_end_matches('/'),
                    project,
                    location,
                    model,
                    method
                )
            }
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        match self {
            GeminiEndpoint::ApiKey { api_key, .. } => {
                vec![("x-goog-api-key".to_string(), api_key.clone())]
            }
            GeminiEndpoint::Vertex { access_token, .. } => {
                vec![("Authorization".to_string(), format!("Bearer {access_token}"))]
            }
        }
    }
}

/// Gemini client speaking the native `generateContent` schema.
#[derive(Clone)]
pub struct GeminiGenerator {
    endpoint: GeminiEndpoint,
    embedding_model: String,
    transport: Arc<dyn HttpTransport>,
}

impl GeminiGenerator {
    pub fn new(
        endpoint: GeminiEndpoint,
        embedding_model: Option<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            endpoint,
            embedding_model: embedding_model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            transport,
        }
    }
}

fn convert_part(part: &Part) -> Result<Value> {
    Ok(match part {
        Part::Text { text } => json!({ "text": text }),
        Part::FunctionCall {
            id,
            name,
            arguments,
        } => {
            let args = parse_arguments(arguments)
                .map_err(|e| Error::malformed(format!("history holds invalid call arguments: {e}"), arguments))?;
            json!({ "functionCall": { "id": id, "name": name, "args": args } })
        }
        Part::FunctionResponse { id, name, response } => {
            json!({ "functionResponse": { "id": id, "name": name, "response": response } })
        }
        Part::InlineData { mime_type, data } => {
            json!({ "inlineData": { "mimeType": mime_type, "data": STANDARD.encode(data) } })
        }
    })
}

fn convert_contents(contents: &[Content]) -> Result<Vec<Value>> {
    contents
        .iter()
        .map(|c| {
            let parts = c.parts.iter().map(convert_part).collect::<Result<Vec<_>>>()?;
            Ok(json!({ "role": c.role.as_str(), "parts": parts }))
        })
        .collect()
}

fn convert_tools(tools: &[ToolSchema]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }

    let function_declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters
            })
        })
        .collect();

    Some(json!([{
        "functionDeclarations": function_declarations
    }]))
}

/// Canonical request -> `generateContent` body.
pub fn to_backend_request(request: &GenerateRequest) -> Result<Value> {
    let mut body = json!({ "contents": convert_contents(&request.contents)? });

    if let Some(system) = request.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    if let Some(tools) = convert_tools(&request.tools) {
        body["tools"] = tools;
    }

    let config = &request.config;
    let mut generation = serde_json::Map::new();
    if let Some(t) = config.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(p) = config.top_p {
        generation.insert("topP".into(), json!(p));
    }
    if let Some(k) = config.top_k {
        generation.insert("topK".into(), json!(k));
    }
    if let Some(max) = config.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if !config.stop_sequences.is_empty() {
        generation.insert("stopSequences".into(), json!(config.stop_sequences));
    }
    if config.json_output {
        generation.insert("responseMimeType".into(), json!("application/json"));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    Ok(body)
}

/// `generateContent` reply -> canonical response.
///
/// Thought parts are dropped; with `json_mode` a fenced reply is unwrapped.
pub fn from_backend_response(raw: Value, json_mode: bool) -> Result<GenerateResponse> {
    let response: GeminiResponse = serde_json::from_value(raw.clone())
        .map_err(|e| Error::malformed(format!("unexpected Gemini response: {e}"), raw.to_string()))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed("No candidates in response", raw.to_string()))?;

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text.filter(|_| !part.thought) {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let id = fc.id.unwrap_or_else(|| format!("{}:{}", fc.name, calls.len()));
            calls.push(Part::function_call(id, fc.name, fc.args.to_string()));
        }
    }

    let mut parts = Vec::with_capacity(calls.len() + 1);
    if !text.is_empty() {
        parts.push(Part::text(if json_mode { strip_json_fence(&text) } else { text }));
    }
    parts.extend(calls);

    Ok(GenerateResponse {
        content: Content::new(Role::Model, parts),
        finish_reason: candidate.finish_reason.as_deref().map(finish_reason),
        usage: response.usage_metadata.map(UsageMetadata::from),
    })
}

/// Decoder for `streamGenerateContent?alt=sse` chunks.
///
/// Gemini sends every `functionCall` whole, so calls are emitted as soon as
/// their chunk arrives.
#[derive(Default)]
pub struct GeminiStreamDecoder {
    calls_seen: usize,
    usage: Option<UsageMetadata>,
}

impl StreamDecoder for GeminiStreamDecoder {
    fn push(&mut self, data: &str) -> Result<Vec<ResponseEvent>> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| Error::malformed(format!("SSE parsing error: {e}"), data))?;
        if let Some(error) = stream_api_error(&value) {
            return Err(error);
        }
        let chunk: GeminiResponse = serde_json::from_value(value)
            .map_err(|e| Error::malformed(format!("SSE data schema error: {e}"), data))?;

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage.into());
        }

        let mut events = Vec::new();
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(events);
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(if part.thought {
                    ResponseEvent::ThoughtDelta(text)
                } else {
                    ResponseEvent::TextDelta(text)
                });
            }
            if let Some(fc) = part.function_call {
                let id = fc.id.filter(|id| !id.is_empty());
                events.push(complete_call(id, fc.name, fc.args.to_string(), self.calls_seen));
                self.calls_seen += 1;
            }
        }

        if let Some(reason) = candidate.finish_reason {
            events.push(ResponseEvent::Finished(finish_reason(&reason)));
        }
        Ok(events)
    }

    fn finish(self) -> Vec<ResponseEvent> {
        self.usage.map(ResponseEvent::Usage).into_iter().collect()
    }
}

#[async_trait]
impl ContentGenerator for GeminiGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let body = to_backend_request(request)?;
        let url = self.endpoint.url(&request.model, "generateContent");
        debug!(model = %request.model, "Gemini generateContent");

        let raw = self
            .transport
            .post_json(&url, &self.endpoint.headers(), &body)
            .await?;
        trace!("Gemini response: {}", raw);
        from_backend_response(raw, request.config.json_output)
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ResponseStream> {
        let body = to_backend_request(request)?;
        let url = self
            .endpoint
            .url(&request.model, "streamGenerateContent?alt=sse");
        debug!(model = %request.model, "Gemini streamGenerateContent");

        let raw = self
            .transport
            .post_sse(&url, &self.endpoint.headers(), &body)
            .await?;
        Ok(decode_stream(raw, GeminiStreamDecoder::default()))
    }

    async fn count_tokens(&self, model: &str, contents: &[Content]) -> Result<usize> {
        let body = json!({ "contents": convert_contents(contents)? });
        let url = self.endpoint.url(model, "countTokens");

        let raw = self
            .transport
            .post_json(&url, &self.endpoint.headers(), &body)
            .await?;
        let counted: CountTokensResponse = serde_json::from_value(raw)?;
        Ok(counted.total_tokens)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let headers = self.endpoint.headers();

        match &self.endpoint {
            GeminiEndpoint::ApiKey { .. } => {
                let requests: Vec<Value> = texts
                    .iter()
                    .map(|t| {
                        json!({
                            "model": format!("models/{}", self.embedding_model),
                            "content": { "parts": [{ "text": t }] }
                        })
                    })
                    .collect();
                let url = self.endpoint.url(&self.embedding_model, "batchEmbedContents");
                let raw = self
                    .transport
                    .post_json(&url, &headers, &json!({ "requests": requests }))
                    .await?;
                let reply: BatchEmbedResponse = serde_json::from_value(raw)?;
                Ok(reply.embeddings.into_iter().map(|e| e.values).collect())
            }
            GeminiEndpoint::Vertex { .. } => {
                let instances: Vec<Value> = texts.iter().map(|t| json!({ "content": t })).collect();
                let url = self.endpoint.url(&self.embedding_model, "predict");
                let raw = self
                    .transport
                    .post_json(&url, &headers, &json!({ "instances": instances }))
                    .await?;
                let reply: PredictResponse = serde_json::from_value(raw)?;
                Ok(reply
                    .predictions
                    .into_iter()
                    .map(|p| p.embeddings.values)
                    .collect())
            }
        }
    }

    fn backend(&self) -> &'static str {
        match self.endpoint {
            GeminiEndpoint::ApiKey { .. } => "gemini",
            GeminiEndpoint::Vertex { .. } => "vertex-ai",
        }
    }
}
