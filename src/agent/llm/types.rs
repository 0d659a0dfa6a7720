//! Gemini API wire types.
//!
//! Shared by the API-key and Vertex endpoints, which speak the same schema.

use serde::Deserialize;
use serde_json::Value;

use crate::agent::events::{FinishReason, UsageMetadata};

/// Top-level `generateContent` reply, also the shape of each stream chunk.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<GeminiUsage>,
}

/// A single response candidate.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<GeminiContent>,
    pub finish_reason: Option<String>,
}

/// Content block containing parts.
#[derive(Debug, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// A single part of the response (text, thought or function call).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
    pub function_call: Option<GeminiFunctionCall>,
}

/// Function call requested by the model. Gemini sends arguments whole.
#[derive(Debug, Deserialize)]
pub struct GeminiFunctionCall {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Token usage metadata.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsage {
    pub prompt_token_count: Option<usize>,
    pub candidates_token_count: Option<usize>,
    pub total_token_count: Option<usize>,
    pub cached_content_token_count: Option<usize>,
    pub thoughts_token_count: Option<usize>,
}

impl From<GeminiUsage> for UsageMetadata {
    fn from(usage: GeminiUsage) -> Self {
        Self {
            prompt_token_count: usage.prompt_token_count.unwrap_or(0),
            candidates_token_count: usage.candidates_token_count.unwrap_or(0),
            total_token_count: usage.total_token_count.unwrap_or(0),
            cached_content_token_count: usage.cached_content_token_count,
            thoughts_token_count: usage.thoughts_token_count,
        }
    }
}

/// `countTokens` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResponse {
    #[serde(default)]
    pub total_tokens: usize,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingValues {
    #[serde(default)]
    pub values: Vec<f32>,
}

/// `batchEmbedContents` reply.
#[derive(Debug, Deserialize)]
pub struct BatchEmbedResponse {
    #[serde(default)]
    pub embeddings: Vec<EmbeddingValues>,
}

/// Vertex `predict` reply for embedding models.
#[derive(Debug, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
pub struct Prediction {
    pub embeddings: EmbeddingValues,
}

pub fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => FinishReason::Safety,
        other => FinishReason::Other(other.to_string()),
    }
}
