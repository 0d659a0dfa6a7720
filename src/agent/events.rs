//! Events emitted to the caller while a turn runs, and the turn result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// A tool call reconstructed from the model's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token counters reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_token_count: usize,
    pub candidates_token_count: usize,
    pub total_token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<usize>,
}

impl UsageMetadata {
    /// Tokens occupying the context window after this response.
    pub fn context_tokens(&self) -> usize {
        if self.total_token_count > 0 {
            self.total_token_count
        } else {
            self.prompt_token_count + self.candidates_token_count
        }
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other(String),
}

/// Summary of a compression, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    pub original_token_count: usize,
    pub new_token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Failure class of a [`TurnError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnErrorKind {
    Configuration,
    TransientBackend,
    Quota,
    Backend,
    MalformedResponse,
    CompressionFailure,
    Internal,
}

/// A fatal or surfaced error, with enough context to render a diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
    pub model: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl TurnError {
    pub fn from_error(error: &Error, model: &str, operation: &str) -> Self {
        let kind = match error {
            Error::Config(_) => TurnErrorKind::Configuration,
            Error::Quota { .. } => TurnErrorKind::Quota,
            Error::MalformedResponse { .. } | Error::Json(_) => TurnErrorKind::MalformedResponse,
            Error::CompressionFailed(_) => TurnErrorKind::CompressionFailure,
            Error::Backend { .. } => TurnErrorKind::Backend,
            e if e.is_transient() => TurnErrorKind::TransientBackend,
            Error::Http(_) => TurnErrorKind::Backend,
            _ => TurnErrorKind::Internal,
        };
        let raw = match error {
            Error::MalformedResponse { raw, .. } => Some(raw.clone()),
            _ => None,
        };
        Self {
            kind,
            message: error.to_string(),
            model: model.to_string(),
            operation: operation.to_string(),
            raw,
        }
    }
}

/// Events forwarded to the caller, in backend stream order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    TextDelta(String),
    ThoughtDelta(String),
    ToolCallRequest(ToolCallRequest),
    UsageMetadata(UsageMetadata),
    Compressed(CompressionInfo),
    ModelSwitched { from: String, to: String },
    LoopDetected,
    MaxTurnsReached,
    Error(TurnError),
}

/// Result of one `send_message_stream` call. Partial when cancelled.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub prompt_id: String,
    /// Model that served the last backend call of this turn.
    pub model: String,
    pub pending_tool_calls: Vec<ToolCallRequest>,
    pub text: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UsageMetadata>,
    pub cancelled: bool,
    pub loop_detected: bool,
    pub max_turns_reached: bool,
    pub error: Option<TurnError>,
}

impl Turn {
    pub(crate) fn new(prompt_id: String, model: String) -> Self {
        Self {
            prompt_id,
            model,
            ..Default::default()
        }
    }

    #[inline]
    pub fn has_tool_calls(&self) -> bool {
        !self.pending_tool_calls.is_empty()
    }
}
