//! Detection of a model stuck repeating itself.
//!
//! Two signals: the same tool call (name and arguments) recurring within a
//! rolling window, and the same text chunk streamed many times in a row.
//! Either one fires once and then clears its state.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tracing::warn;

use crate::agent::events::ToolCallRequest;
use crate::config::LoopDetectionConfig;

/// What the detector saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopKind {
    RepeatedToolCall { name: String, count: usize },
    RepeatedContent { chunk: String, count: usize },
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    tool_call_threshold: usize,
    window_size: usize,
    content_chunk_threshold: usize,
    recent_calls: VecDeque<(String, String)>,
    last_chunk: Option<String>,
    chunk_repeats: usize,
}

impl LoopDetector {
    pub fn new(config: &LoopDetectionConfig) -> Self {
        Self {
            tool_call_threshold: config.tool_call_threshold.max(1),
            window_size: config.window_size.max(config.tool_call_threshold),
            content_chunk_threshold: config.content_chunk_threshold.max(1),
            recent_calls: VecDeque::with_capacity(config.window_size),
            last_chunk: None,
            chunk_repeats: 0,
        }
    }

    /// Record a tool call; fires when its twin count in the window reaches
    /// the threshold.
    pub fn check_tool_call(&mut self, call: &ToolCallRequest) -> Option<LoopKind> {
        let key = (call.name.clone(), canonical_json(&call.arguments));
        if self.recent_calls.len() == self.window_size {
            self.recent_calls.pop_front();
        }
        self.recent_calls.push_back(key);

        let latest = self.recent_calls.back()?;
        let count = self.recent_calls.iter().filter(|k| *k == latest).count();
        if count < self.tool_call_threshold {
            return None;
        }

        warn!(tool = %call.name, count, "Repeated identical tool calls detected");
        self.recent_calls.clear();
        Some(LoopKind::RepeatedToolCall {
            name: call.name.clone(),
            count,
        })
    }

    /// Record a streamed text chunk; fires on a run of identical chunks.
    pub fn check_content(&mut self, chunk: &str) -> Option<LoopKind> {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            return None;
        }

        if self.last_chunk.as_deref() == Some(chunk) {
            self.chunk_repeats += 1;
        } else {
            self.last_chunk = Some(chunk.to_string());
            self.chunk_repeats = 1;
        }
        if self.chunk_repeats < self.content_chunk_threshold {
            return None;
        }

        let count = self.chunk_repeats;
        warn!(count, "Repeated identical content detected");
        self.last_chunk = None;
        self.chunk_repeats = 0;
        Some(LoopKind::RepeatedContent {
            chunk: chunk.to_string(),
            count,
        })
    }

    /// Forget everything; called for each new user prompt.
    pub fn reset(&mut self) {
        self.recent_calls.clear();
        self.last_chunk = None;
        self.chunk_repeats = 0;
    }
}

/// Serialize with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}
