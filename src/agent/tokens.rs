//! Token limits, estimation and per-session usage accounting.
//!
//! The estimator here is approximate. It is only used for backends that do
//! not expose a tokenizer-accurate counting endpoint, and it errs on the high
//! side so compression triggers early rather than late.

use std::collections::HashMap;

use tracing::debug;

use super::events::UsageMetadata;

/// Context size assumed for models missing from the table.
pub const DEFAULT_TOKEN_LIMIT: usize = 1_048_576;

/// Per-message framing overhead of chat-style requests.
const TOKENS_PER_MESSAGE: usize = 3;
/// Framing overhead of the whole exchange.
const TOKENS_PER_EXCHANGE: usize = 3;

const CJK_CHARS_PER_TOKEN: f64 = 1.5;
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;
const TOKENS_PER_PUNCTUATION: f64 = 0.8;

/// Known context windows. Looked up by exact id, then by longest prefix.
const TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini-2.5-pro", 1_048_576),
    ("gemini-2.5-flash", 1_048_576),
    ("gemini-2.0-flash", 1_048_576),
    ("gemini-2.0-flash-preview-image-generation", 32_000),
    ("gemini-1.0-pro", 32_768),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4-turbo", 128_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("deepseek-chat", 65_536),
    ("qwen3-coder", 262_144),
];

/// Maximum context size of a model.
pub fn token_limit(model: &str) -> usize {
    if let Some((_, limit)) = TOKEN_LIMITS.iter().find(|(id, _)| *id == model) {
        return *limit;
    }
    TOKEN_LIMITS
        .iter()
        .filter(|(id, _)| model.starts_with(id))
        .max_by_key(|(id, _)| id.len())
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_TOKEN_LIMIT)
}

/// Compression thresholds for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBudget {
    pub model_id: String,
    pub limit: usize,
    pub threshold_ratio: f64,
    pub threshold_ratio_after_tools: f64,
}

impl TokenBudget {
    pub fn for_model(model: &str, threshold_ratio: f64, threshold_ratio_after_tools: f64) -> Self {
        Self {
            model_id: model.to_string(),
            limit: token_limit(model),
            threshold_ratio,
            threshold_ratio_after_tools,
        }
    }

    /// Token count at which compression kicks in.
    pub fn threshold(&self, after_tools: bool) -> f64 {
        let ratio = if after_tools {
            self.threshold_ratio_after_tools
        } else {
            self.threshold_ratio
        };
        ratio * self.limit as f64
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CharClasses {
    cjk: usize,
    other: usize,
    punctuation: usize,
}

impl CharClasses {
    fn of(text: &str) -> Self {
        let mut classes = Self::default();
        for c in text.chars() {
            if is_cjk(c) {
                classes.cjk += 1;
            } else {
                classes.other += 1;
                if c.is_whitespace() || is_punctuation(c) {
                    classes.punctuation += 1;
                }
            }
        }
        classes
    }

    fn add(&mut self, other: CharClasses) {
        self.cjk += other.cjk;
        self.other += other.other;
        self.punctuation += other.punctuation;
    }

    fn tokens(&self) -> f64 {
        self.cjk as f64 / CJK_CHARS_PER_TOKEN
            + (self.other - self.punctuation) as f64 / OTHER_CHARS_PER_TOKEN
            + self.punctuation as f64 * TOKENS_PER_PUNCTUATION
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(c, '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FFEF}' | '\u{2000}'..='\u{206F}')
}

/// Approximate token count of a bare string. Never below 1.
pub fn estimate_tokens(text: &str) -> usize {
    (CharClasses::of(text).tokens().ceil() as usize).max(1)
}

/// Approximate token count of a chat exchange made of `messages`.
///
/// Adds 3 tokens per message plus 3 for the exchange on top of the content
/// estimate, so the result grows with message count for fixed content.
pub fn estimate_message_tokens<S: AsRef<str>>(messages: &[S]) -> usize {
    let mut classes = CharClasses::default();
    for message in messages {
        classes.add(CharClasses::of(message.as_ref()));
    }
    let overhead = messages.len() * TOKENS_PER_MESSAGE + TOKENS_PER_EXCHANGE;
    (classes.tokens().ceil() as usize + overhead).max(1)
}

/// Latest context size reported per model during one session.
#[derive(Debug, Clone, Default)]
pub struct SessionTokenMetrics {
    per_model: HashMap<String, usize>,
}

impl SessionTokenMetrics {
    pub fn record(&mut self, model: &str, usage: &UsageMetadata) {
        let tokens = usage.context_tokens();
        if tokens == 0 {
            return;
        }
        self.per_model.insert(model.to_string(), tokens);
        debug!(model, tokens, "Recorded context token usage");
    }

    /// Sum across every model used in the session, as shown to the user.
    pub fn cumulative(&self) -> usize {
        self.per_model.values().sum()
    }

    pub fn for_model(&self, model: &str) -> Option<usize> {
        self.per_model.get(model).copied()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.per_model.is_empty()
    }

    /// Forget all prior counts and attribute `tokens` to `model`.
    pub fn reset_to(&mut self, model: &str, tokens: usize) {
        self.per_model.clear();
        self.per_model.insert(model.to_string(), tokens);
    }
}
