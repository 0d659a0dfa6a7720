//! Canonical message model shared by every backend adapter.
//!
//! A conversation is an ordered list of [`Content`] entries, each holding a
//! role and an ordered list of [`Part`]s. Adapters translate to and from this
//! shape; nothing above the adapter layer sees a backend wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a [`Content`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// A single piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// A tool invocation. `arguments` only needs to be valid JSON once the
    /// call is complete; while streaming it may hold a partial buffer.
    FunctionCall {
        id: String,
        name: String,
        arguments: String,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
    },
    InlineData {
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn function_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Part::FunctionCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn function_response(id: impl Into<String>, name: impl Into<String>, response: Value) -> Self {
        Part::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
        }
    }

    #[inline]
    pub fn is_function_response(&self) -> bool {
        matches!(self, Part::FunctionResponse { .. })
    }

    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Parsed arguments of a function call, if this part is one and its
    /// buffer is complete JSON. An empty buffer counts as `{}`.
    pub fn parsed_arguments(&self) -> Option<serde_json::Result<Value>> {
        match self {
            Part::FunctionCall { arguments, .. } => Some(parse_arguments(arguments)),
            _ => None,
        }
    }
}

/// Parse a function-call argument buffer.
pub fn parse_arguments(arguments: &str) -> serde_json::Result<Value> {
    if arguments.trim().is_empty() {
        Ok(Value::Object(Default::default()))
    } else {
        serde_json::from_str(arguments)
    }
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// True when this entry carries tool output rather than user-authored text.
    pub fn is_function_response(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(Part::is_function_response)
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &Part> {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::FunctionCall { .. }))
    }

    /// A model entry with no text and no calls carries nothing.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Text { text } => text.is_empty(),
            _ => false,
        })
    }

    /// Approximate serialized size, used for history partitioning.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// A single input item: bare text or an already-built part.
#[derive(Debug, Clone, PartialEq)]
pub enum InputItem {
    Text(String),
    Part(Part),
}

impl InputItem {
    fn into_part(self) -> Part {
        match self {
            InputItem::Text(text) => Part::text(text),
            InputItem::Part(part) => part,
        }
    }
}

/// Anything a caller may hand to the engine as the next user message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageInput {
    Text(String),
    Part(Part),
    List(Vec<InputItem>),
    /// Fully formed contents; roles are kept as given.
    Contents(Vec<Content>),
}

impl From<&str> for MessageInput {
    fn from(text: &str) -> Self {
        MessageInput::Text(text.to_string())
    }
}

impl From<String> for MessageInput {
    fn from(text: String) -> Self {
        MessageInput::Text(text)
    }
}

impl From<Part> for MessageInput {
    fn from(part: Part) -> Self {
        MessageInput::Part(part)
    }
}

impl From<Vec<Part>> for MessageInput {
    fn from(parts: Vec<Part>) -> Self {
        MessageInput::List(parts.into_iter().map(InputItem::Part).collect())
    }
}

impl From<Vec<InputItem>> for MessageInput {
    fn from(items: Vec<InputItem>) -> Self {
        MessageInput::List(items)
    }
}

impl From<Content> for MessageInput {
    fn from(content: Content) -> Self {
        MessageInput::Contents(vec![content])
    }
}

impl From<Vec<Content>> for MessageInput {
    fn from(contents: Vec<Content>) -> Self {
        MessageInput::Contents(contents)
    }
}

/// Normalize caller input into one or more well-formed contents.
///
/// Bare text and parts become `user` entries. Function responses are kept in
/// entries of their own so a tool-output turn never mixes with user text.
/// Empty input yields a single user entry with an empty text part.
pub fn normalize_input(input: impl Into<MessageInput>) -> Vec<Content> {
    let parts = match input.into() {
        MessageInput::Text(text) => vec![Part::text(text)],
        MessageInput::Part(part) => vec![part],
        MessageInput::List(items) => items.into_iter().map(InputItem::into_part).collect(),
        MessageInput::Contents(contents) => {
            let contents: Vec<Content> = contents
                .into_iter()
                .filter(|c| !c.parts.is_empty())
                .collect();
            if contents.is_empty() {
                return vec![Content::user("")];
            }
            return contents;
        }
    };

    if parts.is_empty() {
        return vec![Content::user("")];
    }

    let mut contents: Vec<Content> = Vec::new();
    for part in parts {
        let is_response = part.is_function_response();
        match contents.last_mut() {
            Some(last) if last.is_function_response() == is_response => last.parts.push(part),
            _ => contents.push(Content::new(Role::User, vec![part])),
        }
    }
    contents
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
