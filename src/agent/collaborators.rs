//! Interfaces of the services the turn engine depends on but does not own,
//! with the default implementations used by the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::compression::CompressionCheckpoint;
use crate::agent::content::{Content, Role};
use crate::agent::events::{TurnError, UsageMetadata};
use crate::agent::llm::{strip_json_fence, ContentGenerator, GenerateRequest, GenerationConfig};
use crate::error::Error;
use crate::Result;

/// Tool definition sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
}

/// Source of the function declarations offered to the model.
///
/// Executing the requested calls happens outside the engine; results come
/// back as function-response parts in the next user input.
pub trait ToolRegistry: Send + Sync {
    fn function_declarations(&self) -> Vec<ToolSchema>;
}

impl ToolRegistry for Vec<ToolSchema> {
    fn function_declarations(&self) -> Vec<ToolSchema> {
        self.clone()
    }
}

/// Registry offering no tools.
pub struct NoTools;

impl ToolRegistry for NoTools {
    fn function_declarations(&self) -> Vec<ToolSchema> {
        Vec::new()
    }
}

/// Who is expected to produce the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextSpeaker {
    User,
    Model,
}

/// Decides whether the model should keep going without user input.
#[async_trait]
pub trait NextSpeakerClassifier: Send + Sync {
    async fn classify(&self, history: &[Content]) -> Result<NextSpeaker>;
}

const NEXT_SPEAKER_PROMPT: &str = r#"Look only at your immediately preceding response in this conversation and decide who should speak next.

Rules, applied in order:
1. "model": your response announces an action you are about to take yourself, or it stops mid-thought without a natural conclusion.
2. "user": your response ends with a question addressed to the user.
3. "user": your response completed its thought or task and is waiting for the user's reaction.

Respond only with JSON of the form:
{"reasoning": "<one sentence>", "next_speaker": "user" | "model"}"#;

#[derive(Debug, Deserialize)]
struct NextSpeakerVerdict {
    #[serde(default)]
    reasoning: String,
    next_speaker: NextSpeaker,
}

/// Classifier asking a (cheap) model for a JSON verdict.
pub struct ModelNextSpeakerClassifier {
    generator: Arc<dyn ContentGenerator>,
    model: String,
}

impl ModelNextSpeakerClassifier {
    pub fn new(generator: Arc<dyn ContentGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
        }
    }
}

#[async_trait]
impl NextSpeakerClassifier for ModelNextSpeakerClassifier {
    async fn classify(&self, history: &[Content]) -> Result<NextSpeaker> {
        let Some(last) = history.last() else {
            return Ok(NextSpeaker::User);
        };
        // Tool results always need a model reply.
        if last.is_function_response() {
            return Ok(NextSpeaker::Model);
        }
        if last.role != Role::Model {
            return Ok(NextSpeaker::User);
        }
        if last.is_empty() {
            return Ok(NextSpeaker::Model);
        }

        let mut contents = history.to_vec();
        contents.push(Content::user(NEXT_SPEAKER_PROMPT));
        let request = GenerateRequest {
            config: GenerationConfig {
                json_output: true,
                temperature: Some(0.0),
                ..Default::default()
            },
            ..GenerateRequest::new(self.model.clone(), contents)
        };

        let response = self.generator.generate(&request).await?;
        let text = strip_json_fence(&response.text());
        let verdict: NextSpeakerVerdict = serde_json::from_str(text.trim())
            .map_err(|e| Error::malformed(format!("invalid next-speaker verdict: {e}"), text.clone()))?;
        debug!(
            next = ?verdict.next_speaker,
            reasoning = %verdict.reasoning,
            "Next speaker classified"
        );
        Ok(verdict.next_speaker)
    }
}

/// Persistence sink for compression checkpoints and token counts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append a checkpoint. Checkpoints are never rewritten.
    async fn save(&self, checkpoint: &CompressionCheckpoint) -> Result<()>;

    /// Most recently saved checkpoint, if any.
    async fn load_latest(&self) -> Result<Option<CompressionCheckpoint>>;

    /// Record the current context size of a model.
    async fn record_token_count(&self, snapshot: TokenSnapshot) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub model: String,
    pub tokens: usize,
    pub recorded_at: DateTime<Utc>,
}

impl TokenSnapshot {
    pub fn now(model: impl Into<String>, tokens: usize) -> Self {
        Self {
            model: model.into(),
            tokens,
            recorded_at: Utc::now(),
        }
    }
}

/// Process-local [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    checkpoints: Mutex<Vec<CompressionCheckpoint>>,
    snapshots: Mutex<Vec<TokenSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session log seeded with existing checkpoints, oldest first.
    pub fn with_checkpoints(checkpoints: Vec<CompressionCheckpoint>) -> Self {
        Self {
            checkpoints: Mutex::new(checkpoints),
            ..Default::default()
        }
    }

    pub async fn checkpoints(&self) -> Vec<CompressionCheckpoint> {
        self.checkpoints.lock().await.clone()
    }

    pub async fn snapshots(&self) -> Vec<TokenSnapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, checkpoint: &CompressionCheckpoint) -> Result<()> {
        self.checkpoints.lock().await.push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<CompressionCheckpoint>> {
        Ok(self.checkpoints.lock().await.last().cloned())
    }

    async fn record_token_count(&self, snapshot: TokenSnapshot) -> Result<()> {
        self.snapshots.lock().await.push(snapshot);
        Ok(())
    }
}

/// Observability sink. Calls must return promptly and never fail.
pub trait TelemetrySink: Send + Sync {
    fn record_usage(&self, model: &str, usage: &UsageMetadata);
    fn record_error(&self, error: &TurnError);
}

/// [`TelemetrySink`] writing structured `tracing` events.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_usage(&self, model: &str, usage: &UsageMetadata) {
        debug!(
            model = %model,
            prompt_tokens = usage.prompt_token_count,
            candidates_tokens = usage.candidates_token_count,
            total_tokens = usage.total_token_count,
            cached_tokens = usage.cached_content_token_count.unwrap_or(0),
            "Token usage"
        );
    }

    fn record_error(&self, error: &TurnError) {
        warn!(
            kind = ?error.kind,
            model = %error.model,
            operation = %error.operation,
            "{}",
            error.message
        );
    }
}

/// Supplies the preamble injected once at session start.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn initial_context(&self) -> Result<Vec<Content>>;
}

/// The collaborator set handed to a [`TurnEngine`](crate::agent::TurnEngine).
#[derive(Clone)]
pub struct Collaborators {
    pub tools: Arc<dyn ToolRegistry>,
    pub classifier: Arc<dyn NextSpeakerClassifier>,
    pub store: Arc<dyn SessionStore>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Collaborators {
    /// No tools, a model-backed classifier, an in-memory store and tracing
    /// telemetry.
    pub fn with_defaults(generator: Arc<dyn ContentGenerator>, classifier_model: &str) -> Self {
        Self {
            tools: Arc::new(NoTools),
            classifier: Arc::new(ModelNextSpeakerClassifier::new(generator, classifier_model)),
            store: Arc::new(InMemorySessionStore::new()),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn NextSpeakerClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::content::Part;
    use crate::agent::llm::testing::FakeContentGenerator;
    use crate::agent::llm::GenerateResponse;
    use serde_json::json;

    fn classifier(fake: Arc<FakeContentGenerator>) -> ModelNextSpeakerClassifier {
        ModelNextSpeakerClassifier::new(fake, "gemini-2.5-flash")
    }

    #[tokio::test]
    async fn test_shortcuts_skip_the_model() {
        let fake = Arc::new(FakeContentGenerator::new());
        let c = classifier(fake.clone());

        let response = vec![
            Content::user("hi"),
            Content::new(Role::User, vec![Part::function_response("c1", "ls", json!({}))]),
        ];
        assert_eq!(c.classify(&response).await.unwrap(), NextSpeaker::Model);

        let empty_model = vec![Content::user("hi"), Content::new(Role::Model, vec![])];
        assert_eq!(c.classify(&empty_model).await.unwrap(), NextSpeaker::Model);

        let user_last = vec![Content::user("hi")];
        assert_eq!(c.classify(&user_last).await.unwrap(), NextSpeaker::User);
        assert_eq!(c.classify(&[]).await.unwrap(), NextSpeaker::User);
    }

    #[tokio::test]
    async fn test_model_verdict_is_parsed() {
        let fake = Arc::new(FakeContentGenerator::new());
        fake.push_reply(Ok(GenerateResponse::from_text(
            "```json\n{\"reasoning\": \"announced a step\", \"next_speaker\": \"model\"}\n```",
        )));
        fake.push_reply(Ok(GenerateResponse::from_text("I think the user")));
        let c = classifier(fake.clone());

        let history = vec![Content::user("fix it"), Content::model("Next, I will run the tests.")];
        assert_eq!(c.classify(&history).await.unwrap(), NextSpeaker::Model);
        assert!(matches!(
            c.classify(&history).await,
            Err(Error::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_verdict_reasoning_is_optional() {
        let verdict: NextSpeakerVerdict =
            serde_json::from_str(r#"{"reasoning": "asked a question", "next_speaker": "user"}"#).unwrap();
        assert_eq!(verdict.reasoning, "asked a question");
        assert_eq!(verdict.next_speaker, NextSpeaker::User);

        let verdict: NextSpeakerVerdict = serde_json::from_str(r#"{"next_speaker": "model"}"#).unwrap();
        assert!(verdict.reasoning.is_empty());
        assert_eq!(verdict.next_speaker, NextSpeaker::Model);
    }

    #[tokio::test]
    async fn test_in_memory_store_returns_latest() {
        let store = InMemorySessionStore::new();
        assert!(store.load_latest().await.unwrap().is_none());

        let first = CompressionCheckpoint::new(None, vec![Content::user("a")], "s1".to_string(), 100, 10);
        let second = CompressionCheckpoint::new(Some(first.id.clone()), vec![], "s2".to_string(), 90, 9);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.parent_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(store.checkpoints().await.len(), 2);

        store
            .record_token_count(TokenSnapshot::now("gemini-2.5-pro", 42))
            .await
            .unwrap();
        assert_eq!(store.snapshots().await[0].tokens, 42);
    }

    #[test]
    fn test_vec_registry() {
        let tools = vec![ToolSchema {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            parameters: json!({"type": "object"}),
        }];
        assert_eq!(tools.function_declarations().len(), 1);
        assert!(NoTools.function_declarations().is_empty());
    }
}
