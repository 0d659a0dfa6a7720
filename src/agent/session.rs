//! Shareable handle around a [`TurnEngine`].
//!
//! Turns run on a spawned task so the caller can consume events while the
//! engine works; the engine lock keeps turns of one session sequential.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::agent::compression::CompressionCheckpoint;
use crate::agent::content::{Content, MessageInput};
use crate::agent::engine::TurnEngine;
use crate::agent::events::{StreamEvent, Turn};
use crate::error::Error;
use crate::Result;

const EVENT_BUFFER: usize = 64;

/// Events of a running turn plus its final outcome.
pub struct TurnStream {
    pub events: ReceiverStream<StreamEvent>,
    pub outcome: JoinHandle<Turn>,
}

impl TurnStream {
    /// Wait for the turn, discarding events not yet consumed.
    pub async fn finish(self) -> Result<Turn> {
        drop(self.events);
        self.outcome
            .await
            .map_err(|e| Error::Other(format!("Turn task failed: {e}")))
    }
}

/// A conversation session.
#[derive(Clone)]
pub struct ChatSession {
    engine: Arc<Mutex<TurnEngine>>,
    max_turns: usize,
}

impl ChatSession {
    pub fn new(engine: TurnEngine) -> Self {
        let max_turns = engine.max_turns();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            max_turns,
        }
    }

    /// Start a turn with the configured turn budget.
    pub fn send_message_stream(
        &self,
        input: impl Into<MessageInput>,
        cancel: CancellationToken,
    ) -> TurnStream {
        self.send_with_budget(input, cancel, self.max_turns)
    }

    pub fn send_with_budget(
        &self,
        input: impl Into<MessageInput>,
        cancel: CancellationToken,
        turn_budget: usize,
    ) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.engine.clone();
        let input = input.into();

        let outcome = tokio::spawn(async move {
            let mut engine = engine.lock().await;
            engine.send_message_stream(input, &cancel, turn_budget, &tx).await
        });

        TurnStream {
            events: ReceiverStream::new(rx),
            outcome,
        }
    }

    pub async fn history(&self) -> Vec<Content> {
        self.engine.lock().await.get_history()
    }

    pub async fn set_history(&self, history: Vec<Content>) {
        self.engine.lock().await.set_history(history);
    }

    pub async fn try_compress(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionCheckpoint>> {
        self.engine.lock().await.try_compress(force, cancel).await
    }

    pub async fn count_tokens(&self, text: &str) -> usize {
        self.engine.lock().await.count_tokens(text).await
    }

    pub async fn active_model(&self) -> String {
        self.engine.lock().await.active_model().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collaborators::{Collaborators, InMemorySessionStore, NextSpeaker, NextSpeakerClassifier, NoTools, TracingTelemetry};
    use crate::agent::llm::testing::FakeContentGenerator;
    use crate::config::Config;
    use async_trait::async_trait;
    use futures_util::StreamExt;

    struct UserNext;

    #[async_trait]
    impl NextSpeakerClassifier for UserNext {
        async fn classify(&self, _history: &[Content]) -> Result<NextSpeaker> {
            Ok(NextSpeaker::User)
        }
    }

    async fn session(fake: Arc<FakeContentGenerator>) -> ChatSession {
        let collaborators = Collaborators {
            tools: Arc::new(NoTools),
            classifier: Arc::new(UserNext),
            store: Arc::new(InMemorySessionStore::new()),
            telemetry: Arc::new(TracingTelemetry),
        };
        ChatSession::new(TurnEngine::new(&Config::default(), fake, collaborators).await)
    }

    #[tokio::test]
    async fn test_events_then_outcome() {
        let fake = Arc::new(FakeContentGenerator::text_turns(&["Hello!"]));
        let session = session(fake).await;

        let mut turn = session.send_message_stream("hi", CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = turn.events.next().await {
            events.push(event);
        }
        let outcome = turn.outcome.await.unwrap();

        assert_eq!(events, vec![StreamEvent::TextDelta("Hello!".to_string())]);
        assert_eq!(outcome.text, "Hello!");
        assert_eq!(session.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_turns_run_sequentially() {
        let fake = Arc::new(FakeContentGenerator::text_turns(&["one", "two"]));
        let session = session(fake).await;

        let first = session.send_message_stream("a", CancellationToken::new());
        let second = session.send_message_stream("b", CancellationToken::new());
        let first = first.finish().await.unwrap();
        let second = second.finish().await.unwrap();

        let mut texts = vec![first.text, second.text];
        texts.sort();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(session.history().await.len(), 4);
    }

    #[tokio::test]
    async fn test_history_accessors() {
        let fake = Arc::new(FakeContentGenerator::new());
        let session = session(fake).await;
        session
            .set_history(vec![Content::user("q"), Content::model("a")])
            .await;
        assert_eq!(session.history().await.len(), 2);
        assert_eq!(session.active_model().await, "gemini-2.5-pro");
        assert!(session.count_tokens("hello").await >= 1);
    }
}
