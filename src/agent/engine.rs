//! Turn engine - drives one conversation through backend calls
//!
//! A turn starts with user input and ends when the model hands control
//! back: tool calls to execute, a reply for the user, an exhausted turn
//! budget, a detected loop, an error or cancellation. Continuations the
//! model asks for run as further steps of the same turn.

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::agent::collaborators::{Collaborators, EnvironmentProvider, NextSpeaker, TokenSnapshot};
use crate::agent::compression::{
    count_or_estimate, CompressionCheckpoint, CompressionContext, CompressionManager,
};
use crate::agent::content::{normalize_input, Content, MessageInput, Part, Role};
use crate::agent::events::{StreamEvent, ToolCallRequest, Turn, TurnError};
use crate::agent::llm::{
    ContentGenerator, GenerateRequest, GenerationConfig, ResponseEvent, ResponseStream,
};
use crate::agent::resilience::{call_with_fallback, ActiveModel, LoopDetector, Resilient, RetryPolicy};
use crate::agent::tokens::SessionTokenMetrics;
use crate::config::Config;
use crate::error::Error;
use crate::Result;

/// Synthetic input sent when the model wants to keep going.
const CONTINUE_PROMPT: &str = "Please continue.";

/// Where the engine is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingResponse,
    /// Tool calls were requested; their results are the next input.
    ToolsPending,
    Continuing,
    Done,
}

enum Step {
    Continue,
    Stop,
}

/// Owns the history of one conversation and runs its turns sequentially.
pub struct TurnEngine {
    generator: Arc<dyn ContentGenerator>,
    collaborators: Collaborators,
    history: Vec<Content>,
    system_instruction: Option<String>,
    generation: GenerationConfig,
    max_turns: usize,
    retry: RetryPolicy,
    active: ActiveModel,
    compression: CompressionManager,
    loop_detector: LoopDetector,
    metrics: SessionTokenMetrics,
    state: EngineState,
    environment_seeded: bool,
}

impl TurnEngine {
    /// Create an engine on the flagship model, continuing the checkpoint
    /// chain of the store if it has one.
    pub async fn new(
        config: &Config,
        generator: Arc<dyn ContentGenerator>,
        collaborators: Collaborators,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let mut compression = CompressionManager::new(config.compression.clone(), retry.clone());

        match collaborators.store.load_latest().await {
            Ok(Some(checkpoint)) => {
                info!(checkpoint = %checkpoint.id, "Resuming compression checkpoint chain");
                compression.resume_from(Some(checkpoint.id));
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load latest checkpoint: {}", e),
        }

        Self {
            generator,
            collaborators,
            history: Vec::new(),
            system_instruction: config.system_instruction.clone(),
            generation: config.generation.clone(),
            max_turns: config.max_turns,
            retry,
            active: ActiveModel::new(config.model.clone(), config.fallback_model.clone()),
            compression,
            loop_detector: LoopDetector::new(&config.loop_detection),
            metrics: SessionTokenMetrics::default(),
            state: EngineState::Idle,
            environment_seeded: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Model the next backend call goes to.
    pub fn active_model(&self) -> &str {
        self.active.current()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn metrics(&self) -> &SessionTokenMetrics {
        &self.metrics
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Snapshot of the history.
    pub fn get_history(&self) -> Vec<Content> {
        self.history.clone()
    }

    /// Replace the history. Recorded usage no longer applies and is dropped.
    pub fn set_history(&mut self, history: Vec<Content>) {
        self.history = history;
        self.metrics = SessionTokenMetrics::default();
    }

    /// Prepend the environment preamble. Only the first call has an effect.
    pub async fn seed_environment(&mut self, provider: &dyn EnvironmentProvider) -> Result<()> {
        if self.environment_seeded {
            return Ok(());
        }
        let mut preamble = provider.initial_context().await?;
        preamble.append(&mut self.history);
        self.history = preamble;
        self.environment_seeded = true;
        Ok(())
    }

    /// Token count of `text` for the active model.
    pub async fn count_tokens(&self, text: &str) -> usize {
        count_or_estimate(
            self.generator.as_ref(),
            self.active.current(),
            &[Content::user(text)],
        )
        .await
    }

    /// Run compression outside a turn.
    pub async fn try_compress(
        &mut self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionCheckpoint>> {
        self.compress(force, false, cancel).await
    }

    /// Send `input` and stream the resulting events into `events`.
    ///
    /// At most `turn_budget` backend round trips are made; running out
    /// emits a single `MaxTurnsReached`. The returned [`Turn`] is partial
    /// when `cancel` fired.
    pub async fn send_message_stream(
        &mut self,
        input: impl Into<MessageInput>,
        cancel: &CancellationToken,
        turn_budget: usize,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Turn {
        let prompt_id = Uuid::new_v4().to_string();
        let mut turn = Turn::new(prompt_id.clone(), self.active.current().to_string());
        let mut input = normalize_input(input);
        let mut remaining = turn_budget;
        // Tool results continue the prompt that requested them.
        if !input.iter().any(Content::is_function_response) {
            self.loop_detector.reset();
        }

        info!(
            prompt_id = %prompt_id,
            model = self.active.current(),
            budget = turn_budget,
            "Starting turn"
        );

        loop {
            if remaining == 0 {
                warn!(prompt_id = %prompt_id, "Turn budget exhausted");
                turn.max_turns_reached = true;
                emit(events, StreamEvent::MaxTurnsReached).await;
                break;
            }
            remaining -= 1;

            match self.run_step(input, cancel, events, &mut turn).await {
                Step::Continue => input = vec![Content::user(CONTINUE_PROMPT)],
                Step::Stop => break,
            }
        }

        if self.state != EngineState::ToolsPending {
            self.state = EngineState::Done;
        }
        debug!(
            prompt_id = %prompt_id,
            state = ?self.state,
            tool_calls = turn.pending_tool_calls.len(),
            cancelled = turn.cancelled,
            "Turn finished"
        );
        turn
    }

    /// One backend round trip.
    async fn run_step(
        &mut self,
        input: Vec<Content>,
        cancel: &CancellationToken,
        events: &mpsc::Sender<StreamEvent>,
        turn: &mut Turn,
    ) -> Step {
        self.state = EngineState::AwaitingResponse;
        if cancel.is_cancelled() {
            turn.cancelled = true;
            return Step::Stop;
        }

        let after_tools = input.iter().any(Content::is_function_response);
        match self.compress(false, after_tools, cancel).await {
            Ok(Some(checkpoint)) => emit(events, StreamEvent::Compressed(checkpoint.info())).await,
            Ok(None) => {}
            Err(Error::Cancelled) => {
                turn.cancelled = true;
                return Step::Stop;
            }
            Err(e) => {
                self.fail(turn, events, &e, "compress").await;
                return Step::Stop;
            }
        }

        let rollback = self.history.len();
        self.history.extend(input);

        let request = GenerateRequest {
            model: String::new(),
            contents: self.history.clone(),
            system_instruction: self.system_instruction.clone(),
            tools: self.collaborators.tools.function_declarations(),
            config: self.generation.clone(),
        };
        let generator = self.generator.clone();
        let opened = call_with_fallback(
            &self.retry,
            &mut self.active,
            cancel,
            "generate_stream",
            |model| {
                let request = request.with_model(&model);
                let generator = generator.clone();
                async move { open_stream(generator.as_ref(), &request).await }
            },
        )
        .await;

        let Resilient {
            value: mut stream,
            model,
            switched,
        } = match opened {
            Ok(opened) => opened,
            Err(Error::Cancelled) => {
                self.history.truncate(rollback);
                turn.cancelled = true;
                return Step::Stop;
            }
            Err(e) => {
                self.history.truncate(rollback);
                self.fail(turn, events, &e, "generate_stream").await;
                return Step::Stop;
            }
        };

        turn.model = model.clone();
        if let Some(switch) = &switched {
            emit(
                events,
                StreamEvent::ModelSwitched {
                    from: switch.from.clone(),
                    to: switch.to.clone(),
                },
            )
            .await;
        }

        let mut text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        let mut failure = None;
        let mut malformed = false;
        let mut last_usage = None;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    turn.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            match event {
                ResponseEvent::TextDelta(delta) => {
                    if let Some(kind) = self.loop_detector.check_content(&delta) {
                        debug!(?kind, "Stopping turn on repeated content");
                        turn.loop_detected = true;
                        emit(events, StreamEvent::LoopDetected).await;
                        break;
                    }
                    text.push_str(&delta);
                    turn.text.push_str(&delta);
                    emit(events, StreamEvent::TextDelta(delta)).await;
                }
                ResponseEvent::ThoughtDelta(thought) => {
                    emit(events, StreamEvent::ThoughtDelta(thought)).await;
                }
                ResponseEvent::ToolCall(call) => {
                    if let Some(kind) = self.loop_detector.check_tool_call(&call) {
                        debug!(?kind, "Stopping turn on repeated tool call");
                        turn.loop_detected = true;
                        emit(events, StreamEvent::LoopDetected).await;
                        break;
                    }
                    emit(events, StreamEvent::ToolCallRequest(call.clone())).await;
                    calls.push(call);
                }
                ResponseEvent::MalformedToolCall {
                    id,
                    name,
                    raw,
                    message,
                } => {
                    malformed = true;
                    let error = Error::malformed(format!("tool call {name} ({id}): {message}"), raw);
                    self.fail(turn, events, &error, "generate_stream").await;
                }
                ResponseEvent::Usage(usage) => {
                    self.metrics.record(&model, &usage);
                    self.collaborators.telemetry.record_usage(&model, &usage);
                    turn.usage = Some(usage.clone());
                    last_usage = Some(usage.clone());
                    emit(events, StreamEvent::UsageMetadata(usage)).await;
                }
                ResponseEvent::Finished(reason) => {
                    trace!(?reason, "Backend finished");
                    turn.finish_reason = Some(reason);
                }
            }
        }
        drop(stream);

        // A failed send leaves no trace in the history.
        if let Some(e) = failure {
            self.history.truncate(rollback);
            self.fail(turn, events, &e, "generate_stream").await;
            return Step::Stop;
        }

        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(
            calls
                .iter()
                .map(|c| Part::function_call(c.id.clone(), c.name.clone(), c.arguments.to_string())),
        );
        if !parts.is_empty() {
            self.history.push(Content::new(Role::Model, parts));
        } else if turn.cancelled {
            self.history.truncate(rollback);
        }
        turn.pending_tool_calls = calls;

        if let Some(usage) = last_usage {
            let snapshot = TokenSnapshot::now(model.as_str(), usage.context_tokens());
            if let Err(e) = self.collaborators.store.record_token_count(snapshot).await {
                warn!("Failed to record token count: {}", e);
            }
        }

        if turn.cancelled || turn.loop_detected || malformed {
            return Step::Stop;
        }
        if turn.has_tool_calls() {
            self.state = EngineState::ToolsPending;
            return Step::Stop;
        }
        if let Some(switch) = switched {
            info!(from = %switch.from, to = %switch.to, "Not continuing across a model switch");
            return Step::Stop;
        }
        if cancel.is_cancelled() {
            turn.cancelled = true;
            return Step::Stop;
        }

        let next = match self.collaborators.classifier.classify(&self.history).await {
            Ok(next) => next,
            Err(e) => {
                warn!("Next speaker check failed, handing back to the user: {}", e);
                NextSpeaker::User
            }
        };
        if next == NextSpeaker::User {
            return Step::Stop;
        }

        match self.compress(false, true, cancel).await {
            Ok(Some(checkpoint)) => emit(events, StreamEvent::Compressed(checkpoint.info())).await,
            Ok(None) => {}
            Err(Error::Cancelled) => {
                turn.cancelled = true;
                return Step::Stop;
            }
            Err(e) => {
                self.fail(turn, events, &e, "compress").await;
                return Step::Stop;
            }
        }

        self.state = EngineState::Continuing;
        Step::Continue
    }

    async fn compress(
        &mut self,
        force: bool,
        after_tools: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionCheckpoint>> {
        let model = self.active.current().to_string();
        self.compression
            .try_compress(
                CompressionContext {
                    history: &mut self.history,
                    metrics: &mut self.metrics,
                    generator: self.generator.as_ref(),
                    store: self.collaborators.store.as_ref(),
                    model: &model,
                    cancel,
                },
                force,
                after_tools,
            )
            .await
    }

    /// Report a fatal error for the current turn.
    async fn fail(
        &self,
        turn: &mut Turn,
        events: &mpsc::Sender<StreamEvent>,
        error: &Error,
        operation: &str,
    ) {
        let turn_error = TurnError::from_error(error, self.active.current(), operation);
        self.collaborators.telemetry.record_error(&turn_error);
        turn.error = Some(turn_error.clone());
        emit(events, StreamEvent::Error(turn_error)).await;
    }
}

/// Open a stream and wait for its first item.
///
/// A stream whose first item is already an error fails here, so the error
/// goes through retry and quota fallback like a refused connection.
async fn open_stream(generator: &dyn ContentGenerator, request: &GenerateRequest) -> Result<ResponseStream> {
    let mut response = generator.generate_stream(request).await?;
    match response.next().await {
        Some(Err(e)) => {
            debug!(model = %request.model, "Stream failed before producing output: {}", e);
            Err(e)
        }
        Some(Ok(first)) => Ok(Box::pin(stream::once(async move { Ok(first) }).chain(response))),
        None => Ok(Box::pin(stream::empty())),
    }
}

async fn emit(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if events.send(event).await.is_err() {
        trace!("Event receiver dropped");
    }
}
