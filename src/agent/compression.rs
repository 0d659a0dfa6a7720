//! History compression.
//!
//! When the session's token usage approaches the active model's context
//! window, the older part of the history is replaced by a model-written
//! state snapshot. Each compression yields an immutable
//! [`CompressionCheckpoint`] linked to the previous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::collaborators::{SessionStore, TokenSnapshot};
use crate::agent::content::{Content, Role};
use crate::agent::events::CompressionInfo;
use crate::agent::llm::{ContentGenerator, GenerateRequest};
use crate::agent::resilience::RetryPolicy;
use crate::agent::tokens::{estimate_message_tokens, SessionTokenMetrics, TokenBudget};
use crate::config::CompressionConfig;
use crate::error::Error;
use crate::Result;

const COMPRESSION_PROMPT: &str = r#"You are the component that condenses a long coding conversation into a compact state snapshot. The snapshot fully replaces the conversation so far, so the agent will rely on it alone to continue the work.

Produce exactly one <state_snapshot> XML block with these sections:

<state_snapshot>
    <overall_goal>
        The user's high-level objective in one sentence.
    </overall_goal>
    <key_knowledge>
        Facts, constraints, conventions and decisions the agent must keep in mind, as bullet points.
    </key_knowledge>
    <file_system_state>
        Files created, read, modified or deleted, with what matters about each.
    </file_system_state>
    <recent_actions>
        The last significant actions taken and their outcomes.
    </recent_actions>
    <current_plan>
        The remaining steps, each marked [DONE], [IN PROGRESS] or [TODO].
    </current_plan>
</state_snapshot>

Be dense. Omit conversational filler."#;

const SNAPSHOT_REQUEST: &str =
    "First, reason in your scratchpad. Then, generate the <state_snapshot>.";

const SNAPSHOT_ACK: &str = "Got it. Thanks for the additional context!";

/// One history-summarization event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionCheckpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub history_before: Vec<Content>,
    pub summary_text: String,
    pub original_token_count: usize,
    pub new_token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl CompressionCheckpoint {
    pub fn new(
        parent_id: Option<String>,
        history_before: Vec<Content>,
        summary_text: String,
        original_token_count: usize,
        new_token_count: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            history_before,
            summary_text,
            original_token_count,
            new_token_count,
            created_at: Utc::now(),
        }
    }

    /// Summary fields reported in the `Compressed` event.
    pub fn info(&self) -> CompressionInfo {
        CompressionInfo {
            checkpoint_id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            original_token_count: self.original_token_count,
            new_token_count: self.new_token_count,
            created_at: self.created_at,
        }
    }
}

/// Index of the first history entry kept verbatim.
///
/// Smallest prefix whose serialized size reaches `1 - preserve_fraction` of
/// the total, moved forward past model replies and tool responses so the cut
/// lands on a user-authored turn (or at the end).
pub fn find_compress_split_point(history: &[Content], preserve_fraction: f64) -> usize {
    let sizes: Vec<usize> = history.iter().map(Content::serialized_len).collect();
    let total: usize = sizes.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = total as f64 * (1.0 - preserve_fraction);
    let mut cumulative = 0usize;
    let mut index = history.len();
    for (i, size) in sizes.iter().enumerate() {
        cumulative += size;
        if cumulative as f64 >= target {
            index = i + 1;
            break;
        }
    }

    while index < history.len()
        && (history[index].role == Role::Model || history[index].is_function_response())
    {
        index += 1;
    }
    index
}

/// State a compression pass reads and rewrites, borrowed from the engine.
pub struct CompressionContext<'a> {
    pub history: &'a mut Vec<Content>,
    pub metrics: &'a mut SessionTokenMetrics,
    pub generator: &'a dyn ContentGenerator,
    pub store: &'a dyn SessionStore,
    /// Active model: its context window sets the budget and it writes the
    /// summary.
    pub model: &'a str,
    pub cancel: &'a CancellationToken,
}

/// Decides when to compress and performs the rewrite.
#[derive(Debug, Clone)]
pub struct CompressionManager {
    config: CompressionConfig,
    retry: RetryPolicy,
    last_checkpoint_id: Option<String>,
}

impl CompressionManager {
    pub fn new(config: CompressionConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            last_checkpoint_id: None,
        }
    }

    /// Continue the checkpoint chain of a resumed session.
    pub fn resume_from(&mut self, checkpoint_id: Option<String>) {
        self.last_checkpoint_id = checkpoint_id;
    }

    /// Compress when forced or when usage reached the threshold.
    ///
    /// Returns `Ok(None)` for a no-op. On error the history is untouched.
    pub async fn try_compress(
        &mut self,
        ctx: CompressionContext<'_>,
        force: bool,
        after_tools: bool,
    ) -> Result<Option<CompressionCheckpoint>> {
        if ctx.history.is_empty() {
            return Ok(None);
        }

        let original_token_count = if ctx.metrics.is_empty() {
            count_or_estimate(ctx.generator, ctx.model, ctx.history.as_slice()).await
        } else {
            ctx.metrics.cumulative()
        };
        // The cumulative count gates compression; the current-model count is
        // only logged when the two diverge.
        if let Some(model_tokens) = ctx.metrics.for_model(ctx.model) {
            if model_tokens != original_token_count {
                debug!(
                    model = ctx.model,
                    cumulative = original_token_count,
                    model_tokens,
                    "Cumulative and current-model token counts differ"
                );
            }
        }

        let budget = TokenBudget::for_model(
            ctx.model,
            self.config.threshold_ratio,
            self.config.threshold_ratio_after_tools,
        );
        if !force && (original_token_count as f64) < budget.threshold(after_tools) {
            return Ok(None);
        }

        let split = find_compress_split_point(ctx.history.as_slice(), self.config.preserve_fraction);
        if split == 0 {
            debug!("Nothing before the split point, skipping compression");
            return Ok(None);
        }

        info!(
            model = ctx.model,
            tokens = original_token_count,
            limit = budget.limit,
            entries = split,
            "Compressing conversation history"
        );

        let mut contents = ctx.history[..split].to_vec();
        contents.push(Content::user(SNAPSHOT_REQUEST));
        let request = GenerateRequest {
            system_instruction: Some(COMPRESSION_PROMPT.to_string()),
            ..GenerateRequest::new(ctx.model, contents)
        };

        let generator = ctx.generator;
        let response = self
            .retry
            .run(ctx.cancel, "compress", || generator.generate(&request))
            .await?;
        let summary = response.text().trim().to_string();
        if summary.is_empty() {
            return Err(Error::CompressionFailed(
                "summary generation returned an empty response".to_string(),
            ));
        }

        let mut new_history = Vec::with_capacity(ctx.history.len() - split + 2);
        new_history.push(Content::user(summary.clone()));
        new_history.push(Content::model(SNAPSHOT_ACK));
        new_history.extend_from_slice(&ctx.history[split..]);

        let new_token_count = count_or_estimate(ctx.generator, ctx.model, &new_history).await;
        let checkpoint = CompressionCheckpoint::new(
            self.last_checkpoint_id.clone(),
            std::mem::replace(ctx.history, new_history),
            summary,
            original_token_count,
            new_token_count,
        );
        ctx.metrics.reset_to(ctx.model, new_token_count);
        self.last_checkpoint_id = Some(checkpoint.id.clone());

        if let Err(e) = ctx.store.save(&checkpoint).await {
            warn!(checkpoint = %checkpoint.id, "Failed to persist compression checkpoint: {}", e);
        }
        if let Err(e) = ctx
            .store
            .record_token_count(TokenSnapshot::now(ctx.model, new_token_count))
            .await
        {
            warn!("Failed to record token count: {}", e);
        }

        info!(
            checkpoint = %checkpoint.id,
            before = original_token_count,
            after = new_token_count,
            "History compressed"
        );
        Ok(Some(checkpoint))
    }
}

/// Backend token count, or the local estimate when counting fails.
pub(crate) async fn count_or_estimate(generator: &dyn ContentGenerator, model: &str, contents: &[Content]) -> usize {
    match generator.count_tokens(model, contents).await {
        Ok(count) => count,
        Err(e) => {
            warn!(model, "Token counting failed, using estimate: {}", e);
            let texts: Vec<String> = contents
                .iter()
                .map(|c| serde_json::to_string(c).unwrap_or_default())
                .collect();
            estimate_message_tokens(&texts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collaborators::InMemorySessionStore;
    use crate::agent::content::Part;
    use crate::agent::events::UsageMetadata;
    use crate::agent::llm::testing::FakeContentGenerator;
    use crate::agent::llm::GenerateResponse;
    use serde_json::json;

    fn conversation() -> Vec<Content> {
        vec![
            Content::user("please refactor the parser module"),
            Content::new(
                Role::Model,
                vec![Part::function_call("c1", "read_file", r#"{"path":"src/parser.rs"}"#)],
            ),
            Content::new(
                Role::User,
                vec![Part::function_response("c1", "read_file", json!({"output": "fn parse() {}".repeat(20)}))],
            ),
            Content::model("The parser has one entry point. I will split it into lexer and grammar."),
            Content::user("sounds good, go ahead"),
            Content::model("Done. The lexer now lives in lexer.rs."),
            Content::user("thanks"),
        ]
    }

    fn manager() -> CompressionManager {
        CompressionManager::new(CompressionConfig::default(), RetryPolicy::none())
    }

    #[test]
    fn test_split_point_lands_on_user_turn() {
        let history = conversation();
        for fraction in [0.05, 0.1, 0.3, 0.5, 0.7, 0.9, 0.95] {
            let split = find_compress_split_point(&history, fraction);
            assert!(split <= history.len());
            if split < history.len() {
                assert_eq!(history[split].role, Role::User, "fraction {fraction}");
                assert!(!history[split].is_function_response(), "fraction {fraction}");
            }
        }
    }

    #[test]
    fn test_split_point_skips_tool_pairs() {
        let history = conversation();
        let split = find_compress_split_point(&history, 0.9);
        assert!(split != 1 && split != 2);
        assert_eq!(find_compress_split_point(&[], 0.3), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let fake = FakeContentGenerator::new();
        let store = InMemorySessionStore::new();
        let mut history = conversation();
        let before = history.clone();
        let mut metrics = SessionTokenMetrics::default();
        metrics.record(
            "gemini-2.5-pro",
            &UsageMetadata {
                total_token_count: 10_000,
                ..Default::default()
            },
        );

        let mut manager = manager();
        let result = manager
            .try_compress(
                CompressionContext {
                    history: &mut history,
                    metrics: &mut metrics,
                    generator: &fake,
                    store: &store,
                    model: "gemini-2.5-pro",
                    cancel: &CancellationToken::new(),
                },
                false,
                false,
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(history, before);
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn test_forced_compression_rewrites_history() {
        let fake = FakeContentGenerator::new();
        fake.push_reply(Ok(GenerateResponse::from_text(
            "<state_snapshot><overall_goal>Refactor parser</overall_goal></state_snapshot>",
        )));
        let store = InMemorySessionStore::new();
        let mut history = conversation();
        let original = history.clone();
        let mut metrics = SessionTokenMetrics::default();

        let checkpoint = manager()
            .try_compress(
                CompressionContext {
                    history: &mut history,
                    metrics: &mut metrics,
                    generator: &fake,
                    store: &store,
                    model: "gemini-2.5-pro",
                    cancel: &CancellationToken::new(),
                },
                true,
                false,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(checkpoint.history_before, original);
        assert!(checkpoint.parent_id.is_none());
        assert!(history[0].text().contains("Refactor parser"));
        assert_eq!(history[1].role, Role::Model);
        assert_eq!(history.last(), original.last());
        assert_eq!(metrics.for_model("gemini-2.5-pro"), Some(checkpoint.new_token_count));
        assert_eq!(store.checkpoints().await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_summary_leaves_history_intact() {
        let fake = FakeContentGenerator::new();
        fake.push_reply(Ok(GenerateResponse::from_text("   ")));
        let store = InMemorySessionStore::new();
        let mut history = conversation();
        let before = history.clone();
        let mut metrics = SessionTokenMetrics::default();

        let result = manager()
            .try_compress(
                CompressionContext {
                    history: &mut history,
                    metrics: &mut metrics,
                    generator: &fake,
                    store: &store,
                    model: "gemini-2.5-pro",
                    cancel: &CancellationToken::new(),
                },
                true,
                false,
            )
            .await;

        assert!(matches!(result, Err(Error::CompressionFailed(_))));
        assert_eq!(history, before);
        assert!(store.checkpoints().await.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_after_tools_is_looser() {
        let fake = FakeContentGenerator::new();
        fake.push_reply(Ok(GenerateResponse::from_text("snapshot")));
        let store = InMemorySessionStore::new();
        let mut history = conversation();
        let mut metrics = SessionTokenMetrics::default();
        // 90% of the gemini-2.5-pro window: over 0.85, under 0.95.
        metrics.record(
            "gemini-2.5-pro",
            &UsageMetadata {
                total_token_count: 943_718,
                ..Default::default()
            },
        );

        let mut manager = manager();
        let normal = manager
            .try_compress(
                CompressionContext {
                    history: &mut history,
                    metrics: &mut metrics,
                    generator: &fake,
                    store: &store,
                    model: "gemini-2.5-pro",
                    cancel: &CancellationToken::new(),
                },
                false,
                false,
            )
            .await
            .unwrap();
        assert!(normal.is_none());

        let after_tools = manager
            .try_compress(
                CompressionContext {
                    history: &mut history,
                    metrics: &mut metrics,
                    generator: &fake,
                    store: &store,
                    model: "gemini-2.5-pro",
                    cancel: &CancellationToken::new(),
                },
                false,
                true,
            )
            .await
            .unwrap();
        assert!(after_tools.is_some());
    }
}
