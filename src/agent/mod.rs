//! Agent module - conversation orchestration core.
//!
//! This module contains:
//! - The canonical message model ([`content`]) and turn events ([`events`])
//! - Content generators for each backend family ([`llm`])
//! - Token limits, estimation and session metrics ([`tokens`])
//! - History compression ([`compression`])
//! - Retry, quota fallback and loop detection ([`resilience`])
//! - The turn engine and its shareable session handle
//!
//! # Adding a New Backend
//!
//! See the [`llm`] module documentation.

pub mod collaborators;
pub mod compression;
pub mod content;
mod engine;
pub mod environment;
pub mod events;
pub mod llm;
pub mod resilience;
mod session;
pub mod tokens;

// Re-exports for convenience
pub use collaborators::Collaborators;
pub use content::{Content, MessageInput, Part, Role};
pub use engine::{EngineState, TurnEngine};
pub use events::{StreamEvent, Turn};
pub use llm::{create_content_generator, ContentGenerator};
pub use session::{ChatSession, TurnStream};
