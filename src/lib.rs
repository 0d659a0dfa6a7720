//! Tern - conversation orchestration core for a terminal coding agent
//!
//! This library turns user input into model turns against Gemini, Vertex AI
//! or OpenAI-compatible backends, streaming events back while it handles
//! retries, quota fallback, loop detection and history compression.

pub mod agent;
pub mod config;
pub mod error;

pub use error::{Error, Result};
