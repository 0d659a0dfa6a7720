//! Quota-driven downgrade from the flagship to the fallback model.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A model change caused by a quota failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSwitch {
    pub from: String,
    pub to: String,
}

/// The model a conversation currently talks to.
///
/// Every instance starts on the flagship; a downgrade lasts for the
/// lifetime of the owning engine only.
#[derive(Debug, Clone)]
pub struct ActiveModel {
    flagship: String,
    fallback: String,
    current: String,
}

impl ActiveModel {
    pub fn new(flagship: impl Into<String>, fallback: impl Into<String>) -> Self {
        let flagship = flagship.into();
        Self {
            current: flagship.clone(),
            flagship,
            fallback: fallback.into(),
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn is_on_fallback(&self) -> bool {
        self.current == self.fallback
    }

    /// React to a quota failure on the current model.
    ///
    /// Returns the switch performed, or `None` when already on the fallback
    /// model and the failure has to propagate.
    pub fn handle_quota(&mut self) -> Option<ModelSwitch> {
        if self.is_on_fallback() {
            return None;
        }
        let switch = ModelSwitch {
            from: std::mem::replace(&mut self.current, self.fallback.clone()),
            to: self.fallback.clone(),
        };
        warn!(from = %switch.from, to = %switch.to, "Quota exhausted, switching to fallback model");
        Some(switch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_downgrade() {
        let mut active = ActiveModel::new("gemini-2.5-pro", "gemini-2.5-flash");
        assert_eq!(active.current(), "gemini-2.5-pro");

        let switch = active.handle_quota().unwrap();
        assert_eq!(switch.from, "gemini-2.5-pro");
        assert_eq!(switch.to, "gemini-2.5-flash");
        assert!(active.is_on_fallback());

        assert!(active.handle_quota().is_none());
        assert_eq!(active.current(), "gemini-2.5-flash");
    }

    #[test]
    fn test_flagship_equal_to_fallback_never_switches() {
        let mut active = ActiveModel::new("gpt-4o", "gpt-4o");
        assert!(active.handle_quota().is_none());
    }
}
