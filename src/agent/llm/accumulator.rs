//! Reassembly of tool calls split across stream chunks.
//!
//! Backends may deliver one logical call as many fragments: the first carries
//! an id and name, later ones only argument text keyed by a per-response
//! index. The accumulator lives for one streaming response and is drained
//! when the backend signals completion. Calls that arrive whole skip it and
//! go straight through [`complete_call`].

use tracing::{debug, warn};

use super::ResponseEvent;
use crate::agent::content::parse_arguments;
use crate::agent::events::ToolCallRequest;

#[derive(Debug, Default)]
struct PendingCall {
    index: Option<u32>,
    id: String,
    name: String,
    arguments: String,
}

/// In-flight tool calls of a single streaming response, keyed by call id.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: Vec<PendingCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feed one fragment.
    ///
    /// A fragment with an unseen id starts a new entry. A fragment without an
    /// id extends the entry with the same index, or the most recent entry when
    /// the backend sends no index either.
    pub fn push(
        &mut self,
        index: Option<u32>,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let id = id.filter(|id| !id.is_empty());
        let position = match id {
            Some(id) => self
                .entries
                .iter()
                .position(|e| e.id == id)
                .or_else(|| {
                    index.and_then(|index| {
                        self.entries
                            .iter()
                            .rposition(|e| e.index == Some(index) && e.id.is_empty())
                    })
                }),
            None => match index {
                Some(index) => self.entries.iter().rposition(|e| e.index == Some(index)),
                None => self.entries.len().checked_sub(1),
            },
        };

        let position = position.unwrap_or_else(|| {
            self.entries.push(PendingCall {
                index,
                ..Default::default()
            });
            self.entries.len() - 1
        });

        let entry = &mut self.entries[position];
        if let Some(id) = id {
            if entry.id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if entry.name.is_empty() {
                entry.name = name.to_string();
            }
        }
        if let Some(fragment) = arguments {
            entry.arguments.push_str(fragment);
        }
    }

    /// Emit one event per accumulated call and clear the accumulator.
    ///
    /// Calls whose buffer is not valid JSON, or which never received a name,
    /// are reported as malformed with the raw buffer preserved.
    pub fn drain(&mut self) -> Vec<ResponseEvent> {
        let entries = std::mem::take(&mut self.entries);
        debug!(count = entries.len(), "Draining accumulated tool calls");

        entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                let id = Some(entry.id).filter(|id| !id.is_empty());
                complete_call(id, entry.name, entry.arguments, position)
            })
            .collect()
    }
}

/// Event for a call whose name and full argument text are known.
///
/// A missing id becomes `name:position`. A call without a name, or whose
/// arguments are not valid JSON, is reported as malformed with the raw
/// arguments preserved.
pub fn complete_call(
    id: Option<String>,
    name: String,
    arguments: String,
    position: usize,
) -> ResponseEvent {
    let id = id.unwrap_or_else(|| format!("{name}:{position}"));

    if name.is_empty() {
        warn!(id = %id, "Tool call fragment never received a name");
        return ResponseEvent::MalformedToolCall {
            id,
            name,
            raw: arguments,
            message: "tool call has no function name".to_string(),
        };
    }

    match parse_arguments(&arguments) {
        Ok(parsed) => ResponseEvent::ToolCall(ToolCallRequest {
            id,
            name,
            arguments: parsed,
        }),
        Err(e) => {
            warn!(tool = %name, "Tool call arguments are not valid JSON: {}", e);
            ResponseEvent::MalformedToolCall {
                id,
                name,
                raw: arguments,
                message: format!("invalid tool call arguments: {e}"),
            }
        }
    }
}
