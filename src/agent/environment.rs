//! Session preamble describing the user's workspace.
//!
//! Computed once when a session starts and injected as the first exchange
//! of the history, so the model knows where it is working.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::agent::collaborators::EnvironmentProvider;
use crate::agent::content::Content;
use crate::Result;

/// Maximum directory entries listed in the preamble.
const MAX_LISTED_ENTRIES: usize = 200;

const ENVIRONMENT_ACK: &str = "Got it. Thanks for the context!";

/// [`EnvironmentProvider`] for a local working directory.
pub struct WorkspaceEnvironment {
    workspace: PathBuf,
    max_entries: usize,
}

impl WorkspaceEnvironment {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            max_entries: MAX_LISTED_ENTRIES,
        }
    }

    /// Environment of the process's current directory.
    pub fn current_dir() -> Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// The preamble text.
    pub fn describe(&self) -> Result<String> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let listing = list_entries(&self.workspace, self.max_entries)?;

        Ok(format!(
            "This is the coding session context.\n\
             Today's date is {}.\n\
             My operating system is: {}\n\
             I'm currently working in the directory: {}\n\
             Showing up to {} top-level entries of the working directory:\n\n{}",
            now,
            std::env::consts::OS,
            self.workspace.display(),
            self.max_entries,
            listing
        ))
    }
}

/// Sorted top-level entries of `dir`, directories suffixed with `/`.
fn list_entries(dir: &Path, max_entries: usize) -> Result<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(t) if t.is_dir() => format!("{name}/"),
                _ => name,
            }
        })
        .collect();
    names.sort();

    let total = names.len();
    let mut lines: Vec<String> = names
        .into_iter()
        .take(max_entries)
        .map(|name| format!("- {name}"))
        .collect();
    if total > max_entries {
        lines.push(format!("... ({} more entries not shown)", total - max_entries));
    }
    if lines.is_empty() {
        lines.push("(empty directory)".to_string());
    }
    Ok(lines.join("\n"))
}

#[async_trait]
impl EnvironmentProvider for WorkspaceEnvironment {
    async fn initial_context(&self) -> Result<Vec<Content>> {
        debug!(workspace = ?self.workspace, "Building environment context");
        Ok(vec![
            Content::user(self.describe()?),
            Content::model(ENVIRONMENT_ACK),
        ])
    }
}
