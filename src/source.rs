use crate::utils::char_prefix;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Something that can show the conversation currently on screen.
pub trait SnapshotSource: Send {
    /// Identifier of the active chat, empty when it cannot be determined.
    fn chat_id(&mut self) -> String;
    /// Full text of the active conversation.
    fn current_text(&mut self) -> String;
}

/// Reads a text dump of the conversation view from disk.
///
/// The dump may start with a `Title: <document title>` line, which is used to
/// derive the chat identifier and is not part of the conversation text.
pub struct FileSnapshotSource {
    path: PathBuf,
    title_override: Option<String>,
}

const TITLE_PREFIX: &str = "Title:";

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>, title_override: Option<String>) -> Self {
        Self {
            path: path.into(),
            title_override,
        }
    }

    fn read(&self) -> (Option<String>, String) {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "snapshot not readable");
                return (None, String::new());
            }
        };
        split_title(&raw)
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn chat_id(&mut self) -> String {
        let (title, text) = self.read();
        let title = self.title_override.clone().or(title);
        derive_chat_id(title.as_deref(), &text)
    }

    fn current_text(&mut self) -> String {
        self.read().1
    }
}

fn split_title(raw: &str) -> (Option<String>, String) {
    match raw.split_once('\n') {
        Some((first, rest)) if first.starts_with(TITLE_PREFIX) => (
            Some(first[TITLE_PREFIX.len()..].trim().to_string()),
            rest.to_string(),
        ),
        None if raw.starts_with(TITLE_PREFIX) => {
            (Some(raw[TITLE_PREFIX.len()..].trim().to_string()), String::new())
        }
        _ => (None, raw.to_string()),
    }
}

/// Chat identifier from the document title, falling back to the opening of
/// the first substantial line when the title is generic or missing.
pub fn derive_chat_id(title: Option<&str>, text: &str) -> String {
    if let Some(title) = title {
        let title = title.replace(" - Claude", "");
        let title = title.trim();
        if !title.is_empty() && title != "Claude" && title != "Claude.ai" {
            return title.to_string();
        }
    }

    text.lines()
        .map(str::trim)
        .find(|line| line.chars().count() > 10)
        .map(|line| {
            char_prefix(line, 50)
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c.is_whitespace() {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
                .trim()
                .to_string()
        })
        .unwrap_or_default()
}
