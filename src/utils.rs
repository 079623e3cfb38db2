use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration required to run the append server.
/// This decouples the server from how the arguments were parsed (CLI/Config file).
#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub base_dir: PathBuf,
    pub port: u16,
}

/// Configuration required to run a capture session.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub server_url: String,
    pub state_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub title: Option<String>,
    pub default_folder: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileFrontmatter {
    pub chat: Option<String>,
    pub project: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Number of chars in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the char at `char_idx`, or `s.len()` when past the end.
pub fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Char index of the char starting at byte offset `byte_idx`.
pub fn char_index(s: &str, byte_idx: usize) -> usize {
    s[..byte_idx].chars().count()
}

/// The first `n` chars of `s`.
pub fn char_prefix(s: &str, n: usize) -> &str {
    &s[..byte_offset(s, n)]
}

/// The last `n` chars of `s`.
pub fn char_suffix(s: &str, n: usize) -> &str {
    let len = char_len(s);
    &s[byte_offset(s, len.saturating_sub(n))..]
}

/// Whitespace-separated word count.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Number of speaker turns in a transcript.
pub fn count_messages(text: &str) -> usize {
    text.matches("Human:").count() + text.matches("Assistant:").count()
}

/// Read the YAML frontmatter from an existing .md file and extract relevant fields.
pub fn parse_existing_frontmatter(path: &Path) -> Option<FileFrontmatter> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let first = lines.next()?.ok()?;
    if first.trim() != "---" {
        return None;
    }

    let mut chat: Option<String> = None;
    let mut project: Option<String> = None;
    let mut created_at: Option<DateTime<Utc>> = None;
    let mut bytes_read = 0usize;

    for line in lines {
        let line = line.ok()?;
        bytes_read += line.len() + 1;
        if bytes_read > 2048 || line.trim() == "---" {
            break;
        }
        if let Some(rest) = line.strip_prefix("chat:") {
            chat = Some(unquote(rest));
        } else if let Some(rest) = line.strip_prefix("project:") {
            project = Some(unquote(rest));
        } else if let Some(rest) = line.strip_prefix("created_at:") {
            created_at = DateTime::parse_from_rfc3339(&unquote(rest))
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    Some(FileFrontmatter {
        chat,
        project,
        created_at,
    })
}

// serde_yaml quotes scalars that would otherwise parse as another type
// ('123', 'true'), and single quotes are escaped by doubling.
fn unquote(raw: &str) -> String {
    let v = raw.trim();
    if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
        v[1..v.len() - 1].replace("''", "'")
    } else if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].replace("\\\"", "\"")
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn char_slicing_respects_multibyte_boundaries() {
        let s = "héllo wörld";
        assert_eq!(char_prefix(s, 2), "hé");
        assert_eq!(char_suffix(s, 3), "rld");
        assert_eq!(char_prefix(s, 100), s);
        assert_eq!(char_suffix(s, 100), s);
        assert_eq!(char_index(s, byte_offset(s, 8)), 8);
    }

    #[test]
    fn counts_words_and_turns() {
        let text = "Human: hi there\nAssistant: hello\n\nHuman:  ok";
        assert_eq!(count_words(text), 7);
        assert_eq!(count_messages(text), 3);
    }

    #[test]
    fn reads_frontmatter_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "---\nchat: 'It''s a chat'\nproject: General\ncreated_at: 2026-01-02T03:04:05Z\n---\n\n# body\n"
        )
        .unwrap();
        let fm = parse_existing_frontmatter(f.path()).unwrap();
        assert_eq!(fm.chat.as_deref(), Some("It's a chat"));
        assert_eq!(fm.project.as_deref(), Some("General"));
        assert!(fm.created_at.is_some());
    }

    #[test]
    fn missing_frontmatter_is_none() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "# Legacy chat\n\nHuman: hi\n").unwrap();
        assert!(parse_existing_frontmatter(f.path()).is_none());
    }
}
