use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct Frontmatter<'a> {
    chat: &'a str,
    project: &'a str,
    created_at: DateTime<Utc>,
}

/// Header written once, when a chat file is created.
pub fn write_chat_header<W: Write>(
    writer: &mut W,
    chat: &str,
    project: &str,
    created_at: DateTime<Utc>,
) -> std::io::Result<()> {
    let fm = Frontmatter {
        chat,
        project,
        created_at,
    };

    writeln!(writer, "---")?;
    let yaml = serde_yaml::to_string(&fm).map_err(std::io::Error::other)?;
    write!(writer, "{}", yaml)?;
    writeln!(writer, "---")?;
    writeln!(writer)?;
    writeln!(writer, "# {}", chat)?;
    writeln!(writer)?;
    Ok(())
}

/// Banner placed before the first capture of a chat in a session.
pub fn capture_separator(is_full_capture: bool, chat: &str, folder: &str, at: DateTime<Local>) -> String {
    let rule = "=".repeat(60);
    let label = if is_full_capture {
        "Full Capture"
    } else {
        "Continuation"
    };
    format!(
        "\n\n{rule}\n📅 {label}: {}\n💬 Chat: {chat}\n📁 Folder: {folder}\n{rule}\n\n",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_has_frontmatter_and_title() {
        let mut out = Vec::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        write_chat_header(&mut out, "Async traits", "Work", at).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("---\nchat: Async traits\nproject: Work\ncreated_at: "));
        assert!(text.ends_with("---\n\n# Async traits\n\n"));
    }

    #[test]
    fn separator_labels_capture_kind() {
        let at = Local.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let full = capture_separator(true, "Chat", "General", at);
        assert!(full.contains("📅 Full Capture: 2026-03-01 09:30:00"));
        assert!(full.contains("📁 Folder: General"));
        assert!(capture_separator(false, "Chat", "General", at).contains("Continuation"));
    }
}
