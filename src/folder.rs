use crate::store::validate_project_name;
use std::io::{self, BufRead, Write};

pub const DEFAULT_FOLDER: &str = "General";

/// Chooses the destination folder for a chat seen for the first time.
pub trait FolderResolver: Send {
    /// `existing` lists folders already known to the store. `None` leaves the
    /// chat unmapped; it will be asked for again on the next switch.
    fn resolve(&mut self, chat_id: &str, existing: &[String]) -> Option<String>;
}

/// Always answers the same folder.
pub struct FixedFolder(pub String);

impl FolderResolver for FixedFolder {
    fn resolve(&mut self, _chat_id: &str, _existing: &[String]) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Asks on the terminal.
pub struct PromptFolder<R, W> {
    input: R,
    output: W,
}

impl PromptFolder<io::BufReader<io::Stdin>, io::Stderr> {
    pub fn stdio() -> Self {
        Self {
            input: io::BufReader::new(io::stdin()),
            output: io::stderr(),
        }
    }
}

impl<R: BufRead, W: Write> PromptFolder<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, chat_id: &str, existing: &[String]) -> io::Result<Option<String>> {
        let mut choices: Vec<&str> = existing.iter().map(String::as_str).collect();
        if !choices.contains(&DEFAULT_FOLDER) {
            choices.push(DEFAULT_FOLDER);
        }

        writeln!(self.output, "Where should \"{chat_id}\" be saved?")?;
        for (i, name) in choices.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, name)?;
        }
        write!(self.output, "Folder number or new folder name (blank to skip): ")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        let answer = line.trim();
        if answer.is_empty() {
            return Ok(None);
        }
        if let Ok(n) = answer.parse::<usize>()
            && let Some(name) = n.checked_sub(1).and_then(|i| choices.get(i))
        {
            return Ok(Some(name.to_string()));
        }
        if let Err(e) = validate_project_name(answer) {
            writeln!(self.output, "{e}")?;
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }
}

impl<R: BufRead + Send, W: Write + Send> FolderResolver for PromptFolder<R, W> {
    fn resolve(&mut self, chat_id: &str, existing: &[String]) -> Option<String> {
        self.ask(chat_id, existing).ok().flatten()
    }
}
