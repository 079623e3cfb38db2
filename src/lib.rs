//! # claude-autosave
//!
//! Captures Claude conversations as they grow and appends them to per-project
//! Markdown files.
//!
//! ## How it works
//!
//! Two processes cooperate:
//!
//! - `claude-autosave serve` owns the files. It exposes a small JSON API on
//!   `127.0.0.1:3737` and appends whatever it receives to
//!   `<base>/Projects/<folder>/<chat>.md`, creating the file with a YAML
//!   frontmatter header on first use.
//! - `claude-autosave watch` polls a text snapshot of the open conversation
//!   (written by any browser-side exporter) and sends only the part that is
//!   new since the last save.
//!
//! ## Incremental capture
//!
//! For every chat the watcher remembers a *fingerprint* (the first 1000 chars
//! of the actual conversation) and a *tail* (the last 1000 chars it saved).
//! On each poll the fingerprint tells whether this is still the same
//! conversation; the tail tells where the new text begins. When the tail is
//! gone (the view was trimmed or reflowed) it resumes from the last message
//! boundary in the final 10000 chars. A chat whose fingerprint no longer
//! matches is captured in full again.
//!
//! The maps are kept in a JSON file under the user data dir, so a restart
//! picks up where it left off.
//!
//! ## Usage
//!
//! ```sh
//! # Terminal 1: the append server
//! claude-autosave serve --base-dir ~/Documents/Claude_Conversations
//!
//! # Terminal 2: watch a snapshot file, saving into the "Work" folder
//! claude-autosave watch --snapshot /tmp/claude-chat.txt --folder Work
//!
//! # Inspect or edit the remembered chat -> folder mappings
//! claude-autosave status
//! claude-autosave set-folder "Async traits" Rust
//! ```
//!
//! Defaults can be kept in `~/.config/claude-autosave/config.toml`.
pub mod capture;
pub mod client;
pub mod error;
pub mod folder;
pub mod renderer;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod source;
pub mod state;
pub mod store;
pub mod types;
pub mod utils;
