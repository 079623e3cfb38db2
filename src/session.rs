//! The polling side: one [`CaptureSession`] per watched conversation view.
//!
//! Each tick reads the current chat and its text from a [`SnapshotSource`],
//! asks the [`CaptureEngine`] what is new, and sends that to a [`ChatSink`].
//! State only advances when content is delivered (or there was nothing to
//! deliver), so a throttled or failed save is recomputed on a later tick.
use crate::capture::{CaptureEngine, CaptureKind};
use crate::client::{ChatSink, HttpChatSink};
use crate::folder::{FixedFolder, FolderResolver, PromptFolder};
use crate::renderer::capture_separator;
use crate::scheduler::RepeatingTask;
use crate::source::{FileSnapshotSource, SnapshotSource};
use crate::state::{CaptureState, JsonFileStore};
use crate::store::{DEFAULT_PROJECT, UNTITLED_CHAT, validate_project_name};
use crate::types::{AppendRequest, ContinueRequest};
use crate::utils::{WatchConfig, char_len, count_messages, count_words};
use chrono::Local;
use eyre::{Result, eyre};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const MIN_SAVE_INTERVAL: Duration = Duration::from_millis(2000);
pub const OFFLINE_RETRY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    /// Minimum gap between two incremental saves. Full captures ignore it.
    pub min_save_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            min_save_interval: MIN_SAVE_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    ServerOffline,
    ConnectionError,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionStats {
    pub words: usize,
    pub messages: usize,
    pub saves: usize,
    pub duplicates_prevented: usize,
    pub chats_tracked: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Delivered,
    /// The decision produced nothing to append.
    NothingNew,
    TooSmall,
    Throttled,
    Failed,
    /// No folder is known for the chat.
    Unmapped,
    /// `start` has not succeeded yet.
    Inactive,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub chat: Option<String>,
    pub folder: Option<String>,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub mappings: Vec<(String, String)>,
}

pub struct CaptureSession {
    session_id: String,
    engine: CaptureEngine,
    state: CaptureState,
    source: Box<dyn SnapshotSource>,
    resolver: Arc<std::sync::Mutex<Box<dyn FolderResolver>>>,
    sink: Arc<dyn ChatSink>,
    settings: SessionSettings,
    shutdown: CancellationToken,

    current_chat: String,
    current_folder: Option<String>,
    /// Text of the current chat as of the last absorbed capture.
    absorbed: String,
    /// Text the growth gate measures against. Ahead of `absorbed` while a
    /// small change is held back.
    last_seen: String,
    /// The next delivered capture starts with a separator banner.
    pending_banner: bool,
    last_save: Option<Instant>,
    active: bool,
    status: SessionStatus,
    stats: SessionStats,
}

impl CaptureSession {
    pub fn new(
        engine: CaptureEngine,
        state: CaptureState,
        source: Box<dyn SnapshotSource>,
        resolver: Box<dyn FolderResolver>,
        sink: Arc<dyn ChatSink>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            session_id: format!("watch_{}", Uuid::new_v4().simple()),
            engine,
            state,
            source,
            resolver: Arc::new(std::sync::Mutex::new(resolver)),
            sink,
            settings,
            shutdown: CancellationToken::new(),
            current_chat: String::new(),
            current_folder: None,
            absorbed: String::new(),
            last_seen: String::new(),
            pending_banner: false,
            last_save: None,
            active: false,
            status: SessionStatus::Starting,
            stats: SessionStats::default(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Cancelling it abandons a pending folder prompt.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check the server and register this session with it.
    pub async fn start(&mut self) -> Result<()> {
        if let Err(e) = self.sink.health().await {
            self.status = SessionStatus::ServerOffline;
            return Err(e.wrap_err("save server not reachable"));
        }

        let chat = self.source.chat_id();
        let project = self
            .state
            .folder(&chat)
            .unwrap_or(DEFAULT_PROJECT)
            .to_string();
        let request = ContinueRequest {
            session_id: self.session_id.clone(),
            project,
            chat_name: if chat.is_empty() {
                UNTITLED_CHAT.to_string()
            } else {
                chat
            },
        };
        match self.sink.start_session(&request).await {
            Ok(response) => {
                self.active = true;
                self.status = SessionStatus::Active;
                info!(
                    session = %self.session_id,
                    project = %response.project,
                    total_words = response.total_words,
                    "capture session started"
                );
                Ok(())
            }
            Err(e) => {
                self.status = SessionStatus::ServerOffline;
                Err(e.wrap_err("failed to start session"))
            }
        }
    }

    /// One polling step.
    pub async fn tick(&mut self) -> Result<SaveOutcome> {
        let chat = self.source.chat_id();
        if chat.is_empty() {
            return Ok(SaveOutcome::NothingNew);
        }
        let text = self.source.current_text();

        let switched = chat != self.current_chat;
        if switched {
            self.switch_chat(&chat).await;
        }

        let grown = text != self.last_seen
            && char_len(&text) > char_len(&self.last_seen) + self.engine.settings().min_change_chars;
        if !switched && !grown {
            return Ok(SaveOutcome::NothingNew);
        }
        self.capture(&chat, &text).await
    }

    /// Capture the current chat now, whether or not it grew.
    pub async fn save_now(&mut self) -> Result<SaveOutcome> {
        let chat = self.source.chat_id();
        if chat.is_empty() {
            return Ok(SaveOutcome::NothingNew);
        }
        if chat != self.current_chat {
            self.switch_chat(&chat).await;
        }
        let text = self.source.current_text();
        self.capture(&chat, &text).await
    }

    /// Point the current chat at another folder.
    pub fn change_folder(&mut self, folder: &str) -> Result<()> {
        if self.current_chat.is_empty() {
            return Err(eyre!("No active chat"));
        }
        validate_project_name(folder)?;
        self.state.set_folder(&self.current_chat, folder);
        self.state.save()?;
        self.current_folder = Some(folder.to_string());
        info!(chat = %self.current_chat, folder, "folder changed");
        Ok(())
    }

    pub fn reset_mappings(&mut self) -> Result<()> {
        self.state.reset_mappings()?;
        info!("all mappings cleared");
        Ok(())
    }

    pub fn persist(&mut self) -> Result<()> {
        if !self.current_chat.is_empty() && !self.absorbed.is_empty() {
            self.engine
                .update_fingerprint(&self.absorbed, &self.current_chat, &mut self.state);
        }
        self.state.save()
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            chat: Some(self.current_chat.clone()).filter(|c| !c.is_empty()),
            folder: self.current_folder.clone(),
            status: self.status,
            stats: self.stats.clone(),
            mappings: self
                .state
                .folders()
                .map(|(c, f)| (c.to_string(), f.to_string()))
                .collect(),
        }
    }

    async fn switch_chat(&mut self, chat: &str) {
        info!(chat, "switched chat");
        if !self.current_chat.is_empty() && !self.absorbed.is_empty() {
            self.engine
                .update_fingerprint(&self.absorbed, &self.current_chat, &mut self.state);
        }
        self.current_chat = chat.to_string();
        self.absorbed.clear();
        self.last_seen.clear();
        self.pending_banner = true;

        self.current_folder = match self.state.folder(chat) {
            Some(folder) => Some(folder.to_string()),
            None => self.resolve_folder(chat).await,
        };
        match &self.current_folder {
            Some(folder) => debug!(chat, folder = %folder, "using folder"),
            None => warn!(chat, "no folder chosen, chat will not be saved"),
        }
    }

    async fn resolve_folder(&mut self, chat: &str) -> Option<String> {
        let existing = match self.sink.list_folders().await {
            Ok(folders) => folders,
            Err(e) => {
                debug!(error = %e, "could not fetch folders");
                Vec::new()
            }
        };

        // A plain thread: a prompt stuck on stdin must not hold up runtime
        // shutdown the way a blocking-pool task would.
        let (tx, rx) = oneshot::channel();
        let resolver = Arc::clone(&self.resolver);
        let chat_id = chat.to_string();
        std::thread::spawn(move || {
            let mut resolver = resolver.lock().unwrap_or_else(|e| e.into_inner());
            let _ = tx.send(resolver.resolve(&chat_id, &existing));
        });
        let answer = tokio::select! {
            answer = rx => answer.ok().flatten(),
            _ = self.shutdown.cancelled() => {
                debug!(chat, "folder prompt abandoned");
                None
            }
        };

        let folder = answer?;
        if let Err(e) = validate_project_name(&folder) {
            warn!(chat, "{e}");
            return None;
        }
        self.state.set_folder(chat, &folder);
        if let Err(e) = self.state.save() {
            warn!("failed to persist folder mapping: {e:#}");
        }
        info!(chat, folder = %folder, "mapped chat");
        Some(folder)
    }

    async fn capture(&mut self, chat: &str, text: &str) -> Result<SaveOutcome> {
        let Some(folder) = self.current_folder.clone() else {
            return Ok(SaveOutcome::Unmapped);
        };
        if !self.active {
            return Ok(SaveOutcome::Inactive);
        }

        let decision = self.engine.decide(text, chat, &self.state);
        if decision.kind == CaptureKind::Duplicate {
            self.stats.duplicates_prevented += 1;
        }
        if decision.is_empty() {
            self.pending_banner = false;
            if decision.withheld == 0 {
                debug!(chat, "no new content");
                self.absorb(chat, text);
            } else {
                // The tail stays put so the held-back text goes out with the
                // next larger change.
                debug!(chat, withheld = decision.withheld, "change too small, holding back");
                self.last_seen = text.to_string();
            }
            return Ok(SaveOutcome::NothingNew);
        }

        let content = if self.pending_banner {
            let banner = capture_separator(decision.is_new, chat, &folder, Local::now());
            format!("{banner}{}", decision.content)
        } else {
            decision.content
        };

        let outcome = self
            .save(&content, chat, &folder, decision.is_new, text)
            .await;
        if outcome == SaveOutcome::Delivered {
            if decision.kind == CaptureKind::FirstSeen {
                self.stats.chats_tracked += 1;
            }
            self.pending_banner = false;
            self.absorb(chat, text);
        }
        Ok(outcome)
    }

    async fn save(
        &mut self,
        content: &str,
        chat: &str,
        folder: &str,
        is_full_capture: bool,
        snapshot: &str,
    ) -> SaveOutcome {
        if char_len(content) < self.engine.settings().min_change_chars {
            return SaveOutcome::TooSmall;
        }
        let now = Instant::now();
        if !is_full_capture
            && self
                .last_save
                .is_some_and(|t| now.duration_since(t) < self.settings.min_save_interval)
        {
            return SaveOutcome::Throttled;
        }

        let request = AppendRequest {
            session_id: Some(self.session_id.clone()),
            project: folder.to_string(),
            chat_name: Some(chat.to_string()),
            new_content: content.to_string(),
        };
        match self.sink.append(&request).await {
            Ok(_) => {
                self.last_save = Some(now);
                self.stats.saves += 1;
                self.stats.words = count_words(snapshot);
                self.stats.messages = count_messages(snapshot);
                self.status = SessionStatus::Active;
                info!(
                    chat,
                    folder,
                    chars = char_len(content),
                    "{}",
                    if is_full_capture { "full capture" } else { "incremental" }
                );
                SaveOutcome::Delivered
            }
            Err(e) => {
                self.status = SessionStatus::ConnectionError;
                warn!("save failed: {e:#}");
                SaveOutcome::Failed
            }
        }
    }

    fn absorb(&mut self, chat: &str, text: &str) {
        self.engine.update_fingerprint(text, chat, &mut self.state);
        if let Err(e) = self.state.save() {
            warn!("failed to persist capture state: {e:#}");
        }
        self.absorbed = text.to_string();
        self.last_seen = text.to_string();
    }
}

/// Build a session from `config` with the file-backed source and state, and
/// run it until Ctrl-C.
pub async fn run_session(config: WatchConfig) -> Result<()> {
    let store = JsonFileStore::open(&config.state_path)?;
    info!(state = %store.path().display(), "loaded capture state");
    let state = CaptureState::load(Box::new(store));
    let source = FileSnapshotSource::new(&config.snapshot_path, config.title.clone());
    let resolver: Box<dyn FolderResolver> = match config.default_folder {
        Some(folder) => Box::new(FixedFolder(folder)),
        None => Box::new(PromptFolder::stdio()),
    };
    let sink = HttpChatSink::new(config.server_url.as_str())?;

    info!(
        snapshot = %config.snapshot_path.display(),
        server = %config.server_url,
        tracked = state.tracked_chats(),
        "watching"
    );
    let session = CaptureSession::new(
        CaptureEngine::default(),
        state,
        Box::new(source),
        resolver,
        Arc::new(sink),
        SessionSettings {
            poll_interval: config.poll_interval,
            ..SessionSettings::default()
        },
    );
    run(session).await
}

/// Start `session` (waiting for the server if needed), poll it until Ctrl-C,
/// then persist its state.
pub async fn run(mut session: CaptureSession) -> Result<()> {
    loop {
        match session.start().await {
            Ok(()) => break,
            Err(e) => {
                warn!("{e:#}; retrying in {}s", OFFLINE_RETRY.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(OFFLINE_RETRY) => {}
                    _ = tokio::signal::ctrl_c() => return session.persist(),
                }
            }
        }
    }

    let period = session.settings.poll_interval;
    let shutdown = session.shutdown_token();
    let session = Arc::new(Mutex::new(session));
    let ticking = session.clone();
    let mut task = RepeatingTask::start(period, move || {
        let session = ticking.clone();
        async move {
            if let Err(e) = session.lock().await.tick().await {
                warn!("capture tick failed: {e:#}");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("stopping capture");
    shutdown.cancel();
    task.stop().await?;

    let mut session = session.lock().await;
    session.persist()?;
    let report = session.report();
    info!(
        saves = report.stats.saves,
        duplicates_prevented = report.stats.duplicates_prevented,
        chats = report.mappings.len(),
        "capture stopped"
    );
    Ok(())
}
