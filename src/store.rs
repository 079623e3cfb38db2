use crate::renderer;
use crate::types::{
    AppendResponse, ChatFileStats, ProjectStats, ProjectSummary, SearchHit, SizeError,
    SizeLimits, SizeReport, SizeWarning,
};
use crate::utils::{count_words, parse_existing_frontmatter};
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use eyre::{Context, Result, eyre};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_PROJECT: &str = "General";
pub const UNTITLED_CHAT: &str = "Untitled";

pub const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub const FILE_SIZE_WARNING: u64 = 900_000;
pub const FILE_SIZE_LIMIT: u64 = 1_048_576;

const MAX_SEARCH_LINES: usize = 5;
const MAX_SLUG_LEN: usize = 60;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub chat_name: String,
    pub started: Instant,
}

struct CachedFile {
    path: PathBuf,
    last_access: Instant,
}

#[derive(Default)]
struct Caches {
    chat_files: HashMap<String, CachedFile>,
    sessions: HashMap<String, SessionInfo>,
}

/// Append-only Markdown files under `<base>/Projects/<project>/`.
pub struct ChatStore {
    base_dir: PathBuf,
    caches: Mutex<Caches>,
    /// Held while a filename is allocated and its header written.
    creating: Mutex<()>,
}

impl ChatStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let store = Self {
            base_dir,
            caches: Mutex::new(Caches::default()),
            creating: Mutex::new(()),
        };
        fs::create_dir_all(store.project_dir(DEFAULT_PROJECT)?)
            .wrap_err("Failed to create projects dir")?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.base_dir.join("Projects")
    }

    /// Directory of `project`, which must be a single plain path component.
    pub fn project_dir(&self, project: &str) -> Result<PathBuf> {
        validate_project_name(project)?;
        Ok(self.projects_dir().join(project))
    }

    fn caches(&self) -> std::sync::MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn register_session(&self, session_id: &str, chat_name: &str) {
        self.caches().sessions.insert(
            session_id.to_string(),
            SessionInfo {
                chat_name: chat_name.to_string(),
                started: Instant::now(),
            },
        );
    }

    pub fn active_sessions(&self) -> usize {
        self.caches().sessions.len()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.caches().sessions.get(session_id).cloned()
    }

    /// Drop file-path cache entries idle longer than [`CACHE_MAX_AGE`] and
    /// sessions older than [`SESSION_MAX_AGE`]. Returns how many were removed.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut caches = self.caches();
        let before = caches.chat_files.len() + caches.sessions.len();
        caches
            .chat_files
            .retain(|_, f| now.saturating_duration_since(f.last_access) <= CACHE_MAX_AGE);
        caches
            .sessions
            .retain(|_, s| now.saturating_duration_since(s.started) <= SESSION_MAX_AGE);
        let cleaned = before - (caches.chat_files.len() + caches.sessions.len());
        if cleaned > 0 {
            info!(cleaned, "evicted stale cache entries");
        }
        cleaned
    }

    // ── Chat files ───────────────────────────────────────────────────────────

    /// Path of the file holding `chat` in `project`, creating it with a
    /// header when the chat has no file yet.
    pub fn chat_file(&self, project: &str, chat: &str) -> Result<PathBuf> {
        let key = format!("{project}:{chat}");
        {
            let mut caches = self.caches();
            if let Some(cached) = caches.chat_files.get_mut(&key) {
                cached.last_access = Instant::now();
                if cached.path.exists() {
                    return Ok(cached.path.clone());
                }
            }
        }

        let project_dir = self.project_dir(project)?;
        if !project_dir.exists() {
            info!(project, "creating project folder");
        }
        fs::create_dir_all(&project_dir)
            .wrap_err_with(|| format!("Failed to create project dir: {}", project_dir.display()))?;

        let _creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        let stem = allocate_filename(chat, &project_dir);
        let path = project_dir.join(format!("{stem}.md"));
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => {
                let mut writer = BufWriter::new(file);
                renderer::write_chat_header(&mut writer, chat, project, Utc::now())?;
                writer.flush()?;
                info!(project, file = %path.display(), "created chat file");
            }
            // Another append created it first; its header stands.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(file = %path.display(), "using existing chat file");
            }
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("Failed to create: {}", path.display()));
            }
        }

        self.caches().chat_files.insert(
            key,
            CachedFile {
                path: path.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(path)
    }

    /// Append `content` verbatim to the chat's file.
    pub fn append(&self, project: &str, chat: Option<&str>, content: &str) -> Result<AppendResponse> {
        if content.trim().is_empty() {
            return Ok(AppendResponse {
                success: true,
                message: Some("No content to save".into()),
                ..AppendResponse::default()
            });
        }

        let chat = chat.filter(|c| !c.trim().is_empty()).unwrap_or(UNTITLED_CHAT);
        let path = self.chat_file(project, chat)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("Failed to open: {}", path.display()))?;
        file.write_all(content.as_bytes())
            .wrap_err_with(|| format!("Failed to append: {}", path.display()))?;

        let total_words = self.project_word_count(project)?;
        let content_length = content.chars().count();
        info!(
            file = %path.file_name().unwrap_or_default().to_string_lossy(),
            chars = content_length,
            "appended"
        );

        Ok(AppendResponse {
            success: true,
            message: None,
            saved_to: Some(path.to_string_lossy().into_owned()),
            content_length,
            total_words,
        })
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    pub fn project_word_count(&self, project: &str) -> Result<usize> {
        let dir = self.project_dir(project)?;
        Ok(markdown_files(&dir)
            .iter()
            .filter_map(|p| fs::read_to_string(p).ok())
            .map(|c| count_words(&c))
            .sum())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let mut projects = Vec::new();
        for (name, dir) in self.project_dirs()? {
            let modified = fs::metadata(&dir)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let files = markdown_files(&dir);
            let words = files
                .iter()
                .filter_map(|p| fs::read_to_string(p).ok())
                .map(|c| count_words(&c))
                .sum();
            projects.push(ProjectSummary {
                name,
                words,
                chats: files.len(),
                files: files.len(),
                modified,
            });
        }
        Ok(projects)
    }

    /// `Ok(None)` when the project does not exist.
    pub fn project_stats(&self, project: &str) -> Result<Option<ProjectStats>> {
        let dir = self.project_dir(project)?;
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut chats = Vec::new();
        for path in markdown_files(&dir) {
            let content = fs::read_to_string(&path)
                .wrap_err_with(|| format!("Failed to read: {}", path.display()))?;
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            chats.push(ChatFileStats {
                file: file_name(&path),
                words: count_words(&content),
                chars: content.chars().count(),
                modified,
            });
        }
        chats.sort_by(|a, b| b.modified.cmp(&a.modified));

        let total_words = chats.iter().map(|c| c.words).sum();
        let total_chars = chats.iter().map(|c| c.chars).sum();
        let chat_count = chats.len();
        Ok(Some(ProjectStats {
            project: project.to_string(),
            total_words,
            total_chars,
            chat_count,
            average_words_per_chat: if chat_count == 0 {
                0
            } else {
                (total_words as f64 / chat_count as f64).round() as usize
            },
            chats,
        }))
    }

    /// Case-insensitive search over every chat file. Files are scanned by a
    /// pool of worker threads fed through a bounded channel.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for (project, dir) in self.project_dirs()? {
            for path in markdown_files(&dir) {
                jobs.push((project.clone(), path));
            }
        }

        let (tx, rx) = bounded::<(String, PathBuf)>(64);
        let hits = Mutex::new(Vec::new());
        let n_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(jobs.len().max(1));

        std::thread::scope(|s| {
            for _ in 0..n_workers {
                let rx = rx.clone();
                let (needle, hits) = (&needle, &hits);
                s.spawn(move || {
                    while let Ok((project, path)) = rx.recv() {
                        let content = match fs::read_to_string(&path) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(file = %path.display(), error = %e, "search skipped file");
                                continue;
                            }
                        };
                        if let Some(hit) = search_file(&project, &path, &content, needle) {
                            hits.lock().unwrap_or_else(|e| e.into_inner()).push(hit);
                        }
                    }
                });
            }
            drop(rx);

            for job in jobs {
                if tx.send(job).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        let mut hits = hits.into_inner().unwrap_or_else(|e| e.into_inner());
        hits.sort_by(|a, b| (&a.project, &a.file).cmp(&(&b.project, &b.file)));
        Ok(hits)
    }

    pub fn check_sizes(&self) -> Result<SizeReport> {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for (project, dir) in self.project_dirs()? {
            for path in markdown_files(&dir) {
                let size = fs::metadata(&path)
                    .wrap_err_with(|| format!("Failed to stat: {}", path.display()))?
                    .len();
                if size > FILE_SIZE_LIMIT {
                    errors.push(SizeError {
                        project: project.clone(),
                        file: file_name(&path),
                        size,
                        over_by: size - FILE_SIZE_LIMIT,
                    });
                } else if size > FILE_SIZE_WARNING {
                    warnings.push(SizeWarning {
                        project: project.clone(),
                        file: file_name(&path),
                        size,
                        percent_of_limit: (size as f64 / FILE_SIZE_LIMIT as f64 * 100.0).round() as u64,
                    });
                }
            }
        }
        Ok(SizeReport {
            warnings,
            errors,
            limits: SizeLimits {
                warning: FILE_SIZE_WARNING,
                limit: FILE_SIZE_LIMIT,
            },
        })
    }

    fn project_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.projects_dir();
        let mut dirs: Vec<(String, PathBuf)> = fs::read_dir(&dir)
            .wrap_err_with(|| format!("Failed to read: {}", dir.display()))?
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

pub fn validate_project_name(project: &str) -> Result<()> {
    let trimmed = project.trim();
    let mut components = Path::new(trimmed).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    );
    if trimmed.is_empty() || trimmed != project || !single_normal || project.contains(['/', '\\']) {
        return Err(eyre!("Invalid project name: {:?}", project));
    }
    Ok(())
}

fn search_file(project: &str, path: &Path, content: &str, needle: &str) -> Option<SearchHit> {
    if !content.to_lowercase().contains(needle) {
        return None;
    }
    let matches: Vec<&str> = content
        .lines()
        .filter(|line| line.to_lowercase().contains(needle))
        .collect();
    Some(SearchHit {
        project: project.to_string(),
        file: file_name(path),
        total_matches: matches.len(),
        matches: matches
            .into_iter()
            .take(MAX_SEARCH_LINES)
            .map(str::to_string)
            .collect(),
    })
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// Allocate a filename stem for `chat` inside `project_dir`.
// Candidates are the slug, then the slug with -2, -3, ... appended:
//   - File absent  → claim it (the caller creates it immediately after)
//   - File present and owned by this chat (or carrying no frontmatter) → reuse it
//   - File present and owned by another chat → try the next candidate
fn allocate_filename(chat: &str, project_dir: &Path) -> String {
    let raw_slug = slug::slugify(chat);
    let slug = raw_slug[..raw_slug.len().min(MAX_SLUG_LEN)].trim_end_matches('-');
    let base = if slug.is_empty() { "untitled" } else { slug };

    let mut n = 1usize;
    loop {
        let stem = if n == 1 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        };
        let path = project_dir.join(format!("{stem}.md"));
        match path.try_exists() {
            Ok(false) | Err(_) => return stem,
            Ok(true) => match parse_existing_frontmatter(&path) {
                None => return stem,
                Some(fm) if fm.chat.as_deref().is_none_or(|c| c == chat) => return stem,
                // Taken by another chat, try the next suffix
                Some(_) => {}
            },
        }
        n += 1;
    }
}
