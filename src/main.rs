use claude_autosave::server::{self, DEFAULT_PORT};
use claude_autosave::session::{self, POLL_INTERVAL};
use claude_autosave::state::{CaptureState, JsonFileStore};
use claude_autosave::store::validate_project_name;
use claude_autosave::utils::{ServeConfig, WatchConfig};
use clap::{Parser, Subcommand};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Save Claude conversations to per-project Markdown files as they grow.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/claude-autosave/config.toml
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log every capture decision.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the append server that owns the Markdown files.
    Serve {
        /// Root directory for saved conversations.
        /// Defaults to ~/Documents/Claude_Conversations if not set in config.
        #[arg(long, value_name = "DIR")]
        base_dir: Option<PathBuf>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Poll a conversation snapshot and send new content to the server.
    Watch {
        /// Text file holding the current conversation, optionally starting
        /// with a `Title: ...` line.
        #[arg(long, value_name = "PATH")]
        snapshot: PathBuf,

        /// Chat title to use instead of the one in the snapshot.
        #[arg(long)]
        title: Option<String>,

        /// Save new chats into this folder instead of asking.
        #[arg(long)]
        folder: Option<String>,

        /// Server URL, e.g. http://localhost:3737
        #[arg(long, value_name = "URL")]
        server: Option<String>,

        /// State file with fingerprints and folder mappings.
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,
    },

    /// Show remembered chats and their folders.
    Status {
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,
    },

    /// Map a chat to a folder.
    SetFolder {
        chat: String,
        folder: String,

        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,
    },

    /// Forget all folder mappings and fingerprints.
    Reset {
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,
    },
}

#[derive(Deserialize, Default)]
struct FileConfig {
    base_dir: Option<PathBuf>,
    port: Option<u16>,
    server_url: Option<String>,
    state_path: Option<PathBuf>,
    default_folder: Option<String>,
    poll_interval_ms: Option<u64>,
}

fn default_base_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Claude_Conversations")
}

fn default_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("claude-autosave/state.json"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("claude-autosave/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let fallback = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_state(cli_path: Option<PathBuf>, file_cfg: &mut FileConfig) -> Result<CaptureState> {
    let path = cli_path
        .or(file_cfg.state_path.take())
        .or_else(default_state_path)
        .ok_or_else(|| eyre!("Could not determine state path.\nUse --state to specify it."))?;
    Ok(CaptureState::load(Box::new(JsonFileStore::open(path)?)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let mut file_cfg = load_file_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { base_dir, port } => {
            let config = ServeConfig {
                base_dir: base_dir
                    .or(file_cfg.base_dir)
                    .unwrap_or_else(default_base_dir),
                port: port.or(file_cfg.port).unwrap_or(DEFAULT_PORT),
            };
            server::serve(config).await
        }

        Command::Watch {
            snapshot,
            title,
            folder,
            server,
            state,
        } => {
            let state_path = state
                .or(file_cfg.state_path)
                .or_else(default_state_path)
                .ok_or_else(|| eyre!("Could not determine state path.\nUse --state to specify it."))?;
            let default_folder = folder.or(file_cfg.default_folder);
            if let Some(folder) = &default_folder {
                validate_project_name(folder)?;
            }
            let config = WatchConfig {
                server_url: server
                    .or(file_cfg.server_url)
                    .unwrap_or_else(|| format!("http://localhost:{DEFAULT_PORT}")),
                state_path,
                snapshot_path: snapshot,
                title,
                default_folder,
                poll_interval: file_cfg
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(POLL_INTERVAL),
            };
            session::run_session(config).await
        }

        Command::Status { state } => {
            let state = open_state(state, &mut file_cfg)?;
            println!(
                "{} chats mapped, {} fingerprints",
                state.tracked_chats(),
                state.fingerprint_count()
            );
            for (chat, folder) in state.folders() {
                println!("  {chat} -> {folder}");
            }
            Ok(())
        }

        Command::SetFolder {
            chat,
            folder,
            state,
        } => {
            validate_project_name(&folder)?;
            let mut state = open_state(state, &mut file_cfg)?;
            state.set_folder(&chat, &folder);
            state.save()?;
            println!("{chat} -> {folder}");
            Ok(())
        }

        Command::Reset { state } => {
            let mut state = open_state(state, &mut file_cfg)?;
            let cleared = state.tracked_chats();
            state.reset_mappings()?;
            println!("Cleared {cleared} mappings.");
            Ok(())
        }
    }
}
