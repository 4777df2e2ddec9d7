// Environment configuration for the launcher and the daemon
// Handles the stream server URL, state paths, and publisher tuning

use std::path::PathBuf;
use std::time::Duration;

use crate::cli_paths::resolve_daemon_path;

/// Stream server base URL; also the override passed to spawned daemons
pub const STREAM_URL_ENV: &str = "AGENT_DASH_STREAM_URL";
pub const STATE_DIR_ENV: &str = "AGENT_DASH_STATE_DIR";
pub const DAEMON_PATH_ENV: &str = "AGENT_DASH_DAEMON_PATH";
pub const BUFFER_SIZE_ENV: &str = "AGENT_DASH_BUFFER_SIZE";
pub const FLUSH_INTERVAL_ENV: &str = "AGENT_DASH_FLUSH_INTERVAL_MS";
pub const MAX_FLUSH_ATTEMPTS_ENV: &str = "AGENT_DASH_MAX_FLUSH_ATTEMPTS";

pub const DEFAULT_STREAM_URL: &str = "http://127.0.0.1:4437";

/// Tuning for [`crate::stream::StreamPublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Buffered events per destination before a synchronous flush; `<= 1` disables buffering
    pub buffer_size: usize,
    pub flush_interval: Duration,
    /// Consecutive failed flushes before a batch is dead-lettered; 0 retries forever
    pub max_flush_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            flush_interval: Duration::from_millis(1000),
            max_flush_attempts: 10,
        }
    }
}

impl PublisherConfig {
    pub fn buffering_enabled(&self) -> bool {
        self.buffer_size > 1
    }

    /// Unbuffered: every publish is appended immediately
    pub fn immediate() -> Self {
        Self {
            buffer_size: 1,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            buffer_size: env_number(BUFFER_SIZE_ENV).unwrap_or(defaults.buffer_size),
            flush_interval: env_number(FLUSH_INTERVAL_ENV)
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            max_flush_attempts: env_number(MAX_FLUSH_ATTEMPTS_ENV)
                .unwrap_or(defaults.max_flush_attempts),
        }
    }
}

/// Configuration for stream endpoints, state paths, and the daemon binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the durable stream server
    pub stream_url: String,
    /// Directory for daemon logs and dead-lettered events
    pub state_dir: PathBuf,
    /// Explicit daemon binary; resolved lazily when absent
    pub daemon_path: Option<PathBuf>,
    pub publisher: PublisherConfig,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            state_dir: Self::default_state_dir(),
            daemon_path: None,
            publisher: PublisherConfig::default(),
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default_paths();

        let stream_url = std::env::var(STREAM_URL_ENV)
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.stream_url);

        let state_dir = std::env::var(STATE_DIR_ENV)
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let daemon_path = std::env::var(DAEMON_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Self {
            stream_url,
            state_dir,
            daemon_path,
            publisher: PublisherConfig::from_env(),
        }
    }

    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".agent-dash"))
            .unwrap_or_else(|| PathBuf::from("/tmp/agent-dash"))
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn dead_letter_dir(&self) -> PathBuf {
        self.state_dir.join("dead-letter")
    }

    /// Log file for one daemon (the daemon has no inherited stdio)
    pub fn session_log_file(&self, session_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", sanitize_file_stem(session_id)))
    }

    pub fn dead_letter_file(&self, session_id: &str) -> PathBuf {
        self.dead_letter_dir()
            .join(format!("{}.jsonl", sanitize_file_stem(session_id)))
    }

    /// Daemon binary: explicit override first, then discovery
    pub fn daemon_path(&self) -> Option<PathBuf> {
        self.daemon_path.clone().or_else(resolve_daemon_path)
    }

    /// Ensure state, log, and dead-letter directories exist with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.state_dir.clone(), self.logs_dir(), self.dead_letter_dir()] {
            std::fs::create_dir_all(&dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable numeric setting");
            None
        }
    }
}

/// Session ids are opaque; keep them from escaping the state dir
fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
