//! Configuration management for chatscrape using the prefer crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planner::PlannerSettings;
use crate::scrape::ScrapeSettings;
use crate::work_queue::{parse_test_jobs, JobPayload, PollSettings, WorkQueueError};

/// Default queue database filename.
const DEFAULT_QUEUE_FILENAME: &str = "chatscrape-queue.db";

/// Default store database filename.
const DEFAULT_STORE_FILENAME: &str = "chatscrape.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid TEST_JOBS: {0}")]
    TestJobs(#[from] WorkQueueError),

    #[error("Invalid setting '{key}': {message}")]
    Invalid { key: &'static str, message: String },
}

/// Where a queue or store keeps its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    /// Process-local; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_poll_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_empty_polls: Option<u32>,
    /// Receives after which an unsettled message is dead-lettered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_receive_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_bound: Option<u32>,
    /// `[start, end)` listing sizes at which channels without replies are given up on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_comments_range: Option<[usize; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_margin_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_stat_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_flag_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_comments: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repush_after_hours: Option<u64>,
    /// Message ids whose service bubbles are tolerated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_allow_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_message_ids: Vec<String>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_backend: BackendKind,
    pub queue_path: PathBuf,
    pub visibility_timeout: Duration,
    pub poll: PollSettings,
    pub max_receive_count: u32,
    pub store_backend: BackendKind,
    pub store_path: PathBuf,
    pub browser_url: String,
    pub scrape: ScrapeSettings,
    /// Anonymous memory above which sessions stop early.
    pub memory_limit_bytes: u64,
    pub memory_stat_path: PathBuf,
    pub stop_flag_path: PathBuf,
    pub planner: PlannerSettings,
    pub service_allow_list: Vec<String>,
    /// Jobs to replay instead of reading the queue.
    pub test_jobs: Option<Vec<JobPayload>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_backend: BackendKind::Sqlite,
            queue_path: PathBuf::from(DEFAULT_QUEUE_FILENAME),
            visibility_timeout: Duration::from_secs(12 * 60 * 60),
            poll: PollSettings::default(),
            max_receive_count: 5,
            store_backend: BackendKind::Sqlite,
            store_path: PathBuf::from(DEFAULT_STORE_FILENAME),
            browser_url: "http://127.0.0.1:9222".to_string(),
            scrape: ScrapeSettings::default(),
            memory_limit_bytes: 4_000_000_000,
            memory_stat_path: PathBuf::from("/sys/fs/cgroup/memory.stat"),
            stop_flag_path: PathBuf::from("/tmp/chatscrape-stop-after-job"),
            planner: PlannerSettings::default(),
            service_allow_list: Vec::new(),
            test_jobs: None,
        }
    }
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers chatscrape config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("chatscrape").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}; using defaults", e);
                    Self::default_with_env()
                }),
                None => Self::default_with_env(),
            },
            // No config file found
            Err(_) => Self::default_with_env(),
        }
    }

    /// Defaults. Environment overrides are applied to [`Settings`].
    pub fn default_with_env() -> Self {
        Self::default()
    }

    /// Load configuration from a specific file path, parsed by extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::parse(path, &contents)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parsed = match ext {
            "toml" => toml::from_str(contents).map_err(|e| e.to_string()),
            _ => serde_json::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// The config file's directory, for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved against `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) -> Result<(), ConfigError> {
        let queue = &self.queue;
        if let Some(backend) = queue.backend {
            settings.queue_backend = backend;
        }
        if let Some(ref path) = queue.path {
            settings.queue_path = self.resolve_path(path, base_dir);
        }
        if let Some(secs) = queue.visibility_timeout_secs {
            settings.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = queue.empty_poll_delay_secs {
            settings.poll.empty_poll_delay = Duration::from_secs(secs);
        }
        if let Some(polls) = queue.max_empty_polls {
            settings.poll.max_empty_polls = polls;
        }
        if let Some(count) = queue.max_receive_count {
            settings.max_receive_count = count;
        }

        if let Some(backend) = self.store.backend {
            settings.store_backend = backend;
        }
        if let Some(ref path) = self.store.path {
            settings.store_path = self.resolve_path(path, base_dir);
        }

        let surface = &self.surface;
        if let Some(ref url) = surface.browser_url {
            settings.browser_url = url.clone();
        }
        if let Some(ref url) = surface.base_url {
            settings.scrape.base_url = url.clone();
        }
        if let Some(ms) = surface.scroll_delay_ms {
            settings.scrape.scroll_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = surface.poll_interval_ms {
            settings.scrape.poll_interval = Duration::from_millis(ms);
            settings.scrape.loading.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = surface.navigation_timeout_secs {
            settings.scrape.navigation_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = surface.settle_delay_ms {
            settings.scrape.settle_delay = Duration::from_millis(ms);
        }

        let scrape = &self.scrape;
        if let Some(bound) = scrape.staleness_bound {
            settings.scrape.staleness_bound = bound;
        }
        if let Some([start, end]) = scrape.no_comments_range {
            if start > end {
                return Err(ConfigError::Invalid {
                    key: "scrape.no_comments_range",
                    message: format!("start {} is after end {}", start, end),
                });
            }
            settings.scrape.no_comments_range = start..end;
        }
        if let Some(secs) = scrape.lease_margin_secs {
            settings.scrape.lease_margin = Duration::from_secs(secs);
        }
        if let Some(attempts) = scrape.anchor_max_attempts {
            settings.scrape.anchor_max_attempts = attempts;
        }
        if let Some(limit) = scrape.memory_limit_bytes {
            settings.memory_limit_bytes = limit;
        }
        if let Some(ref path) = scrape.memory_stat_path {
            settings.memory_stat_path = self.resolve_path(path, base_dir);
        }
        if !scrape.skip_targets.is_empty() {
            settings.scrape.skip_targets = scrape.skip_targets.clone();
        }
        if let Some(ref path) = scrape.stop_flag_path {
            settings.stop_flag_path = self.resolve_path(path, base_dir);
        }

        let planner = &self.planner;
        if let Some(min) = planner.min_comments {
            settings.planner.min_comments = min;
        }
        if let Some(hours) = planner.repush_after_hours {
            let hours = i64::try_from(hours).map_err(|e| ConfigError::Invalid {
                key: "planner.repush_after_hours",
                message: e.to_string(),
            })?;
            settings.planner.repush_after = Some(chrono::Duration::hours(hours));
        }
        if !planner.ignored_message_ids.is_empty() {
            settings.planner.ignored_message_ids = planner.ignored_message_ids.clone();
        }
        if !planner.service_allow_list.is_empty() {
            settings.service_allow_list = planner.service_allow_list.clone();
        }

        if settings.visibility_timeout <= settings.scrape.lease_margin {
            tracing::warn!(
                "Lease margin {:?} is not below the visibility timeout {:?}; jobs will be deleted right away",
                settings.scrape.lease_margin,
                settings.visibility_timeout
            );
        }
        Ok(())
    }
}

/// Apply environment overrides. `var` looks up one variable.
pub fn apply_env_overrides<F>(settings: &mut Settings, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| var(name).filter(|s| !s.is_empty());

    if let Some(jobs) = var("TEST_JOBS") {
        settings.test_jobs = Some(parse_test_jobs(&jobs)?);
    }
    if let Some(path) = var("CHATSCRAPE_QUEUE_PATH") {
        tracing::debug!("Using CHATSCRAPE_QUEUE_PATH from environment: {}", path);
        settings.queue_path = PathBuf::from(shellexpand::tilde(&path).as_ref());
    }
    if let Some(path) = var("CHATSCRAPE_STORE_PATH") {
        tracing::debug!("Using CHATSCRAPE_STORE_PATH from environment: {}", path);
        settings.store_path = PathBuf::from(shellexpand::tilde(&path).as_ref());
    }
    if let Some(url) = var("CHATSCRAPE_BROWSER_URL") {
        tracing::debug!("Using CHATSCRAPE_BROWSER_URL from environment: {}", url);
        settings.browser_url = url;
    }
    Ok(())
}

/// Load settings from an explicit config file, or a discovered one, then
/// apply environment overrides.
pub async fn load_settings(config_path: Option<&Path>) -> Result<(Settings, Config), ConfigError> {
    let config = match config_path {
        Some(path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut settings = Settings::default();
    settings.queue_path = base_dir.join(DEFAULT_QUEUE_FILENAME);
    settings.store_path = base_dir.join(DEFAULT_STORE_FILENAME);
    config.apply_to_settings(&mut settings, &base_dir)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;

    Ok((settings, config))
}
