// ABOUTME: Application configuration - engine, scheduler and source settings
// ABOUTME: Loaded from TOML with environment overrides; every field has a default

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`AppConfig::database_url`].
pub const ENV_DATABASE_URL: &str = "SHEET_SYNC_DATABASE_URL";
/// Environment variable overriding [`SheetsConfig::access_token`].
pub const ENV_ACCESS_TOKEN: &str = "SHEET_SYNC_ACCESS_TOKEN";

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sources with more data rows than this use the streaming strategy (default 10 000)
    pub chunk_threshold: u64,
    /// Upper bound on rows per chunked fetch (default 5 000)
    pub max_chunk_rows: usize,
    /// Pause between chunked fetches, to stay under upstream rate limits (default 500ms)
    pub chunk_delay_ms: u64,
    /// Age after which a running sync log row no longer blocks a new sync (default 10 min)
    pub lock_timeout_secs: u64,
    /// Streaming progress is written to the log row every this many rows (default 10 000)
    pub progress_interval_rows: u64,
    /// Data row sampled as the "middle" row by the streaming strategy (default 1 000)
    pub stream_middle_sample_offset: u64,
    /// Rows kept in a query job result preview (default 100)
    pub query_preview_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 10_000,
            max_chunk_rows: 5_000,
            chunk_delay_ms: 500,
            lock_timeout_secs: 600,
            progress_interval_rows: 10_000,
            stream_middle_sample_offset: 1_000,
            query_preview_rows: 100,
        }
    }
}

impl EngineConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Tunables of the job scheduler and the stuck-state reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard timeout for one job execution (default 10 min)
    pub job_timeout_secs: u64,
    /// Jobs running longer than this are reset to idle by the reaper (default 11 min).
    /// Keep it above `job_timeout_secs` so a run is timed out before it is reaped.
    pub job_stuck_timeout_secs: u64,
    /// Sync log rows running longer than this are marked as errors (default 30 min)
    pub log_stuck_timeout_secs: u64,
    /// Staging tables older than this are dropped (default 1 hour)
    pub staging_max_age_secs: u64,
    /// Sync log rows older than this are purged (default 24 hours)
    pub log_retention_secs: u64,
    /// Reaper pass interval (default 1 min)
    pub reaper_interval_secs: u64,
    /// Concurrent table syncs for a folder job (default 3)
    pub folder_concurrency: usize,
    /// Next-run offset for schedules without a recognised pattern (default 5 min)
    pub default_next_run_secs: u64,
    /// Offset from UTC of the timezone that time windows are written in (default +05:30)
    pub window_utc_offset_minutes: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 600,
            job_stuck_timeout_secs: 660,
            log_stuck_timeout_secs: 1_800,
            staging_max_age_secs: 3_600,
            log_retention_secs: 86_400,
            reaper_interval_secs: 60,
            folder_concurrency: 3,
            default_next_run_secs: 300,
            window_utc_offset_minutes: 330,
        }
    }
}

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

/// Endpoints and credentials of the spreadsheet source.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    /// OAuth bearer token, provided by an external token manager
    pub access_token: Option<String>,
    pub api_base: String,
    pub drive_base: String,
    pub export_base: String,
    pub request_timeout_secs: u64,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            api_base: "https://sheets.googleapis.com/v4".to_string(),
            drive_base: "https://www.googleapis.com/drive/v3".to_string(),
            export_base: "https://docs.google.com/spreadsheets".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for SheetsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SheetsConfig")
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("api_base", &self.api_base)
            .field("drive_base", &self.drive_base)
            .field("export_base", &self.export_base)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Top-level configuration file.
///
/// ```toml
/// database_url = "postgresql://localhost/sheets"
///
/// [engine]
/// chunk_threshold = 20000
///
/// [scheduler]
/// folder_concurrency = 2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub sheets: SheetsConfig,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration")
    }

    /// Load the file at `path` and apply environment overrides.
    ///
    /// Without a path the per-user file from [`default_config_path`] is read
    /// when it exists; otherwise every setting takes its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fallback = default_config_path().filter(|p| p.is_file());
        let mut config = match path.or(fallback.as_deref()) {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml_str(&contents)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty()) {
            self.sheets.access_token = Some(token);
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().with_context(|| {
            format!(
                "No database URL configured. Set database_url in the config file, {} or --database-url",
                ENV_DATABASE_URL
            )
        })
    }
}

/// `<config dir>/sheet-sync/config.toml`, e.g. `~/.config/sheet-sync/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sheet-sync").join("config.toml"))
}
