use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "RUNBAL_CONFIG";
// Snapshot writes bind two variables per row; SQLite allows 32766 per statement.
const MAX_BATCH_SIZE: usize = 16_383;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) recalc: RecalcConfig,
    pub(crate) locks: LockConfig,
    pub(crate) storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct RecalcConfig {
    /// Rows fetched and rewritten per replay page.
    pub(crate) batch_size: usize,
    /// Log a warning once a single pass replays more rows than this.
    pub(crate) warn_threshold: usize,
    /// Abort (and roll back) a pass that would replay more rows than this.
    pub(crate) max_rows: Option<usize>,
}

impl Default for RecalcConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            warn_threshold: 1000,
            max_rows: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct LockConfig {
    pub(crate) timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl LockConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct StorageConfig {
    pub(crate) busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
        }
    }
}

impl StorageConfig {
    pub(crate) fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Config {
    /// Load from `$RUNBAL_CONFIG`, else `config.toml` in the platform config
    /// dir. A missing file yields the defaults.
    pub(crate) fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) => Some(PathBuf::from(p)),
            None => default_config_path(),
        };
        match path {
            Some(p) if p.exists() => Self::from_file(&p),
            _ => Ok(Self::default()),
        }
    }

    pub(crate) fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.recalc.batch_size == 0 {
            anyhow::bail!("recalc.batch_size must be at least 1");
        }
        if config.recalc.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!("recalc.batch_size must be at most {MAX_BATCH_SIZE}");
        }
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "runbal", "runbal")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
