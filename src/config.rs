use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What to do when the destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    /// Always fetch and replace.
    Always,
    /// Accept any existing file.
    SkipIfPresent,
    /// Accept an existing file only if its size and checksum match what the
    /// descriptor expects.
    #[default]
    VerifyThenSkip,
}

/// Batch tuning knobs. Durations are plain milliseconds so the struct reads
/// naturally from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub global_limit: usize,
    pub per_host_limit: Option<usize>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the nominal delay used as +/- jitter.
    pub jitter: f64,
    pub connect_timeout_ms: u64,
    /// Longest wait for the next chunk of a transfer.
    pub read_timeout_ms: u64,
    /// Cancels the whole batch once elapsed.
    pub batch_timeout_ms: Option<u64>,
    pub overwrite_policy: OverwritePolicy,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            global_limit: 8,
            per_host_limit: None,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            batch_timeout_ms: None,
            overwrite_policy: OverwritePolicy::default(),
            user_agent: concat!("stac-user/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_limit == 0 {
            bail!("global_limit must be at least 1");
        }
        if self.per_host_limit == Some(0) {
            bail!("per_host_limit must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!("max_delay_ms must not be smaller than base_delay_ms");
        }
        if !(0.0..1.0 / 3.0).contains(&self.jitter) {
            bail!("jitter must be in [0, 1/3), got {}", self.jitter);
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }
}
