use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long the delivery loop waits without progress before logging a
    /// stall diagnostic
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Bound for `wait_until_timeframe`
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl PipelineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: default_stall_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Minimum interval between two write batches
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,
}

impl RepoConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            write_interval_ms: default_write_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_sqlite_cache_size")]
    pub sqlite_cache_size: i32,
    #[serde(default = "default_sqlite_busy_timeout")]
    pub sqlite_busy_timeout: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sqlite_cache_size: default_sqlite_cache_size(),
            sqlite_busy_timeout: default_sqlite_busy_timeout(),
        }
    }
}

fn default_stall_timeout_ms() -> u64 {
    1000
}

fn default_wait_timeout_ms() -> u64 {
    5000
}

fn default_write_interval_ms() -> u64 {
    50
}

fn default_db_path() -> PathBuf {
    PathBuf::from("spacesync.db")
}

fn default_sqlite_cache_size() -> i32 {
    -2000
}

fn default_sqlite_busy_timeout() -> i32 {
    5000
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pipeline.stall_timeout(), Duration::from_secs(1));
        assert_eq!(config.pipeline.wait_timeout(), Duration::from_secs(5));
        assert_eq!(config.repo.write_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
stall_timeout_ms = 250

[repo]
write_interval_ms = 10

[storage]
db_path = "/tmp/feeds.db"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.pipeline.stall_timeout_ms, 250);
        assert_eq!(config.pipeline.wait_timeout_ms, 5000);
        assert_eq!(config.repo.write_interval_ms, 10);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/feeds.db"));
        assert_eq!(config.storage.sqlite_busy_timeout, 5000);
    }
}
