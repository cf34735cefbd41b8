use anyhow::{Context, Result};
use clap::Parser;
use lib_waitline::{LineConfig, ReleasePolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_waitline.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Virtual waiting room server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "WAITLINE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[arg(long, env = "WAITLINE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "WAITLINE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "WAITLINE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error, fatal).")]
    pub log_level: Option<String>,

    #[arg(long, env = "WAITLINE_POOL_CAPACITY", help = "Subscribers per broadcast pool.")]
    pub pool_capacity: Option<usize>,

    #[arg(long, env = "WAITLINE_BROADCAST_INTERVAL_MS", help = "Milliseconds between two admission pushes of a pool.")]
    pub broadcast_interval_ms: Option<u64>,

    #[arg(long, env = "WAITLINE_SEND_TIMEOUT_MS", help = "Milliseconds one push to one subscriber may take.")]
    pub send_timeout_ms: Option<u64>,

    #[arg(long, env = "WAITLINE_MAX_SEND_FAILURES", help = "Consecutive failed pushes before a subscriber is dropped.")]
    pub max_send_failures: Option<u32>,

    #[arg(long, env = "WAITLINE_ACCESS_MAX_AGE_SECS", help = "Seconds a granted access lasts before it is reclaimed.")]
    pub access_max_age_secs: Option<u64>,

    #[arg(long, env = "WAITLINE_WAITING_MAX_AGE_SECS", help = "Seconds an issued turn is advertised as valid.")]
    pub waiting_max_age_secs: Option<u64>,

    #[arg(long, env = "WAITLINE_INITIAL_ADMISSION", help = "Starting value of every line's admission counter.")]
    pub initial_admission: Option<u64>,

    #[arg(long, env = "WAITLINE_RELEASE_POLICY", help = "Release policy: permissive or tracked.")]
    pub release_policy: Option<String>,

    #[arg(long, env = "WAITLINE_REAP_INTERVAL_SECS", help = "Seconds between two sweeps for expired accesses.")]
    pub reap_interval_secs: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            pool_capacity: other.pool_capacity.or(self.pool_capacity),
            broadcast_interval_ms: other.broadcast_interval_ms.or(self.broadcast_interval_ms),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            max_send_failures: other.max_send_failures.or(self.max_send_failures),
            access_max_age_secs: other.access_max_age_secs.or(self.access_max_age_secs),
            waiting_max_age_secs: other.waiting_max_age_secs.or(self.waiting_max_age_secs),
            initial_admission: other.initial_admission.or(self.initial_admission),
            release_policy: other.release_policy.or(self.release_policy),
            reap_interval_secs: other.reap_interval_secs.or(self.reap_interval_secs),
        }
    }

    pub fn defaults() -> Config {
        let line = LineConfig::default();
        Config {
            port: Some(12312),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            pool_capacity: Some(line.capacity),
            broadcast_interval_ms: Some(line.broadcast_interval.as_millis() as u64),
            send_timeout_ms: Some(line.send_timeout.as_millis() as u64),
            max_send_failures: Some(line.max_send_failures),
            access_max_age_secs: Some(line.access_max_age.as_secs()),
            waiting_max_age_secs: Some(line.waiting_max_age.as_secs()),
            initial_admission: Some(line.initial_admission),
            release_policy: Some("permissive".to_string()),
            reap_interval_secs: Some(5),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(12312)
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.unwrap_or(5).max(1))
    }

    /// The settings every line of this server is built with.
    pub fn line_config(&self) -> Result<LineConfig> {
        let base = LineConfig::default();
        let release_policy = match &self.release_policy {
            Some(raw) => raw.parse::<ReleasePolicy>()?,
            None => base.release_policy,
        };
        let line = LineConfig {
            capacity: self.pool_capacity.unwrap_or(base.capacity),
            access_max_age: self
                .access_max_age_secs
                .map_or(base.access_max_age, Duration::from_secs),
            waiting_max_age: self
                .waiting_max_age_secs
                .map_or(base.waiting_max_age, Duration::from_secs),
            initial_admission: self.initial_admission.unwrap_or(base.initial_admission),
            broadcast_interval: self
                .broadcast_interval_ms
                .map_or(base.broadcast_interval, Duration::from_millis),
            send_timeout: self
                .send_timeout_ms
                .map_or(base.send_timeout, Duration::from_millis),
            max_send_failures: self.max_send_failures.unwrap_or(base.max_send_failures),
            release_policy,
        };
        line.validate()?;
        Ok(line)
    }
}

/// Defaults, then the JSON config file, then environment and CLI.
pub fn load_config() -> Result<Config> {
    resolve(Config::parse())
}

/// Layers `cli` (which already carries environment values) over the config
/// file it points to, and that over the built-in defaults.
pub fn resolve(cli: Config) -> Result<Config> {
    let mut current_config = Config::defaults();

    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else if cli.config_path.is_some() {
        anyhow::bail!("Config file not found at {}", config_file_path.display());
    }

    Ok(current_config.merge(cli))
}
