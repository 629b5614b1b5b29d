use clap::Parser;
use lib_livesync::{BackoffPolicy, SettingsError, SourceConfig, StalePolicy, SyncSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Live dashboard data sync services", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LIVESYNC_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVESYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVESYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVESYNC_FEED_URL", help = "WebSocket endpoint of the upstream feed.")]
    pub feed_url: Option<String>,

    #[clap(long, env = "LIVESYNC_AUTH_TOKEN", help = "Bearer token presented to (or required by) the feed.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "LIVESYNC_TOPICS", value_delimiter = ',', help = "Comma-separated topics, e.g. price:AAPL,news:GLOBAL.")]
    pub topics: Option<Vec<String>>,

    #[clap(long, env = "LIVESYNC_HEARTBEAT_INTERVAL_MS", help = "Keep-alive ping interval in milliseconds.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_SILENT_TIMEOUT_MS", help = "Milliseconds without any frame before the session is recycled.")]
    pub silent_timeout_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_RECONNECT_MAX_ATTEMPTS", help = "Consecutive failed retries before the feed closes.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "LIVESYNC_STALE_THRESHOLD_MS", help = "Default staleness threshold in milliseconds.")]
    pub stale_threshold_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_TICK_INTERVAL_MS", help = "Render tick interval in milliseconds.")]
    pub tick_interval_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_MONITOR_INTERVAL_SECONDS", help = "Interval in seconds between freshness checks.")]
    pub monitor_interval_seconds: Option<u64>,

    #[clap(long, env = "LIVESYNC_PORT", help = "Port the feed simulator listens on.")]
    pub port: Option<u16>,

    #[clap(long, env = "LIVESYNC_PUBLISH_INTERVAL_MS", help = "Feed simulator: milliseconds between updates per topic.")]
    pub publish_interval_ms: Option<u64>,

    #[clap(long, env = "LIVESYNC_DROP_EVERY_SECONDS", help = "Feed simulator: close every session after this many seconds.")]
    pub drop_every_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            feed_url: other.feed_url.or(self.feed_url),
            auth_token: other.auth_token.or(self.auth_token),
            topics: other.topics.or(self.topics),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            silent_timeout_ms: other.silent_timeout_ms.or(self.silent_timeout_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            stale_threshold_ms: other.stale_threshold_ms.or(self.stale_threshold_ms),
            tick_interval_ms: other.tick_interval_ms.or(self.tick_interval_ms),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
            port: other.port.or(self.port),
            publish_interval_ms: other.publish_interval_ms.or(self.publish_interval_ms),
            drop_every_seconds: other.drop_every_seconds.or(self.drop_every_seconds),
        }
    }

    pub fn defaults() -> Config {
        let source = SourceConfig::default();
        let backoff = BackoffPolicy::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            feed_url: Some(source.endpoint),
            topics: Some(vec![
                "price:AAPL".to_string(),
                "price:TSLA".to_string(),
                "sentiment:AAPL".to_string(),
                "risk:PORTFOLIO".to_string(),
                "news:GLOBAL".to_string(),
            ]),
            heartbeat_interval_ms: Some(source.heartbeat_interval_ms),
            reconnect_base_delay_ms: Some(backoff.base_ms),
            reconnect_max_delay_ms: Some(backoff.cap_ms),
            reconnect_max_attempts: Some(backoff.max_attempts),
            stale_threshold_ms: Some(StalePolicy::default().default_threshold_ms),
            tick_interval_ms: Some(SyncSettings::default().tick_interval_ms),
            monitor_interval_seconds: Some(5),
            port: Some(9003),
            publish_interval_ms: Some(250),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Engine settings built from the merged configuration.
    pub fn sync_settings(&self) -> Result<SyncSettings, SettingsError> {
        let defaults = SyncSettings::default();
        let settings = SyncSettings {
            source: SourceConfig {
                endpoint: self.feed_url.clone().unwrap_or(defaults.source.endpoint),
                auth_token: self.auth_token.clone(),
                heartbeat_interval_ms: self
                    .heartbeat_interval_ms
                    .unwrap_or(defaults.source.heartbeat_interval_ms),
                silent_timeout_ms: self.silent_timeout_ms,
                topics: self.topics.clone().unwrap_or_default(),
            },
            backoff: BackoffPolicy {
                base_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.backoff.base_ms),
                cap_ms: self.reconnect_max_delay_ms.unwrap_or(defaults.backoff.cap_ms),
                max_attempts: self.reconnect_max_attempts.unwrap_or(defaults.backoff.max_attempts),
                jitter: true,
            },
            stale: StalePolicy {
                default_threshold_ms: self
                    .stale_threshold_ms
                    .unwrap_or(defaults.stale.default_threshold_ms),
                ..StalePolicy::default()
            }
            .with_class("news", 300_000),
            tick_interval_ms: self.tick_interval_ms.unwrap_or(defaults.tick_interval_ms),
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Defaults, then the JSON file, then environment variables and CLI flags.
pub fn load_config(default_file: &str) -> Config {
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(default_file));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli_args)
}
