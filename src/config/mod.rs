use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub circles: CirclesConfig,
    #[serde(default)]
    pub neynar: NeynarConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CirclesConfig {
    /// Circles indexer base URL. JSON-RPC is POSTed to `/`, profiles are
    /// searched under `/profiles/search`.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeynarConfig {
    /// Neynar API base URL (social graph).
    #[serde(default = "default_neynar_url")]
    pub api_url: String,
    /// API key - loaded from env NEYNAR_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Follows requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Stop paginating after this many pages.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

/// Activity-classification thresholds. The defaults were picked by hand and
/// are meant to be tuned.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    /// Events newer than this count as recent; last activity inside this
    /// window earns the full recency bonus.
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: u64,
    /// Last activity inside this window earns the partial recency bonus.
    #[serde(default = "default_extended_window_days")]
    pub extended_window_days: u64,
    /// Total activity events at which the volume band saturates.
    #[serde(default = "default_volume_saturation")]
    pub volume_saturation: u32,
    /// Recent events at which the recent-density band saturates.
    #[serde(default = "default_recent_saturation")]
    pub recent_saturation: u32,
    /// Live if total activity events exceed this.
    #[serde(default = "default_live_total_events")]
    pub live_total_events: u32,
    /// Live if recent events exceed this.
    #[serde(default = "default_live_recent_events")]
    pub live_recent_events: u32,
    /// Live if the composite score exceeds this.
    #[serde(default = "default_live_score")]
    pub live_score: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_day_ttl")]
    pub profile_ttl_secs: u64,
    #[serde(default = "default_day_ttl")]
    pub events_ttl_secs: u64,
    #[serde(default = "default_day_ttl")]
    pub resolution_ttl_secs: u64,
    /// The viewer's own trust edges change more often than membership.
    #[serde(default = "default_trust_ttl")]
    pub trust_ttl_secs: u64,
    /// Per-table entry bound.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Resolutions in flight per wave.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between waves to stay under upstream rate limits.
    #[serde(default = "default_wave_delay_ms")]
    pub wave_delay_ms: u64,
    /// Results buffered between the producer task and the consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_url() -> String {
    "https://rpc.aboutcircles.com".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_neynar_url() -> String {
    "https://api.neynar.com".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    50
}
fn default_recent_window_days() -> u64 {
    30
}
fn default_extended_window_days() -> u64 {
    90
}
fn default_volume_saturation() -> u32 {
    10
}
fn default_recent_saturation() -> u32 {
    20
}
fn default_live_total_events() -> u32 {
    50
}
fn default_live_recent_events() -> u32 {
    5
}
fn default_live_score() -> u8 {
    40
}
fn default_day_ttl() -> u64 {
    86_400
}
fn default_trust_ttl() -> u64 {
    3_600
}
fn default_max_entries() -> usize {
    50_000
}
fn default_batch_size() -> usize {
    8
}
fn default_wave_delay_ms() -> u64 {
    250
}
fn default_channel_capacity() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CirclesConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for NeynarConfig {
    fn default() -> Self {
        Self {
            api_url: default_neynar_url(),
            api_key: String::new(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            recent_window_days: default_recent_window_days(),
            extended_window_days: default_extended_window_days(),
            volume_saturation: default_volume_saturation(),
            recent_saturation: default_recent_saturation(),
            live_total_events: default_live_total_events(),
            live_recent_events: default_live_recent_events(),
            live_score: default_live_score(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            profile_ttl_secs: default_day_ttl(),
            events_ttl_secs: default_day_ttl(),
            resolution_ttl_secs: default_day_ttl(),
            trust_ttl_secs: default_trust_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            wave_delay_ms: default_wave_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a default config with env-only overrides (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        // Secrets never live in the config file
        if let Ok(key) = std::env::var("NEYNAR_API_KEY") {
            self.neynar.api_key = key;
        }
        if let Ok(url) = std::env::var("CIRCLES_RPC_URL") {
            self.circles.rpc_url = url;
        }
        if let Ok(url) = std::env::var("NEYNAR_API_URL") {
            self.neynar.api_url = url;
        }
    }

    /// The Neynar key, or an error naming the variable to set.
    pub fn neynar_api_key(&self) -> Result<&str, ConfigError> {
        if self.neynar.api_key.is_empty() {
            return Err(ConfigError::MissingEnv("NEYNAR_API_KEY".to_string()));
        }
        Ok(&self.neynar.api_key)
    }
}
