use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Pairchat anonymous pairing server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "pairchat-server", version, about = "Anonymous one-on-one chat pairing server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PAIRCHAT_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PAIRCHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./pairchat.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PAIRCHAT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the SQLite audit database
    #[arg(long, env = "PAIRCHAT_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Bearer token for /api/admin routes. Admin routes are disabled when unset.
    #[arg(long, env = "PAIRCHAT_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Matching engine tuning (loaded from [matching] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub matching: Option<MatchingConfig>,
}

/// Quotas, cooldowns and moderation thresholds for the matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Matches per specific filter per device per day (default: 5)
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,

    /// Minimum seconds between successful joins (default: 5)
    #[serde(default = "default_join_cooldown_secs")]
    pub join_cooldown_secs: u64,

    /// Maximum chat message length in characters (default: 500)
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Maximum nickname length in characters (default: 32)
    #[serde(default = "default_max_nickname_chars")]
    pub max_nickname_chars: usize,

    /// Reports that trigger an automatic temporary ban (default: 3)
    #[serde(default = "default_report_threshold")]
    pub report_threshold: u32,

    /// Temporary ban length in seconds (default: 86400 = 24 hours)
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    /// Rate limit window in seconds (default: 60)
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Client actions allowed per window (default: 60)
    #[serde(default = "default_rate_limit_max_actions")]
    pub rate_limit_max_actions: u32,

    /// Pending write-behind commands before new ones are dropped (default: 1024)
    #[serde(default = "default_persist_queue_capacity")]
    pub persist_queue_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            daily_quota: default_daily_quota(),
            join_cooldown_secs: default_join_cooldown_secs(),
            max_message_chars: default_max_message_chars(),
            max_nickname_chars: default_max_nickname_chars(),
            report_threshold: default_report_threshold(),
            ban_duration_secs: default_ban_duration_secs(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_actions: default_rate_limit_max_actions(),
            persist_queue_capacity: default_persist_queue_capacity(),
        }
    }
}

impl MatchingConfig {
    pub fn join_cooldown(&self) -> chrono::Duration {
        seconds(self.join_cooldown_secs)
    }

    pub fn ban_duration(&self) -> chrono::Duration {
        seconds(self.ban_duration_secs)
    }

    pub fn rate_limit_window(&self) -> chrono::Duration {
        seconds(self.rate_limit_window_secs)
    }
}

/// Saturating conversion; absurd values clamp to the largest representable span.
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn default_daily_quota() -> u32 {
    5
}

fn default_join_cooldown_secs() -> u64 {
    5
}

fn default_max_message_chars() -> usize {
    500
}

fn default_max_nickname_chars() -> usize {
    32
}

fn default_report_threshold() -> u32 {
    3
}

fn default_ban_duration_secs() -> u64 {
    86400
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_max_actions() -> u32 {
    60
}

fn default_persist_queue_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./pairchat.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            admin_token: None,
            matching: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PAIRCHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PAIRCHAT_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Pairchat Server Configuration
# Place this file at ./pairchat.toml or specify with --config <path>
# All settings can be overridden via environment variables (PAIRCHAT_PORT,
# PAIRCHAT_MATCHING__DAILY_QUOTA, etc.) or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite audit database
# data_dir = "./data"

# Bearer token for /api/admin routes (reports, ban, unban).
# Admin routes answer 404 while this is unset.
# admin_token = ""

# ---- Matching Engine ----
# [matching]

# Matches per specific filter per device per day
# daily_quota = 5

# Minimum seconds between successful joins
# join_cooldown_secs = 5

# Message and nickname length limits (characters)
# max_message_chars = 500
# max_nickname_chars = 32

# Reports that trigger an automatic temporary ban, and its length
# report_threshold = 3
# ban_duration_secs = 86400

# Per-device client action budget
# rate_limit_window_secs = 60
# rate_limit_max_actions = 60

# Pending persistence writes before new ones are dropped
# persist_queue_capacity = 1024
"#
    .to_string()
}
