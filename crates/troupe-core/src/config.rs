use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduler constants — shared defaults for every deployment
pub const STUCK_THRESHOLD_SECS_DEFAULT: u64 = 120;
pub const AUTO_MODE_MAX_ROUNDS_DEFAULT: u32 = 10;
pub const COPILOT_MAX_STEPS_DEFAULT: u32 = 10;
pub const USER_TURN_DEBOUNCE_MS_DEFAULT: u64 = 0;
pub const WORKER_POLL_INTERVAL_MS: u64 = 1_000;
pub const HEARTBEAT_MIN_INTERVAL_MS: u64 = 1_000; // at most one heartbeat write per second

/// Top-level config (troupe.toml + TROUPE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TroupeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

impl Default for TroupeConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scheduler tunables. Every field has a serde default so a partial TOML
/// table (or none at all) still produces a usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds without a heartbeat before a running run is considered stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    /// Default delay between a user message and the AI reply it triggers.
    /// Spaces can override per-space.
    #[serde(default)]
    pub user_turn_debounce_ms: u64,
    /// Upper bound on the auto-mode round budget a user may request.
    #[serde(default = "default_max_rounds")]
    pub auto_mode_max_rounds: u32,
    /// Upper bound on copilot auto-advance steps.
    #[serde(default = "default_copilot_steps")]
    pub copilot_max_steps: u32,
    /// Optional deployment-wide token ceiling applied on top of per-space limits.
    #[serde(default)]
    pub global_token_limit: Option<i64>,
    /// Number of concurrent worker tasks claiming queued runs.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Worker fallback poll interval when no kick arrives.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: default_stuck_threshold(),
            user_turn_debounce_ms: 0,
            auto_mode_max_rounds: default_max_rounds(),
            copilot_max_steps: default_copilot_steps(),
            global_token_limit: None,
            workers: default_workers(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// LLM transport endpoint for the built-in SSE client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    /// Override the chat completions path. Defaults to "/v1/chat/completions".
    pub chat_path: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_stuck_threshold() -> u64 {
    STUCK_THRESHOLD_SECS_DEFAULT
}
fn default_max_rounds() -> u32 {
    AUTO_MODE_MAX_ROUNDS_DEFAULT
}
fn default_copilot_steps() -> u32 {
    COPILOT_MAX_STEPS_DEFAULT
}
fn default_workers() -> usize {
    2
}
fn default_poll_interval() -> u64 {
    WORKER_POLL_INTERVAL_MS
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_request_timeout() -> u64 {
    120
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.troupe/troupe.db")
}

impl TroupeConfig {
    /// Load config from a TOML file with TROUPE_* env var overrides.
    ///
    /// A handful of bare env vars are honored on top for operability
    /// (`STUCK_THRESHOLD_SECS`, `USER_TURN_DEBOUNCE_MS_DEFAULT`,
    /// `AUTO_MODE_MAX_ROUNDS`, `COPILOT_MAX_STEPS`, `GLOBAL_TOKEN_LIMIT`) —
    /// they map directly onto the scheduler table and win over the file.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: TroupeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TROUPE_").split("_"))
            .extract()
            .map_err(|e| crate::error::TroupeError::Config(e.to_string()))?;

        config.scheduler.apply_bare_env();
        Ok(config)
    }
}

impl SchedulerConfig {
    /// Apply the dedicated (unprefixed) scheduler env vars.
    ///
    /// Unparseable values are logged and ignored rather than failing startup.
    pub fn apply_bare_env(&mut self) {
        if let Some(v) = parse_env::<u64>("STUCK_THRESHOLD_SECS") {
            self.stuck_threshold_secs = v;
        }
        if let Some(v) = parse_env::<u64>("USER_TURN_DEBOUNCE_MS_DEFAULT") {
            self.user_turn_debounce_ms = v;
        }
        if let Some(v) = parse_env::<u32>("AUTO_MODE_MAX_ROUNDS") {
            self.auto_mode_max_rounds = v;
        }
        if let Some(v) = parse_env::<u32>("COPILOT_MAX_STEPS") {
            self.copilot_max_steps = v;
        }
        if let Some(v) = parse_env::<i64>("GLOBAL_TOKEN_LIMIT") {
            self.global_token_limit = Some(v);
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.troupe/troupe.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.stuck_threshold_secs, 120);
        assert_eq!(cfg.auto_mode_max_rounds, 10);
        assert_eq!(cfg.copilot_max_steps, 10);
        assert_eq!(cfg.global_token_limit, None);
    }

    #[test]
    fn bare_env_overrides_scheduler_table() {
        let mut cfg = SchedulerConfig::default();
        std::env::set_var("STUCK_THRESHOLD_SECS", "45");
        std::env::set_var("GLOBAL_TOKEN_LIMIT", "500000");
        cfg.apply_bare_env();
        std::env::remove_var("STUCK_THRESHOLD_SECS");
        std::env::remove_var("GLOBAL_TOKEN_LIMIT");
        assert_eq!(cfg.stuck_threshold_secs, 45);
        assert_eq!(cfg.global_token_limit, Some(500_000));
    }

    #[test]
    fn bad_env_value_is_ignored() {
        let mut cfg = SchedulerConfig::default();
        std::env::set_var("AUTO_MODE_MAX_ROUNDS", "lots");
        cfg.apply_bare_env();
        std::env::remove_var("AUTO_MODE_MAX_ROUNDS");
        assert_eq!(cfg.auto_mode_max_rounds, 10);
    }
}
