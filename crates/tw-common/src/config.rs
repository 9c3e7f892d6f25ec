use serde::Deserialize;

/// Top-level client configuration.
/// Loaded from an optional `taskwatch.*` file and environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Push channel settings
    #[serde(default)]
    pub push: PushConfig,
    /// REST API settings
    #[serde(default)]
    pub api: ApiConfig,
    /// Polling fallback policy
    #[serde(default)]
    pub polling: PollingConfig,
    /// Log level used when `RUST_LOG` is unset (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// WebSocket base URL; the client identity is appended as the last segment
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    /// Fixed delay between reconnect attempts in ms (default: 3000)
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Reconnect attempts before giving up (default: 5)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Keepalive ping interval in seconds, 0 disables (default: 30)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// REST base URL, `/tasks/{id}` is resolved against it
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Polling thresholds. These are policy knobs; tune them against the
/// backend rather than treating the defaults as contract.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Delay between status checks in ms (default: 2000)
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Non-terminal responses tolerated before timing out (default: 150)
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
    /// Progress at or above which a plateau counts as stuck (default: 90)
    #[serde(default = "default_stuck_progress")]
    pub stuck_progress: f64,
    /// Consecutive non-advancing attempts above `stuck_progress` tolerated (default: 30)
    #[serde(default = "default_stuck_attempts")]
    pub stuck_attempts: u32,
    /// Consecutive fetch failures before giving up with a network failure (default: 5)
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl AppConfig {
    /// Load config from an optional config file and environment variables.
    ///
    /// Environment keys use the `TW` prefix and `__` as separator, e.g.
    /// `TW__PUSH__MAX_RECONNECT_ATTEMPTS=10`.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(config::Environment::default())
    }

    fn load_from(env: config::Environment) -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("taskwatch").required(false))
            .add_source(env.prefix("TW").separator("__").try_parsing(true))
            .build()?;

        let app: Self = cfg.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        for (key, value) in [
            ("push.ws_base_url", &self.push.ws_base_url),
            ("api.base_url", &self.api.base_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| config::ConfigError::Message(format!("{key}: {e}")))?;
        }
        if self.polling.interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "polling.interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            push: PushConfig::default(),
            api: ApiConfig::default(),
            polling: PollingConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            ws_base_url: default_ws_base_url(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_poll_max_attempts(),
            stuck_progress: default_stuck_progress(),
            stuck_attempts: default_stuck_attempts(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_ws_base_url() -> String {
    "ws://localhost:8000/api/v1/ws".to_string()
}
fn default_reconnect_interval_ms() -> u64 {
    3000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_keepalive_interval_secs() -> u64 {
    tw_protocol::DEFAULT_KEEPALIVE_INTERVAL_SECS
}
fn default_api_base_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_poll_max_attempts() -> u32 {
    150
}
fn default_stuck_progress() -> f64 {
    90.0
}
fn default_stuck_attempts() -> u32 {
    30
}
fn default_max_consecutive_errors() -> u32 {
    5
}
