use crate::session::{RetryPolicy, SessionOptions};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub nats: NatsConfig,
    pub http: HttpConfig,
    pub connection: ConnectionSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "session-link".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Session service RPC subjects are `<rpc_prefix>.<operation>`
    pub rpc_prefix: String,
    /// Session updates arrive on `<update_prefix>.<session id>`
    pub update_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            rpc_prefix: "session.rpc".to_string(),
            update_prefix: "session".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay_ms: u64,
}

impl ConnectionSettings {
    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_reconnect_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub heartbeat_interval_secs: u64,
    pub expiry_check_interval_secs: u64,
    pub warning_thresholds_mins: Vec<u64>,
    pub max_reconnect_attempts: u32,
    /// Tries for join/fetch, including the first
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl SessionSettings {
    pub fn options(&self, update_prefix: &str) -> Result<SessionOptions> {
        let options = SessionOptions {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            expiry_check_interval: Duration::from_secs(self.expiry_check_interval_secs),
            warning_thresholds: self
                .warning_thresholds_mins
                .iter()
                .map(|mins| Duration::from_secs(mins * 60))
                .collect(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            update_subject_prefix: update_prefix.to_string(),
        };
        options.validate().context("Invalid [session] settings")?;
        Ok(options)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            expiry_check_interval_secs: 60,
            warning_thresholds_mins: vec![30, 5],
            max_reconnect_attempts: 5,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from a config file (extension optional) overlaid by
    /// `SESSION_LINK__SECTION__KEY` environment variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SESSION_LINK").separator("__"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.session.options(&cfg.nats.update_prefix)?;

        Ok(cfg)
    }
}
