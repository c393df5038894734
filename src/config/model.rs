// src/config/model.rs

use serde::Deserialize;
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use thiserror::Error;

use crate::comms::dispatcher::DispatcherConfig;
use crate::policy::Policy;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub logging:   LoggingConfig,
    pub companion: CompanionConfig,
    pub actions:   ActionsConfig,
    pub metrics:   MetricsConfig,
    pub policies:  Vec<Policy>,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[metrics]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// Raw `[companion]` table; durations are humantime strings.
#[derive(Debug, Deserialize)]
pub struct CompanionStub {
    #[serde(default = "default_endpoint")]
    pub endpoint:        String,
    #[serde(default = "default_max_loop_events")]
    pub max_loop_events: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}
fn default_endpoint() -> String { "http://127.0.0.1:7601".into() }
fn default_max_loop_events() -> u32 { 100 }
fn default_connect_timeout() -> String { "2s".into() }

impl Default for CompanionStub {
    fn default() -> Self {
        Self {
            endpoint:        default_endpoint(),
            max_loop_events: default_max_loop_events(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Raw `[actions]` table
#[derive(Debug, Deserialize)]
pub struct ActionsStub {
    #[serde(default = "default_deadline")]
    pub deadline:      String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
}
fn default_deadline() -> String { "30s".into() }
fn default_tick_interval() -> String { "100ms".into() }

impl Default for ActionsStub {
    fn default() -> Self {
        Self { deadline: default_deadline(), tick_interval: default_tick_interval() }
    }
}

/// The whole file as it sits on disk
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default)] pub logging:   LoggingConfig,
    #[serde(default)] pub companion: CompanionStub,
    #[serde(default)] pub actions:   ActionsStub,
    #[serde(default)] pub metrics:   MetricsConfig,
    #[serde(default)] pub policies:  Vec<Policy>,
}

/// Fully-typed companion connection settings
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub endpoint:        String,
    pub max_loop_events: u32,
    pub connect_timeout: Duration,
}

impl CompanionConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            endpoint:        self.endpoint.clone(),
            max_loop_events: self.max_loop_events,
        }
    }
}

/// Fully-typed action tracking settings
#[derive(Debug, Clone, Copy)]
pub struct ActionsConfig {
    pub deadline:      Duration,
    pub tick_interval: Duration,
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("max_loop_events must be at least 1")]
    ZeroLoopEvents,

    #[error("duplicate policy id {0}")]
    DuplicatePolicy(u64),

    #[error("policy {0} has no actions")]
    NoActions(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw).map_err(|e| ConfigError::InvalidDuration(raw.into(), e))
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        if raw.companion.max_loop_events == 0 {
            return Err(ConfigError::ZeroLoopEvents);
        }

        let mut seen = HashSet::new();
        for policy in &raw.policies {
            if !seen.insert(policy.id) {
                return Err(ConfigError::DuplicatePolicy(policy.id));
            }
            if policy.actions.is_empty() {
                return Err(ConfigError::NoActions(policy.id));
            }
        }

        Ok(Config {
            logging: raw.logging,
            companion: CompanionConfig {
                endpoint:        raw.companion.endpoint,
                max_loop_events: raw.companion.max_loop_events,
                connect_timeout: parse_duration(&raw.companion.connect_timeout)?,
            },
            actions: ActionsConfig {
                deadline:      parse_duration(&raw.actions.deadline)?,
                tick_interval: parse_duration(&raw.actions.tick_interval)?,
            },
            metrics:  raw.metrics,
            policies: raw.policies,
        })
    }
}
