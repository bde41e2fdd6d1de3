use std::time::Duration;

use tracing::trace;

use crate::fetch::Resource;

/// Credentials for the monitoring backend.
///
/// When `password` is absent, `username` is treated as a long-lived token
/// and validated by fetching the current user.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Per-resource polling cadences, in seconds
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PollIntervals {
    #[serde(default = "default_user_interval")]
    pub user: u64,
    #[serde(default = "default_status_interval")]
    pub hosts: u64,
    #[serde(default = "default_status_interval")]
    pub services: u64,
    #[serde(default = "default_slow_interval")]
    pub daemons: u64,
    #[serde(default = "default_user_interval")]
    pub livesynthesis: u64,
    #[serde(default = "default_slow_interval")]
    pub history: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            user: default_user_interval(),
            hosts: default_status_interval(),
            services: default_status_interval(),
            daemons: default_slow_interval(),
            livesynthesis: default_user_interval(),
            history: default_slow_interval(),
        }
    }
}

impl PollIntervals {
    pub fn cadence(&self, resource: Resource) -> Duration {
        let secs = match resource {
            Resource::User => self.user,
            Resource::Hosts => self.hosts,
            Resource::Services => self.services,
            Resource::Daemons => self.daemons,
            Resource::LiveSynthesis => self.livesynthesis,
            Resource::History => self.history,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Base URL of the backend, e.g. `http://127.0.0.1:5000`
    pub backend: String,

    pub credentials: Credentials,

    #[serde(default)]
    pub intervals: PollIntervals,

    /// Fixed interval between reconnect attempts while disconnected, seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Seconds before a submitted action without backend confirmation is
    /// reported as timed out
    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,

    /// HTTP request timeout, seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Config {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

fn default_status_interval() -> u64 {
    15
}

fn default_user_interval() -> u64 {
    30
}

fn default_slow_interval() -> u64 {
    60
}

fn default_reconnect_interval() -> u64 {
    10
}

fn default_action_timeout() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
