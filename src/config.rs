//! Process Configuration
//!
//! Flags with environment fallbacks. `main` loads `.env` before parsing, so the
//! same variables can come from the shell or from a file next to the binary.

use crate::broker::types::DEFAULT_QUEUE;

use clap::{Parser, ValueEnum};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "order-stats-worker", about = "Order statistics task worker")]
pub struct Config {
    /// Broker location: `memory://` or `redis://…`.
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: BackendUrl,

    /// Durable store location: `memory://` or `postgres://…`.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: BackendUrl,

    /// Result store location. Defaults to the broker URL.
    #[arg(long, env = "RESULT_BACKEND_URL")]
    pub result_url: Option<BackendUrl>,

    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Which halves of the system this process runs.
    #[arg(long, env = "ROLE", value_enum, default_value_t = Role::All)]
    pub role: Role,

    #[arg(long, env = "WORKER_COUNT", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "TASK_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Seconds before an unacked delivery is handed to another worker.
    #[arg(long, default_value_t = 30)]
    pub visibility_timeout_secs: u64,

    /// Period of the stats trigger; 0 disables it.
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 120)]
    pub schedule_interval_secs: u64,

    /// Expiry of task records (Redis only).
    #[arg(long, default_value_t = 86_400)]
    pub result_ttl_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// HTTP surface, scheduler and workers in one process.
    All,
    /// HTTP surface and scheduler only.
    Api,
    /// Workers only.
    Worker,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

/// A parsed connection URL, classified by scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendUrl {
    Memory,
    Redis(String),
    Postgres(String),
}

impl FromStr for BackendUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, _) = s
            .split_once("://")
            .ok_or_else(|| ConfigError::MalformedUrl(s.to_string()))?;

        match scheme {
            "memory" => Ok(BackendUrl::Memory),
            "redis" | "rediss" => Ok(BackendUrl::Redis(s.to_string())),
            "postgres" | "postgresql" => Ok(BackendUrl::Postgres(s.to_string())),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendUrl::Memory => f.write_str("memory://"),
            // Only the scheme; URLs may carry credentials.
            BackendUrl::Redis(_) => f.write_str("redis://…"),
            BackendUrl::Postgres(_) => f.write_str("postgres://…"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("malformed connection URL: {0}")]
    MalformedUrl(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("{slot} cannot use {url}")]
    WrongBackend { slot: &'static str, url: String },

    #[error("an in-process broker only reaches workers in the same process; use --role all")]
    SplitRoleWithMemoryBroker,

    #[error("--workers must be at least 1")]
    NoWorkers,

    #[error("--visibility-timeout-secs must be at least 1")]
    NoVisibilityTimeout,
}

impl Config {
    /// Result store location after applying the broker-URL default.
    pub fn result_url(&self) -> &BackendUrl {
        self.result_url.as_ref().unwrap_or(&self.broker_url)
    }

    /// Rejects combinations that parse but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.broker_url, BackendUrl::Postgres(_)) {
            return Err(ConfigError::WrongBackend {
                slot: "broker",
                url: self.broker_url.to_string(),
            });
        }
        if matches!(self.result_url(), BackendUrl::Postgres(_)) {
            return Err(ConfigError::WrongBackend {
                slot: "result store",
                url: self.result_url().to_string(),
            });
        }
        if matches!(self.database_url, BackendUrl::Redis(_)) {
            return Err(ConfigError::WrongBackend {
                slot: "database",
                url: self.database_url.to_string(),
            });
        }
        if self.broker_url == BackendUrl::Memory && self.role != Role::All {
            return Err(ConfigError::SplitRoleWithMemoryBroker);
        }
        if self.role.runs_workers() && self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.visibility_timeout_secs == 0 {
            return Err(ConfigError::NoVisibilityTimeout);
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// `None` when the periodic trigger is disabled.
    pub fn schedule_interval(&self) -> Option<Duration> {
        (self.schedule_interval_secs > 0).then(|| Duration::from_secs(self.schedule_interval_secs))
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}
