//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast on bad values. Environment variables
//! win over the file; the file wins over defaults. The database URL is
//! wrapped in `SecretString` to keep it out of logs.
//!
//! Nothing below `config` reads the environment: coordinators and producers
//! get the structs built here.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::engine::{CoordinatorConfig, ProducerConfig};
use crate::error::{Error, Result};
use crate::model::{OwnerId, WorkerId, partitions};

/// Which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    Worker,
    Both,
    None,
}

impl Role {
    pub fn runs_producer(self) -> bool {
        matches!(self, Role::Producer | Role::Both)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::Both)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "producer" => Ok(Role::Producer),
            // "consumer" is the older name for the worker role.
            "worker" | "consumer" => Ok(Role::Worker),
            "both" => Ok(Role::Both),
            "none" | "" => Ok(Role::None),
            other => Err(Error::Config(format!("unknown role {other:?}"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Producer => "producer",
            Role::Worker => "worker",
            Role::Both => "both",
            Role::None => "none",
        };
        f.write_str(s)
    }
}

/// Optional settings file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub role: Option<Role>,
    pub worker_id: Option<String>,
    pub worker_count: Option<usize>,
    pub partition_count: Option<u32>,
    pub lease_ttl_ms: Option<u64>,
    pub lock_rate_ms: Option<u64>,
    pub work_item_duration_ms: Option<u64>,
    pub producer_rate_ms: Option<u64>,
    pub max_connections: Option<u32>,
    pub otel_endpoint: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub role: Role,
    /// Process-scoped worker identity (`WORKER_ID` or the file), if any.
    pub worker_id: Option<String>,
    /// Coordinator instances in this process.
    pub worker_count: usize,
    pub partitions: Vec<OwnerId>,
    pub lease_ttl: Duration,
    pub lock_rate: Duration,
    /// Simulated per-item work time. `None` picks 500 to 800 ms per item.
    pub work_item_duration: Option<Duration>,
    pub producer_rate: Duration,
    pub max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables, layered over the
    /// settings file when one is given.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(|name| std::env::var(name).ok(), file)
    }

    /// Build from a variable lookup and a settings file.
    pub fn from_sources(var: impl Fn(&str) -> Option<String>, file: FileConfig) -> Result<Self> {
        let database_url = var("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Config("required environment variable DATABASE_URL is not set".to_string())
            })?;

        let role = match var("ROLE") {
            Some(v) => v.parse()?,
            None => file.role.unwrap_or(Role::None),
        };

        let worker_count = parsed(&var, "WORKER_COUNT")?
            .or(file.worker_count)
            .unwrap_or(1);
        if worker_count == 0 {
            return Err(Error::Config("WORKER_COUNT must be at least 1".to_string()));
        }

        let partition_count = parsed(&var, "PARTITION_COUNT")?
            .or(file.partition_count)
            .unwrap_or(5);
        if partition_count == 0 {
            return Err(Error::Config("PARTITION_COUNT must be at least 1".to_string()));
        }

        let millis = |name: &str, from_file: Option<u64>, default: u64| -> Result<Duration> {
            let ms = parsed(&var, name)?.or(from_file).unwrap_or(default);
            if ms == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
            Ok(Duration::from_millis(ms))
        };

        let lease_ttl = millis(
            "LEASE_TTL_MS",
            file.lease_ttl_ms,
            CoordinatorConfig::DEFAULT_LEASE_TTL.as_millis() as u64,
        )?;
        let lock_rate = millis(
            "WORKER_LOCK_RATE_MS",
            file.lock_rate_ms,
            CoordinatorConfig::DEFAULT_TICK_INTERVAL.as_millis() as u64,
        )?;
        let producer_rate = millis(
            "PRODUCER_RATE_MS",
            file.producer_rate_ms,
            ProducerConfig::default().interval.as_millis() as u64,
        )?;
        let work_item_duration = parsed::<u64>(&var, "WORKER_WORK_ITEM_DURATION_MS")?
            .or(file.work_item_duration_ms)
            .map(Duration::from_millis);

        Ok(Self {
            database_url: SecretString::from(database_url),
            role,
            worker_id: var("WORKER_ID").or(file.worker_id),
            worker_count,
            partitions: partitions(partition_count),
            lease_ttl,
            lock_rate,
            work_item_duration,
            producer_rate,
            max_connections: parsed(&var, "DATABASE_MAX_CONNECTIONS")?
                .or(file.max_connections)
                .unwrap_or(10),
            otel_endpoint: var("OTEL_ENDPOINT").or(file.otel_endpoint),
            log_level: var("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Settings for coordinator `index` of `worker_count`.
    ///
    /// `explicit` (e.g. a command-line flag) beats the configured identity.
    /// With more than one coordinator per process each gets a `-<index>`
    /// suffix so their identities stay distinct.
    pub fn coordinator(&self, explicit: Option<&str>, index: usize, now_ms: i64) -> CoordinatorConfig {
        let base = WorkerId::resolve(explicit, self.worker_id.as_deref(), now_ms);
        let worker_id = if self.worker_count > 1 {
            WorkerId(format!("{base}-{index}"))
        } else {
            base
        };
        CoordinatorConfig {
            worker_id,
            lease_ttl: self.lease_ttl,
            tick_interval: self.lock_rate,
        }
    }

    pub fn producer(&self) -> ProducerConfig {
        ProducerConfig {
            interval: self.producer_rate,
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
    }
}
