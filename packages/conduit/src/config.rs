use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::error::ConduitError;
use crate::router::RouterSettings;

/// Engine configuration.
///
/// Every component receives its settings from here; nothing reads the
/// environment on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bound of each per-destination priority queue.
    pub queue_capacity: usize,
    /// Bound of each destination's delivery path.
    pub path_capacity: usize,
    pub tick_interval: Duration,
    /// Failed delivery attempts after which a unit is dropped.
    pub max_recirculations: u32,
    /// TTL applied to units emitted without one.
    pub default_unit_ttl: Duration,
    /// TTL of dedup locks taken by `store_once`.
    pub lock_ttl: Duration,
    pub lock_sweep_interval: Duration,
    /// Reed-Solomon data shards (`k`).
    pub data_shards: usize,
    /// Reed-Solomon parity shards (`m`).
    pub parity_shards: usize,
    pub primary_database_url: Option<String>,
    pub secondary_database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            path_capacity: 64,
            tick_interval: Duration::from_millis(50),
            max_recirculations: 3,
            default_unit_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(60),
            lock_sweep_interval: Duration::from_secs(5),
            data_shards: 4,
            parity_shards: 2,
            primary_database_url: None,
            secondary_database_url: None,
        }
    }
}

impl Config {
    /// Load configuration from `CONDUIT_*` environment variables.
    ///
    /// Unset variables keep their defaults. Durations are in milliseconds.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let config = Self {
            queue_capacity: parse_var("CONDUIT_QUEUE_CAPACITY", defaults.queue_capacity)?,
            path_capacity: parse_var("CONDUIT_PATH_CAPACITY", defaults.path_capacity)?,
            tick_interval: millis_var("CONDUIT_TICK_INTERVAL_MS", defaults.tick_interval)?,
            max_recirculations: parse_var(
                "CONDUIT_MAX_RECIRCULATIONS",
                defaults.max_recirculations,
            )?,
            default_unit_ttl: millis_var("CONDUIT_DEFAULT_UNIT_TTL_MS", defaults.default_unit_ttl)?,
            lock_ttl: millis_var("CONDUIT_LOCK_TTL_MS", defaults.lock_ttl)?,
            lock_sweep_interval: millis_var(
                "CONDUIT_LOCK_SWEEP_INTERVAL_MS",
                defaults.lock_sweep_interval,
            )?,
            data_shards: parse_var("CONDUIT_DATA_SHARDS", defaults.data_shards)?,
            parity_shards: parse_var("CONDUIT_PARITY_SHARDS", defaults.parity_shards)?,
            primary_database_url: env::var("CONDUIT_PRIMARY_DATABASE_URL").ok(),
            secondary_database_url: env::var("CONDUIT_SECONDARY_DATABASE_URL").ok(),
        };

        config.validate().context("Invalid conduit configuration")?;
        Ok(config)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_path_capacity(mut self, capacity: usize) -> Self {
        self.path_capacity = capacity;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_recirculations(mut self, max: u32) -> Self {
        self.max_recirculations = max;
        self
    }

    pub fn with_default_unit_ttl(mut self, ttl: Duration) -> Self {
        self.default_unit_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_sweep_interval(mut self, interval: Duration) -> Self {
        self.lock_sweep_interval = interval;
        self
    }

    pub fn with_shards(mut self, data_shards: usize, parity_shards: usize) -> Self {
        self.data_shards = data_shards;
        self.parity_shards = parity_shards;
        self
    }

    /// Reject settings no engine can run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.queue_capacity == 0 {
            return Err(ConduitError::validation("queue_capacity", "must be at least 1"));
        }
        if self.path_capacity == 0 {
            return Err(ConduitError::validation("path_capacity", "must be at least 1"));
        }
        if self.max_recirculations == 0 {
            return Err(ConduitError::validation(
                "max_recirculations",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("tick_interval", self.tick_interval),
            ("default_unit_ttl", self.default_unit_ttl),
            ("lock_ttl", self.lock_ttl),
            ("lock_sweep_interval", self.lock_sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConduitError::validation(field, "must be greater than zero"));
            }
        }
        if self.data_shards == 0 || self.parity_shards == 0 {
            return Err(ConduitError::validation(
                "shards",
                "data and parity shard counts must be at least 1",
            ));
        }
        if self.data_shards + self.parity_shards > 255 {
            return Err(ConduitError::validation("shards", "at most 255 shards in total"));
        }
        Ok(())
    }

    pub(crate) fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            queue_capacity: self.queue_capacity,
            path_capacity: self.path_capacity,
            max_recirculations: self.max_recirculations,
            default_unit_ttl: self.default_unit_ttl,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(name, default_ms).map(Duration::from_millis)
}
