//! Service configuration.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::Context;

/// Prefix of every environment override, e.g. `TABLEDEX_MAX_INDEX_COUNT`.
pub const ENV_PREFIX: &str = "TABLEDEX_";

/// Tunables shared by the table services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableServiceConfig {
    /// Byte budget of one result page; bounds the rows per page.
    pub max_bytes_per_request: u64,
    /// How long a consistent read waits for the table lock.
    pub read_lock_timeout_ms: u64,
    /// A table left processing longer than this is rebuilt again.
    pub processing_timeout_ms: u64,
    /// Maximum number of user columns carrying an index.
    pub max_index_count: usize,
    /// Values returned per enumeration facet.
    pub facet_value_limit: u64,
    /// Interval between rebuild worker ticks.
    pub rebuild_tick_interval_ms: u64,
    /// Bounded capacity of the rebuild request channel.
    pub rebuild_channel_capacity: usize,
}

impl Default for TableServiceConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_request: 1024 * 1024,
            read_lock_timeout_ms: 60_000,
            processing_timeout_ms: 10 * 60 * 1000,
            max_index_count: 60,
            facet_value_limit: 100,
            rebuild_tick_interval_ms: 60_000,
            rebuild_channel_capacity: 256,
        }
    }
}

impl TableServiceConfig {
    /// Defaults overridden by `TABLEDEX_<FIELD>` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable when a value does not parse.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `TABLEDEX_<FIELD>` key.
    ///
    /// # Errors
    ///
    /// Returns an error naming the key when a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_bytes_per_request: read(&lookup, "MAX_BYTES_PER_REQUEST", defaults.max_bytes_per_request)?,
            read_lock_timeout_ms: read(&lookup, "READ_LOCK_TIMEOUT_MS", defaults.read_lock_timeout_ms)?,
            processing_timeout_ms: read(&lookup, "PROCESSING_TIMEOUT_MS", defaults.processing_timeout_ms)?,
            max_index_count: read(&lookup, "MAX_INDEX_COUNT", defaults.max_index_count)?,
            facet_value_limit: read(&lookup, "FACET_VALUE_LIMIT", defaults.facet_value_limit)?,
            rebuild_tick_interval_ms: read(
                &lookup,
                "REBUILD_TICK_INTERVAL_MS",
                defaults.rebuild_tick_interval_ms,
            )?,
            rebuild_channel_capacity: read(
                &lookup,
                "REBUILD_CHANNEL_CAPACITY",
                defaults.rebuild_channel_capacity,
            )?,
        })
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, field: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{ENV_PREFIX}{field}");
    match lookup(&key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        None => Ok(default),
    }
}
