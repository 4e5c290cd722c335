use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::engine::{CapacityPolicy, DEFAULT_WEEKLY_CAPACITY};
use crate::model::Hours;

pub const WAL_FILE_NAME: &str = "caplevel.wal";

/// Server settings, read once at startup from `CAPLEVEL_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Prometheus listener; metrics are off when unset.
    pub metrics_port: Option<u16>,
    pub default_weekly_capacity: Hours,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            default_weekly_capacity: DEFAULT_WEEKLY_CAPACITY,
        }
    }
}

/// Parse `key`, falling back to `default` (with a warning) when malformed.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring {key}={raw:?}: not a valid value");
            default
        }),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let default_weekly_capacity = match lookup("CAPLEVEL_DEFAULT_WEEKLY_CAPACITY") {
            None => d.default_weekly_capacity,
            Some(raw) => match Hours::parse(raw.trim()) {
                Ok(h) if h.is_positive() && h <= crate::limits::MAX_HOURS_PER_WEEK => h,
                _ => {
                    warn!("ignoring CAPLEVEL_DEFAULT_WEEKLY_CAPACITY={raw:?}: expected hours in (0, 168]");
                    d.default_weekly_capacity
                }
            },
        };
        let metrics_port = lookup("CAPLEVEL_METRICS_PORT").and_then(|raw| match raw.trim().parse() {
            Ok(port) => Some(port),
            Err(_) => {
                warn!("ignoring CAPLEVEL_METRICS_PORT={raw:?}: not a port");
                None
            }
        });

        Self {
            bind: lookup("CAPLEVEL_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "CAPLEVEL_PORT", d.port),
            data_dir: lookup("CAPLEVEL_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&lookup, "CAPLEVEL_MAX_CONNECTIONS", d.max_connections).max(1),
            compact_threshold: parsed(&lookup, "CAPLEVEL_COMPACT_THRESHOLD", d.compact_threshold),
            metrics_port,
            default_weekly_capacity,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn capacity_policy(&self) -> CapacityPolicy {
        CapacityPolicy::new(self.default_weekly_capacity)
    }
}
