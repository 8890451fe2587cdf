use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::StorageError;
use crate::metastore::Durability;

const ONE_KB: u64 = 1024;
const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
/// Upper bound for every scheduling delay, keeps deadline arithmetic in range.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Immutable configuration of a storage engine instance.
///
/// Sizes accept either a plain byte count or a human-readable string such as
/// `"512MB"`. Durations accept a number of seconds or a string with a `ms`,
/// `s`, `m` or `h` suffix.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Number of data slices per generation.
    pub k: usize,
    /// Number of coding slices per generation.
    pub m: usize,
    pub alignment: usize,
    pub cache_dir: PathBuf,
    pub meta_dir: PathBuf,
    #[serde(deserialize_with = "de_byte_size")]
    pub cache_max_size: u64,
    #[serde(deserialize_with = "de_duration")]
    pub sync_interval: Duration,
    /// A dirty entry is only synced once it has not been written for this long.
    #[serde(deserialize_with = "de_duration")]
    pub sync_quiet_period: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub retry_base_delay: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub retry_max_delay: Duration,
    pub flush_max_attempts: u32,
    /// Upper bound for every single remote operation.
    #[serde(deserialize_with = "de_duration")]
    pub remote_timeout: Duration,
    /// Slices downloaded beyond k when reconstructing an object.
    pub extra_reads: usize,
    pub sync_concurrency: usize,
    pub durability: Durability,
    pub backends: Vec<BackendConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            alignment: crate::erasure::DEFAULT_ALIGNMENT,
            cache_dir: PathBuf::from("./cache"),
            meta_dir: PathBuf::from("./meta"),
            cache_max_size: ONE_KB.pow(3),
            sync_interval: Duration::from_secs(30),
            sync_quiet_period: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            flush_max_attempts: 5,
            remote_timeout: Duration::from_secs(30),
            extra_reads: 0,
            sync_concurrency: 4,
            durability: Durability::default(),
            backends: Vec::new(),
        }
    }
}

impl StorageConfig {
    /// Load the configuration from a TOML file and validate it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            StorageError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, StorageError> {
        let config: StorageConfig = toml::from_str(content)
            .map_err(|e| StorageError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.k == 0 || self.m == 0 {
            return Err(StorageError::Configuration(format!(
                "k and m must both be at least 1 (k = {}, m = {})",
                self.k, self.m
            )));
        }
        if self.k + self.m > 256 {
            return Err(StorageError::Configuration(format!(
                "k + m must not exceed 256 (got {})",
                self.k + self.m
            )));
        }
        if self.alignment == 0 {
            return Err(StorageError::Configuration("alignment must be at least 1".into()));
        }
        if self.flush_max_attempts == 0 {
            return Err(StorageError::Configuration(
                "flush_max_attempts must be at least 1".into(),
            ));
        }
        if self.sync_concurrency == 0 {
            return Err(StorageError::Configuration(
                "sync_concurrency must be at least 1".into(),
            ));
        }
        if self.remote_timeout.is_zero() {
            return Err(StorageError::Configuration("remote_timeout must not be zero".into()));
        }
        for (name, delay) in [
            ("sync_interval", self.sync_interval),
            ("sync_quiet_period", self.sync_quiet_period),
            ("retry_max_delay", self.retry_max_delay),
            ("remote_timeout", self.remote_timeout),
        ] {
            if delay > MAX_DELAY {
                return Err(StorageError::Configuration(format!(
                    "{} must not exceed {} days",
                    name,
                    MAX_DELAY.as_secs() / 86_400
                )));
            }
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(StorageError::Configuration(
                "retry_base_delay must not exceed retry_max_delay".into(),
            ));
        }

        let mut ids = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !ids.insert(backend.id()) {
                return Err(StorageError::Configuration(format!(
                    "Duplicated backend id '{}'",
                    backend.id()
                )));
            }
        }
        Ok(())
    }
}

/// One remote store, tagged by its `type`.
///
/// ```toml
/// [[backends]]
/// type = "local"
/// id = "disk1"
/// root = "/mnt/disk1/slices"
/// max_size = "10GB"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        id: String,
        root: PathBuf,
        #[serde(deserialize_with = "de_byte_size")]
        max_size: u64,
    },
    Memory {
        id: String,
        #[serde(default = "default_memory_capacity", deserialize_with = "de_byte_size")]
        capacity: u64,
    },
}

fn default_memory_capacity() -> u64 {
    ONE_KB.pow(3)
}

impl BackendConfig {
    pub fn id(&self) -> &str {
        match self {
            BackendConfig::Local { id, .. } | BackendConfig::Memory { id, .. } => id,
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.id().trim().is_empty() {
            return Err(StorageError::Configuration("Backend id must not be empty".into()));
        }
        match self {
            BackendConfig::Local { id, root, max_size } => {
                if root.as_os_str().is_empty() {
                    return Err(StorageError::Configuration(format!(
                        "Local backend '{}' has no root directory",
                        id
                    )));
                }
                if *max_size == 0 {
                    return Err(StorageError::Configuration(format!(
                        "Local backend '{}' needs a max_size",
                        id
                    )));
                }
            }
            BackendConfig::Memory { id, capacity } => {
                if *capacity == 0 {
                    return Err(StorageError::Configuration(format!(
                        "Memory backend '{}' needs a capacity",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parses a human-readable, 1024-based size such as `"512MB"`, `"10 GB"` or `"4096"`.
pub fn parse_byte_size(size: &str) -> Result<u64, StorageError> {
    let invalid = || StorageError::Configuration(format!("Invalid human-readable size '{}'", size));

    let trimmed = size.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let coeff: u64 = digits.parse().map_err(|_| invalid())?;

    let unit = unit.trim().to_ascii_uppercase();
    let exp = if unit.is_empty() {
        0
    } else {
        UNITS.iter().position(|u| *u == unit).ok_or_else(invalid)? as u32
    };
    coeff.checked_mul(ONE_KB.pow(exp)).ok_or_else(invalid)
}

/// Formats a byte count the way [`parse_byte_size`] reads it, rounding up to
/// two decimals.
pub fn format_byte_size(size: u64) -> String {
    let mut exp = 0;
    while exp + 1 < UNITS.len() && size / ONE_KB.pow(exp as u32 + 1) > 0 {
        exp += 1;
    }
    if exp == 0 {
        return format!("{} B", size);
    }
    let value = size as f64 / ONE_KB.pow(exp as u32) as f64;
    format!("{:.2} {}", (value * 100.0).ceil() / 100.0, UNITS[exp])
}

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, StorageError> {
    let invalid = || StorageError::Configuration(format!("Invalid duration '{}'", value));

    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => amount.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn de_byte_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(Duration::from_secs(n)),
        NumberOrText::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}
