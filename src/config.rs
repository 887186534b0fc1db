use std::fs::File;
use std::path::Path;
use std::time::Duration;

use failure::ResultExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};

use crate::errors::*;
use crate::MODEL_VERSION;

pub const DEFAULT_CACHE_SIZE: &str = "850mb";

lazy_static! {
    static ref BYTE_SIZE: Regex =
        Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(b|kb|mb|gb|tb)?\s*$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum estimated size of the loaded models, e.g. "850mb"
    pub cache_size: String,
    pub retry: RetryConfig,
    /// Maximum number of numeric tasks running at the same time
    pub training_workers: usize,
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE.to_string(),
            retry: RetryConfig::default(),
            training_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            engine_version: MODEL_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_file = File::open(path.as_ref()).with_context(|_| {
            format!("Cannot open engine config file '{:?}'", path.as_ref())
        })?;
        let config: EngineConfig = serde_json::from_reader(config_file)
            .with_context(|_| "Cannot deserialize engine config json data")?;
        Ok(config)
    }

    /// Cache capacity in bytes, falling back to the default size when the configured value
    /// cannot be parsed
    pub fn cache_size_bytes(&self) -> usize {
        parse_byte_size(&self.cache_size)
            .filter(|size| *size > 0)
            .or_else(|| parse_byte_size(DEFAULT_CACHE_SIZE))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    /// milliseconds
    pub initial_backoff: u64,
    /// milliseconds
    pub max_backoff: u64,
    /// milliseconds
    pub operation_timeout: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: 100,
            max_backoff: 2000,
            operation_timeout: 30000,
        }
    }
}

impl RetryConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout)
    }

    /// Delay to wait before the given retry, starting at 1
    pub fn backoff(&self, retry: usize) -> Duration {
        let factor = 1u64 << (retry.saturating_sub(1).min(16) as u32);
        Duration::from_millis(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

/// Parses human readable sizes such as "850mb" or "1.5gb", using 1024 based units
pub fn parse_byte_size(size: &str) -> Option<usize> {
    let lowercased = size.to_lowercase();
    let caps = BYTE_SIZE.captures(&lowercased)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = match caps.get(2).map(|m| m.as_str()) {
        None | Some("b") => 1f64,
        Some("kb") => 1024f64,
        Some("mb") => 1024f64.powi(2),
        Some("gb") => 1024f64.powi(3),
        Some("tb") => 1024f64.powi(4),
        Some(_) => return None,
    };
    Some((value * unit).abs().floor() as usize)
}
