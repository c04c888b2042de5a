//! Client-wide defaults applied to every connection a factory opens.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Idle transfer handles kept for reuse.
    pub pool_capacity: usize,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    /// Comma-separated resolver addresses handed to the engine.
    pub dns_servers: Option<String>,
    pub network_interface: Option<String>,
    /// Log every transfer at debug level.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            follow_redirects: true,
            max_redirects: 20,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            dns_servers: None,
            network_interface: None,
            debug: false,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Other(format!("invalid client config: {e}")))
    }

    /// Defaults overlaid with `HOTHTTP_DEBUG`, `HOTHTTP_POOL_CAPACITY` and
    /// `HOTHTTP_MAX_REDIRECTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup("HOTHTTP_DEBUG") {
            config.debug = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(value) = lookup("HOTHTTP_POOL_CAPACITY") {
            config.pool_capacity = parse_var("HOTHTTP_POOL_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("HOTHTTP_MAX_REDIRECTS") {
            config.max_redirects = parse_var("HOTHTTP_MAX_REDIRECTS", &value)?;
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Other(format!("{key}: invalid value {value:?}")))
}
