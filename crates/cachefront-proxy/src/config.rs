use arc_swap::ArcSwap;
use cachefront::{FilterConfig, VaryAllowList};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// How long in-flight origin fetches may keep filling the cache after
    /// the servers stop.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    /// Deadline for the response headers. Streaming bodies are not cut.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: u64,
    #[serde(default = "default_entry_expiry")]
    pub entry_expiry_seconds: u64,
    #[serde(default)]
    pub allowed_vary_headers: Vec<String>,
    #[serde(default)]
    pub ignore_request_cache_control_header: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }
}

impl CacheConfig {
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            allow_list: VaryAllowList::new(&self.allowed_vary_headers),
            ignore_request_cache_control: self.ignore_request_cache_control_header,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_entries: default_max_entries(),
            max_body_size_bytes: default_max_body_size(),
            entry_expiry_seconds: default_entry_expiry(),
            allowed_vary_headers: Vec::new(),
            ignore_request_cache_control_header: false,
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Vary allow-list or request cache-control handling changed → swap the
///   filter config; requests already in flight keep the old one
/// - Store sizing or enablement changed → WARN log, ignore (restart required)
///
/// Returns whether the filter config was replaced.
pub fn diff_and_apply(old: &Config, new: &Config, filter_config: &ArcSwap<FilterConfig>) -> bool {
    if old.cache.max_entries != new.cache.max_entries
        || old.cache.max_body_size_bytes != new.cache.max_body_size_bytes
        || old.cache.entry_expiry_seconds != new.cache.entry_expiry_seconds
        || old.cache.enabled != new.cache.enabled
    {
        tracing::warn!(
            old_max_entries = old.cache.max_entries,
            new_max_entries = new.cache.max_entries,
            "cache store change detected, ignoring. Restart to resize the cache safely"
        );
    }

    if old.upstream.url != new.upstream.url || old.server.listen_addr != new.server.listen_addr {
        tracing::warn!("server or upstream address change detected, ignoring until restart");
    }

    if old.cache.allowed_vary_headers != new.cache.allowed_vary_headers
        || old.cache.ignore_request_cache_control_header
            != new.cache.ignore_request_cache_control_header
    {
        filter_config.store(Arc::new(new.cache.filter_config()));
        tracing::info!(
            vary = ?new.cache.allowed_vary_headers,
            ignore_request_cache_control = new.cache.ignore_request_cache_control_header,
            "config reloaded: filter config changed"
        );
        return true;
    }
    false
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_drain_grace_ms() -> u64 {
    5000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_enabled() -> bool {
    true
}
fn default_max_entries() -> usize {
    10000
}
fn default_max_body_size() -> u64 {
    1_048_576
}
fn default_entry_expiry() -> u64 {
    300
}
