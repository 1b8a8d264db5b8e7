use anyhow::{Context, Result, bail};
use relaymux_pool::PoolConfig;
use relaymux_pool::config::{
    DEFAULT_BACKOFF_RESET, DEFAULT_CLIENT_QUEUE, DEFAULT_COMPLETION_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DEDUP_TTL, DEFAULT_MAPPING_TTL, DEFAULT_MAX_ATTEMPTS,
};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_CACHE_SWEEP_MS: u64 = 30_000;

// Proxy service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Downstream websocket listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Upstream relay URLs, normalised and deduplicated.
    pub relays: Vec<String>,
    pub max_attempts: u32,
    pub backoff_reset_ms: u64,
    pub dedup_ttl_ms: u64,
    pub mapping_ttl_ms: u64,
    // Deadline for end-of-stored-events and acknowledgement aggregation.
    pub completion_timeout_ms: u64,
    // Deliveries after which end-of-stored-events is sent early.
    pub event_limit: Option<usize>,
    pub client_queue: usize,
    pub connect_timeout_ms: u64,
    pub cache_max_entries: Option<usize>,
    pub cache_sweep_ms: u64,
    // External cache endpoint; not supported by this build.
    pub cache_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    relays: Option<Vec<String>>,
    max_attempts: Option<u32>,
    backoff_reset_ms: Option<u64>,
    dedup_ttl_ms: Option<u64>,
    mapping_ttl_ms: Option<u64>,
    completion_timeout_ms: Option<u64>,
    event_limit: Option<usize>,
    client_queue: Option<usize>,
    connect_timeout_ms: Option<u64>,
    cache_max_entries: Option<usize>,
    cache_sweep_ms: Option<u64>,
    cache_url: Option<String>,
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

/// Split, trim and deduplicate relay URLs. Only ws:// and wss:// are accepted.
pub fn parse_relays<I, S>(values: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut relays: Vec<String> = Vec::new();
    for value in values {
        let url = value.as_ref().trim().trim_end_matches('/');
        if url.is_empty() {
            continue;
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!("relay url must use ws:// or wss://: {url}");
        }
        if !relays.iter().any(|existing| existing == url) {
            relays.push(url.to_string());
        }
    }
    Ok(relays)
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("RELAYMUX_BIND")
            .unwrap_or_else(|_| "0.0.0.0:3333".to_string())
            .parse()
            .with_context(|| "parse RELAYMUX_BIND")?;
        let metrics_bind = std::env::var("RELAYMUX_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse RELAYMUX_METRICS_BIND")?;
        let relays = match std::env::var("RELAYMUX_RELAYS") {
            Ok(value) => parse_relays(value.split(',')).with_context(|| "parse RELAYMUX_RELAYS")?,
            Err(_) => Vec::new(),
        };
        let max_attempts = std::env::var("RELAYMUX_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        Ok(Self {
            bind,
            metrics_bind,
            relays,
            max_attempts,
            backoff_reset_ms: env_u64("RELAYMUX_BACKOFF_RESET_MS")
                .unwrap_or(DEFAULT_BACKOFF_RESET.as_millis() as u64),
            dedup_ttl_ms: env_u64("RELAYMUX_DEDUP_TTL_MS")
                .unwrap_or(DEFAULT_DEDUP_TTL.as_millis() as u64),
            mapping_ttl_ms: env_u64("RELAYMUX_MAPPING_TTL_MS")
                .unwrap_or(DEFAULT_MAPPING_TTL.as_millis() as u64),
            completion_timeout_ms: env_u64("RELAYMUX_COMPLETION_TIMEOUT_MS")
                .unwrap_or(DEFAULT_COMPLETION_TIMEOUT.as_millis() as u64),
            event_limit: env_usize("RELAYMUX_EVENT_LIMIT"),
            client_queue: env_usize("RELAYMUX_CLIENT_QUEUE").unwrap_or(DEFAULT_CLIENT_QUEUE),
            connect_timeout_ms: env_u64("RELAYMUX_CONNECT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64),
            cache_max_entries: env_usize("RELAYMUX_CACHE_MAX_ENTRIES"),
            cache_sweep_ms: env_u64("RELAYMUX_CACHE_SWEEP_MS").unwrap_or(DEFAULT_CACHE_SWEEP_MS),
            cache_url: std::env::var("RELAYMUX_CACHE_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("RELAYMUX_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read RELAYMUX_CONFIG: {path}"))?;
            let override_cfg: ProxyConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse proxy config yaml")?;
            config.apply(override_cfg)?;
        }
        if config.relays.is_empty() {
            bail!("no relays configured (set RELAYMUX_RELAYS or `relays` in RELAYMUX_CONFIG)");
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ProxyConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(values) = override_cfg.relays {
            self.relays = parse_relays(values).with_context(|| "parse relays")?;
        }
        if let Some(value) = override_cfg.max_attempts
            && value > 0
        {
            self.max_attempts = value;
        }
        if let Some(value) = override_cfg.backoff_reset_ms
            && value > 0
        {
            self.backoff_reset_ms = value;
        }
        if let Some(value) = override_cfg.dedup_ttl_ms
            && value > 0
        {
            self.dedup_ttl_ms = value;
        }
        if let Some(value) = override_cfg.mapping_ttl_ms
            && value > 0
        {
            self.mapping_ttl_ms = value;
        }
        if let Some(value) = override_cfg.completion_timeout_ms
            && value > 0
        {
            self.completion_timeout_ms = value;
        }
        if let Some(value) = override_cfg.event_limit
            && value > 0
        {
            self.event_limit = Some(value);
        }
        if let Some(value) = override_cfg.client_queue
            && value > 0
        {
            self.client_queue = value;
        }
        if let Some(value) = override_cfg.connect_timeout_ms
            && value > 0
        {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = override_cfg.cache_max_entries
            && value > 0
        {
            self.cache_max_entries = Some(value);
        }
        if let Some(value) = override_cfg.cache_sweep_ms
            && value > 0
        {
            self.cache_sweep_ms = value;
        }
        if let Some(value) = override_cfg.cache_url {
            self.cache_url = Some(value);
        }
        Ok(())
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_ms)
    }

    /// Plain values for the pool.
    pub fn to_pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig::new(self.relays.clone());
        pool.max_attempts = self.max_attempts;
        pool.backoff_reset = Duration::from_millis(self.backoff_reset_ms);
        pool.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        pool.dedup_ttl = Duration::from_millis(self.dedup_ttl_ms);
        pool.mapping_ttl = Duration::from_millis(self.mapping_ttl_ms);
        pool.completion_timeout = Duration::from_millis(self.completion_timeout_ms);
        pool.event_limit = self.event_limit;
        pool.client_queue = self.client_queue;
        pool
    }
}
