//! Runtime Configuration
//!
//! Tunables for the cache/batch manager. Defaults are conservative; the
//! process runtime reads overrides from `XSC_*` environment variables.

use core::time::Duration;

use crate::request::PolicyTable;

/// Default validity window of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(10);
/// Default number of live cache entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;
/// Default largest payload kept per entry, in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;
/// Default largest coalesced batch.
pub const DEFAULT_MAX_BATCH: usize = 32;

/// Configuration for one runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Serve cacheable reads from the transition cache.
    pub cache_enabled: bool,
    /// Entries older than this are misses.
    pub cache_ttl: Duration,
    /// Live entry bound.
    pub cache_capacity: usize,
    /// Results with larger payloads are not cached.
    pub max_payload: usize,
    /// Coalescing count threshold.
    pub max_batch: usize,
    /// How long a leader lingers for more writes once others are waiting.
    pub coalesce_window: Duration,
    /// Operation classification.
    pub policy: PolicyTable,
}

impl RuntimeConfig {
    /// Defaults overridden by the process environment.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(enabled) = parse::<u8>(&lookup, "XSC_CACHE") {
            config.cache_enabled = enabled != 0;
        }
        if let Some(us) = parse::<u64>(&lookup, "XSC_CACHE_TTL_US") {
            config.cache_ttl = Duration::from_micros(us);
        }
        if let Some(capacity) = parse(&lookup, "XSC_CACHE_CAPACITY") {
            config.cache_capacity = capacity;
        }
        if let Some(bytes) = parse(&lookup, "XSC_CACHE_MAX_PAYLOAD") {
            config.max_payload = bytes;
        }
        if let Some(batch) = parse(&lookup, "XSC_MAX_BATCH") {
            config = config.with_max_batch(batch);
        }
        if let Some(us) = parse::<u64>(&lookup, "XSC_COALESCE_WINDOW_US") {
            config.coalesce_window = Duration::from_micros(us);
        }

        config
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the coalescing count threshold (at least one).
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_batch: DEFAULT_MAX_BATCH,
            coalesce_window: Duration::ZERO,
            policy: PolicyTable::default(),
        }
    }
}

fn parse<T: core::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(target: "xsc::config", "ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults_without_env() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.max_batch, DEFAULT_MAX_BATCH);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("XSC_CACHE", "0"),
            ("XSC_CACHE_TTL_US", "250"),
            ("XSC_MAX_BATCH", "0"),
            ("XSC_COALESCE_WINDOW_US", " 40 "),
        ]));
        assert!(!config.cache_enabled);
        assert_eq!(config.cache_ttl, Duration::from_micros(250));
        assert_eq!(config.max_batch, 1);
        assert_eq!(config.coalesce_window, Duration::from_micros(40));
    }

    #[test]
    fn test_bad_value_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[("XSC_CACHE_CAPACITY", "lots")]));
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }
}
