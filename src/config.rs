//! Configuration from environment variables with defaults and validation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub limits: LimitConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// How long graceful shutdown waits for in-flight requests.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Empty selects the in-memory store.
    pub database_url: Option<String>,
    /// Only consulted when a durable store is configured.
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub max_per_cell: Decimal,
    pub max_correlated: Decimal,
    pub cell_prefix_len: usize,
    /// Denominator of the portfolio margin-utilization percentage.
    pub margin_limit: Decimal,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            cache_ttl_secs: 60,
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_per_cell: dec!(1000),
            max_correlated: dec!(5000),
            cell_prefix_len: 5,
            margin_limit: dec!(10000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            limits: LimitConfig::default(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults on anything missing or unparsable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(port) = env_nonempty("PORT") {
            config.server.port = port.parse().unwrap_or(config.server.port);
        }

        config.store.database_url = env_nonempty("DATABASE_URL");
        config.store.redis_url = env_nonempty("REDIS_URL");
        if let Some(ttl) = env_nonempty("CACHE_TTL_SECS") {
            config.store.cache_ttl_secs = ttl.parse().unwrap_or(config.store.cache_ttl_secs);
        }

        if let Some(v) = env_nonempty("MAX_PER_CELL") {
            config.limits.max_per_cell = v.parse().unwrap_or(config.limits.max_per_cell);
        }
        if let Some(v) = env_nonempty("MAX_CORRELATED") {
            config.limits.max_correlated = v.parse().unwrap_or(config.limits.max_correlated);
        }
        if let Some(v) = env_nonempty("CELL_PREFIX_LEN") {
            config.limits.cell_prefix_len = v.parse().unwrap_or(config.limits.cell_prefix_len);
        }
        if let Some(v) = env_nonempty("MARGIN_LIMIT") {
            config.limits.margin_limit = v.parse().unwrap_or(config.limits.margin_limit);
        }

        config.validate();
        config
    }

    fn validate(&mut self) {
        let defaults = LimitConfig::default();

        if self.limits.max_per_cell <= Decimal::ZERO {
            tracing::warn!(value = %self.limits.max_per_cell, "invalid MAX_PER_CELL, using default");
            self.limits.max_per_cell = defaults.max_per_cell;
        }
        if self.limits.max_correlated <= Decimal::ZERO {
            tracing::warn!(value = %self.limits.max_correlated, "invalid MAX_CORRELATED, using default");
            self.limits.max_correlated = defaults.max_correlated;
        }
        if self.limits.cell_prefix_len == 0 {
            tracing::warn!("CELL_PREFIX_LEN must be at least 1, using default");
            self.limits.cell_prefix_len = defaults.cell_prefix_len;
        }
        if self.limits.margin_limit <= Decimal::ZERO {
            tracing::warn!(value = %self.limits.margin_limit, "invalid MARGIN_LIMIT, using default");
            self.limits.margin_limit = defaults.margin_limit;
        }
        if self.store.cache_ttl_secs == 0 {
            tracing::warn!("CACHE_TTL_SECS must be positive, using default");
            self.store.cache_ttl_secs = StoreConfig::default().cache_ttl_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert!(config.store.database_url.is_none());
        assert_eq!(config.limits.max_per_cell, dec!(1000));
        assert_eq!(config.limits.cell_prefix_len, 5);
    }

    #[test]
    fn validate_resets_nonsense_limits() {
        let mut config = Config::default();
        config.limits.max_per_cell = dec!(-1);
        config.limits.cell_prefix_len = 0;
        config.validate();
        assert_eq!(config.limits.max_per_cell, dec!(1000));
        assert_eq!(config.limits.cell_prefix_len, 5);
    }
}
