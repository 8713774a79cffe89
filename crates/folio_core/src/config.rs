//! Compendium cache and configuration settings.

use std::time::Duration;

/// Seconds an unaccessed compendium document stays cached.
pub const CACHE_LIFETIME_SECONDS: u64 = 300;

/// Settings entry holding `{private, locked}` per pack collection key.
pub const CONFIG_SETTING: &str = "core.compendiumConfiguration";

/// Package name of packs owned by the world itself.
pub const WORLD_PACKAGE: &str = "world";

/// Cache behaviour of one compendium pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackCacheConfig {
    /// Time since last access after which a cached document is evicted.
    pub lifetime: Duration,
    /// Period of the background sweep; `None` relies on lazy eviction only.
    pub sweep_interval: Option<Duration>,
}

impl Default for PackCacheConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(CACHE_LIFETIME_SECONDS),
            sweep_interval: None,
        }
    }
}

impl PackCacheConfig {
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::PackCacheConfig;
    use std::time::Duration;

    #[test]
    fn default_lifetime_is_five_minutes() {
        let config = PackCacheConfig::default();
        assert_eq!(config.lifetime, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, None);
    }
}
