//! Runtime tunables: default gstack size, guard-page size, and the
//! per-thread stack-cache high-water mark.
//!
//! This mirrors the teacher crate's style of exposing tunables as plain
//! constructor arguments with sane defaults rather than a config-file
//! format; there is no on-disk configuration to load.

use crate::error::ConfigError;
use crate::stack::page_size;

/// Tunable parameters for the gstack provider.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub default_gstack_size: usize,
    pub guard_size: usize,
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_gstack_size: 1024 * 1024,
            guard_size: page_size(),
            cache_capacity: 8,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Checks that the configured sizes are internally consistent and at
    /// least one page, the only form of caller-supplied misconfiguration
    /// this crate treats as recoverable (see §7 of the design doc).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = page_size();
        if self.default_gstack_size < page {
            return Err(ConfigError::StackTooSmall {
                requested: self.default_gstack_size,
                minimum: page,
            });
        }
        if self.guard_size < page {
            return Err(ConfigError::GuardTooSmall {
                requested: self.guard_size,
                minimum: page,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigBuilder {
    default_gstack_size: Option<usize>,
    guard_size: Option<usize>,
    cache_capacity: Option<usize>,
}

impl ConfigBuilder {
    pub fn default_gstack_size(mut self, size: usize) -> Self {
        self.default_gstack_size = Some(size);
        self
    }

    pub fn guard_size(mut self, size: usize) -> Self {
        self.guard_size = Some(size);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            default_gstack_size: self.default_gstack_size.unwrap_or(defaults.default_gstack_size),
            guard_size: self.guard_size.unwrap_or(defaults.guard_size),
            cache_capacity: self.cache_capacity.unwrap_or(defaults.cache_capacity),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn undersized_stack_is_rejected() {
        let err = Config::builder().default_gstack_size(16).build().unwrap_err();
        assert!(matches!(err, ConfigError::StackTooSmall { .. }));
    }
}
