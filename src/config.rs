use crate::error::{HookError, Result};

/// Slots allocated per hook when nothing else is configured.
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// How far from a code target the allocator looks for a block that a
/// `jmp rel32` can reach.
pub const DEFAULT_NEAR_SEARCH_RADIUS: usize = 0x4000_0000;

pub const ENV_POOL_CAPACITY: &str = "UNIHOOK_POOL_CAPACITY";
pub const ENV_NEAR_RADIUS: &str = "UNIHOOK_NEAR_RADIUS";
pub const ENV_DEBUG: &str = "UNIHOOK_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorConfig {
    /// Maximum number of threads that may be inside one hook at once.
    pub pool_capacity: usize,
    pub near_search_radius: usize,
    /// Hex-dump every generated trampoline at trace level.
    pub dump_code: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            near_search_radius: DEFAULT_NEAR_SEARCH_RADIUS,
            dump_code: false,
        }
    }
}

impl InterceptorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_near_search_radius(mut self, radius: usize) -> Self {
        self.near_search_radius = radius;
        self
    }

    pub fn with_dump_code(mut self, enabled: bool) -> Self {
        self.dump_code = enabled;
        self
    }

    /// Defaults overridden by `UNIHOOK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_POOL_CAPACITY) {
            config.pool_capacity = parse_usize(ENV_POOL_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_NEAR_RADIUS) {
            config.near_search_radius = parse_usize(ENV_NEAR_RADIUS, &value)?;
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            config.dump_code = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.pool_capacity)?;
        // A block further away than this cannot be reached by `jmp rel32`.
        if self.near_search_radius > i32::MAX as usize {
            return Err(HookError::InvalidConfig(format!(
                "near search radius {:#x} exceeds {:#x}",
                self.near_search_radius,
                i32::MAX
            )));
        }
        Ok(())
    }
}

/// Per-hook settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOptions {
    /// Overrides `InterceptorConfig::pool_capacity` for this hook.
    pub capacity: Option<usize>,
    /// Stored in the hook record's `extra` field.
    pub extra: usize,
}

impl HookOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_extra(mut self, extra: usize) -> Self {
        self.extra = extra;
        self
    }
}

pub(crate) fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(HookError::InvalidConfig("pool capacity must be at least 1".to_string()));
    }
    // Every slot is allocated up front.
    if capacity > 0x10_0000 {
        return Err(HookError::InvalidConfig(format!("pool capacity {} is too large", capacity)));
    }
    Ok(())
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse::<usize>(),
    };
    parsed.map_err(|e| HookError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = InterceptorConfig::default();
        assert_eq!(config.pool_capacity, 32);
        assert!(!config.dump_code);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = InterceptorConfig::from_lookup(lookup(&[
            (ENV_POOL_CAPACITY, "4"),
            (ENV_NEAR_RADIUS, "0x100000"),
            (ENV_DEBUG, "true"),
        ]))
        .unwrap();
        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.near_search_radius, 0x100000);
        assert!(config.dump_code);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = InterceptorConfig::from_lookup(lookup(&[(ENV_POOL_CAPACITY, "0")])).unwrap_err();
        assert!(matches!(err, HookError::InvalidConfig(_)));
        assert!(InterceptorConfig::new().with_pool_capacity(0).validate().is_err());
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = InterceptorConfig::from_lookup(lookup(&[(ENV_POOL_CAPACITY, "many")])).unwrap_err();
        assert!(matches!(err, HookError::InvalidConfig(_)));
    }

    #[test]
    fn unreachable_radius_is_rejected() {
        let config = InterceptorConfig::new().with_near_search_radius(0x8000_0000);
        assert!(matches!(config.validate(), Err(HookError::InvalidConfig(_))));
        assert!(InterceptorConfig::new().with_near_search_radius(0x7fff_ffff).validate().is_ok());

        let err = InterceptorConfig::from_lookup(lookup(&[(ENV_NEAR_RADIUS, "0x100000000")])).unwrap_err();
        assert!(matches!(err, HookError::InvalidConfig(_)));
    }
}
