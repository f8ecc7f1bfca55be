//! Runtime configuration
//!
//! Library defaults with environment overrides. The config consulted by
//! the runtime is a process-wide value: `install` it once before creating
//! fibers, or let the first use load it from the environment.

use std::sync::OnceLock;

use weft_core::{WeftError, WeftResult};

/// Default fiber stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack the runtime will allocate.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default connect timeout handed to socket-layer users of the timer
/// primitive, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Runtime configuration.
///
/// `from_env()` starts from the library defaults and applies any
/// environment overrides:
/// - `WEFT_STACK_SIZE` - stack size in bytes for fibers created with size 0
/// - `WEFT_CONNECT_TIMEOUT_MS` - connect timeout consumed by socket layers
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for fibers constructed with a size of 0.
    pub stack_size: usize,
    /// Connect timeout exposed to collaborators built on the timer
    /// primitive. The core itself never reads it.
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> WeftResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(WeftError::Config("stack_size must be >= 16 KiB"));
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration. Returns an error if a config
/// was already installed (including implicitly by first use) or if the
/// values fail validation.
pub fn install(config: RuntimeConfig) -> WeftResult<()> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| WeftError::Config("runtime config already installed"))
}

/// The process-wide configuration, loading it from the environment on
/// first use.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        if let Err(e) = config.validate() {
            tracing::error!("ignoring invalid runtime config from env: {}", e);
            return RuntimeConfig::new();
        }
        config
    })
}

/// Parse an environment variable, falling back to `default` when the
/// variable is unset or unparsable.
fn env_get<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new().stack_size(256 * 1024);
        assert_eq!(config.stack_size, 256 * 1024);
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig::new().stack_size(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_get_fallback() {
        assert_eq!(env_get("WEFT_TEST_UNSET_VAR", 7usize), 7);
    }
}
