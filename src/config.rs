//! Loop configuration
//!
//! Plain data with defaults, loadable from TOML. Every field is optional in
//! the document.
//!
//! ```toml
//! name = "io-loop"
//! batch_size = 256
//! intake_capacity = 4096
//! ```
//!
//! Author: Moroya Sakamoto

use serde::Deserialize;

use crate::error::LoopError;

/// Smallest accepted bounded intake
pub const MIN_INTAKE_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// Thread name and tracing span field
    pub name: String,
    /// Max intake messages accepted per tick
    pub batch_size: usize,
    /// `None` for an unbounded intake
    pub intake_capacity: Option<usize>,
    /// Longest park when nothing is pending (ms, > 0)
    pub idle_park_ms: u64,
    /// Cancelling a derived future also cancels its upstream
    pub propagate_cancel: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "alice-loop".to_string(),
            batch_size: 1024,
            intake_capacity: None,
            idle_park_ms: 10,
            propagate_cancel: false,
        }
    }
}

impl LoopConfig {
    /// Named default configuration
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, LoopError> {
        let config: LoopConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoopError> {
        if self.name.is_empty() {
            return Err(LoopError::Config("name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(LoopError::Config("batch_size must be positive".into()));
        }
        if self.idle_park_ms == 0 {
            return Err(LoopError::Config("idle_park_ms must be positive".into()));
        }
        if let Some(capacity) = self.intake_capacity {
            if capacity < MIN_INTAKE_CAPACITY {
                return Err(LoopError::Config(format!(
                    "intake_capacity must be at least {MIN_INTAKE_CAPACITY}, got {capacity}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 1024);
        assert!(config.intake_capacity.is_none());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = LoopConfig::from_toml_str("name = \"io\"\nintake_capacity = 64\n").unwrap();
        assert_eq!(config.name, "io");
        assert_eq!(config.intake_capacity, Some(64));
        assert_eq!(config.idle_park_ms, 10);
    }

    #[test]
    fn test_from_toml_empty() {
        assert_eq!(LoopConfig::from_toml_str("").unwrap(), LoopConfig::default());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let err = LoopConfig::from_toml_str("batch_size = 0").unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_idle_park() {
        let err = LoopConfig::from_toml_str("idle_park_ms = 0").unwrap_err();
        assert!(matches!(err, LoopError::Config(msg) if msg.contains("idle_park_ms")));
    }

    #[test]
    fn test_rejects_tiny_capacity() {
        let config = LoopConfig {
            intake_capacity: Some(1),
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_field() {
        assert!(LoopConfig::from_toml_str("threads = 4").is_err());
    }

    #[test]
    fn test_named() {
        assert_eq!(LoopConfig::named("timer").name, "timer");
    }
}
