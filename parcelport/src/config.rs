//! Runtime configuration.

use crate::error::{Error, Result};

/// Default protection domain name.
pub const DEFAULT_DOMAIN: &str = "ib/mlx4_0";

/// Default ranking against other transports.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Parcelport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the protection domain to open.
    pub domain: String,
    /// Scatter the zero-copy chunk list instead of serializing it into the
    /// payload. Accepted for forward compatibility; must be off.
    pub zero_copy_optimization: bool,
    /// Ranking against other transports.
    pub priority: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            zero_copy_optimization: false,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl Config {
    /// Configuration for the given domain, defaults otherwise.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }

    /// Reject option combinations the transport cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.zero_copy_optimization {
            return Err(Error::ZeroCopyUnsupported);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.domain, "ib/mlx4_0");
        assert!(!config.zero_copy_optimization);
        assert_eq!(config.priority, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_copy_rejected() {
        let config = Config {
            zero_copy_optimization: true,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
