//! Balancer configuration
//!
//! Tunables read at each balance invocation. Loaded from environment
//! variables with production defaults, validated before use.

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("min_capacity_used_ratio {0} must be below max_capacity_used_ratio {1}")]
    InvertedCapacityBand(f64, f64),
}

/// Balancer tunables
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Lower used-ratio bound for considering a store a drain source.
    pub min_capacity_used_ratio: f64,

    /// Upper used-ratio bound for considering a store a fill target.
    pub max_capacity_used_ratio: f64,

    /// Cap on snapshots a source store may be sending concurrently.
    pub max_sending_snap_count: u32,

    /// Cap on snapshots a target store may be receiving concurrently.
    pub max_receiving_snap_count: u32,

    /// Minimum fractional score improvement required to commit a move.
    pub max_diff_score_fraction: f64,

    /// Executor polling rounds a leader transfer may wait before timing out.
    pub max_wait_count: u32,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            min_capacity_used_ratio: 0.4,
            max_capacity_used_ratio: 0.9,
            max_sending_snap_count: 3,
            max_receiving_snap_count: 3,
            max_diff_score_fraction: 0.1,
            max_wait_count: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

impl BalanceConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cfg = Self {
            min_capacity_used_ratio: env_parse(
                "BALANCE_MIN_CAPACITY_USED_RATIO",
                defaults.min_capacity_used_ratio,
            )?,
            max_capacity_used_ratio: env_parse(
                "BALANCE_MAX_CAPACITY_USED_RATIO",
                defaults.max_capacity_used_ratio,
            )?,
            max_sending_snap_count: env_parse(
                "BALANCE_MAX_SENDING_SNAP_COUNT",
                defaults.max_sending_snap_count,
            )?,
            max_receiving_snap_count: env_parse(
                "BALANCE_MAX_RECEIVING_SNAP_COUNT",
                defaults.max_receiving_snap_count,
            )?,
            max_diff_score_fraction: env_parse(
                "BALANCE_MAX_DIFF_SCORE_FRACTION",
                defaults.max_diff_score_fraction,
            )?,
            max_wait_count: env_parse("BALANCE_MAX_WAIT_COUNT", defaults.max_wait_count)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the balancer cannot act on sensibly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = |name: &str, value: f64| {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    value.to_string(),
                ));
            }
            Ok(())
        };

        ratio("min_capacity_used_ratio", self.min_capacity_used_ratio)?;
        ratio("max_capacity_used_ratio", self.max_capacity_used_ratio)?;
        ratio("max_diff_score_fraction", self.max_diff_score_fraction)?;

        if self.min_capacity_used_ratio >= self.max_capacity_used_ratio {
            return Err(ConfigError::InvertedCapacityBand(
                self.min_capacity_used_ratio,
                self.max_capacity_used_ratio,
            ));
        }

        if self.max_wait_count == 0 {
            return Err(ConfigError::InvalidValue(
                "max_wait_count".to_string(),
                "0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = BalanceConfig::default();
        assert_eq!(cfg.min_capacity_used_ratio, 0.4);
        assert_eq!(cfg.max_capacity_used_ratio, 0.9);
        assert_eq!(cfg.max_sending_snap_count, 3);
        assert_eq!(cfg.max_receiving_snap_count, 3);
        assert_eq!(cfg.max_diff_score_fraction, 0.1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_ratio() {
        let cfg = BalanceConfig {
            max_diff_score_fraction: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue(name, _)) if name == "max_diff_score_fraction"
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_band() {
        let cfg = BalanceConfig {
            min_capacity_used_ratio: 0.9,
            max_capacity_used_ratio: 0.4,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvertedCapacityBand(..))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_wait_count() {
        let cfg = BalanceConfig {
            max_wait_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
