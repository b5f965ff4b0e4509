//! Environment configuration of the `scaler` binary.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use maestro_id::{ClusterName, FleetId, IdError, Version};
use thiserror::Error;

use crate::backend::RoleStatus;
use crate::capacity::{CapacityConfig, ScalingPolicy, DEFAULT_METRIC_WINDOW, DEFAULT_SCALE_METRIC};

/// Default location of the local backend state file.
pub const DEFAULT_STATE_FILE: &str = ".maestro/state.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var}: {source}")]
    InvalidName {
        var: &'static str,
        #[source]
        source: IdError,
    },

    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("MIN_WEIGHT ({min}) is greater than MAX_WEIGHT ({max})")]
    InvertedBounds { min: u32, max: u32 },
}

/// Configuration of one scheduled scaler tick.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub cluster: ClusterName,
    pub version: Version,
    pub fleet: FleetId,
    pub capacity: CapacityConfig,
    pub state_file: PathBuf,
    pub log_level: String,
}

impl ScalerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cluster = required_name(&lookup, "CLUSTER_NAME")?;
        let version = required_name(&lookup, "VERSION")?;
        let fleet = required_name(&lookup, "SPOT_FLEET")?;

        let defaults = ScalingPolicy::default();
        let policy = ScalingPolicy {
            threshold_in: parsed(&lookup, "SCALE_IN_THRESHOLD", defaults.threshold_in)?,
            threshold_out: parsed(&lookup, "SCALE_OUT_THRESHOLD", defaults.threshold_out)?,
            scale_in_amount: step(&lookup, "SCALE_IN_AMOUNT", defaults.scale_in_amount)?,
            scale_out_amount: step(&lookup, "SCALE_OUT_AMOUNT", defaults.scale_out_amount)?,
            min_weight: parsed(&lookup, "MIN_WEIGHT", defaults.min_weight)?,
            max_weight: parsed(&lookup, "MAX_WEIGHT", defaults.max_weight)?,
            cooldown: Duration::from_secs(parsed(
                &lookup,
                "SCALE_COOLDOWN",
                defaults.cooldown.as_secs(),
            )?),
        };
        if policy.min_weight > policy.max_weight {
            return Err(ConfigError::InvertedBounds {
                min: policy.min_weight,
                max: policy.max_weight,
            });
        }

        let enabled = lookup("ENABLED")
            .map(|v| str2bool(&v))
            .unwrap_or(true);

        let fallback_status = match lookup("STATUS") {
            Some(raw) => raw.parse::<RoleStatus>().map_err(|reason| ConfigError::Invalid {
                var: "STATUS",
                value: raw,
                reason,
            })?,
            None => RoleStatus::Active,
        };

        let capacity = CapacityConfig {
            policy,
            enabled,
            fallback_status,
            metric: lookup("SCALE_METRIC").unwrap_or_else(|| DEFAULT_SCALE_METRIC.to_string()),
            metric_window: Duration::from_secs(parsed(
                &lookup,
                "METRIC_WINDOW_SECS",
                DEFAULT_METRIC_WINDOW.as_secs(),
            )?),
        };

        let state_file = lookup("MAESTRO_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));

        let log_level = lookup("MAESTRO_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            cluster,
            version,
            fleet,
            capacity,
            state_file,
            log_level,
        })
    }
}

/// `yes`, `true`, `t` and `1` (any case) are true; everything else is false.
pub fn str2bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "yes" | "true" | "t" | "1"
    )
}

fn required_name<F, T>(lookup: &F, var: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr<Err = IdError>,
{
    let raw = lookup(var).ok_or(ConfigError::Missing(var))?;
    raw.parse()
        .map_err(|source| ConfigError::InvalidName { var, source })
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    let result: Result<T, T::Err> = raw.trim().parse();
    result.map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value: raw,
    })
}

/// A step size; zero is rejected.
fn step<F>(lookup: &F, var: &'static str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parsed(lookup, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("CLUSTER_NAME", "kloudcover"),
        ("VERSION", "39d7327"),
        ("SPOT_FLEET", "sfr-0123"),
    ];

    #[test]
    fn test_defaults() {
        let config = ScalerConfig::from_vars(vars(&BASE)).unwrap();

        assert_eq!(config.cluster.as_str(), "kloudcover");
        assert_eq!(config.capacity, CapacityConfig::default());
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("SCALE_IN_THRESHOLD", "9.5"),
            ("SCALE_OUT_AMOUNT", "3"),
            ("MAX_WEIGHT", "20"),
            ("SCALE_COOLDOWN", "60"),
            ("ENABLED", "no"),
            ("STATUS", "inactive"),
            ("SCALE_METRIC", "Scheduled Percentage"),
        ]);

        let config = ScalerConfig::from_vars(vars(&pairs)).unwrap();
        let capacity = config.capacity;

        assert_eq!(capacity.policy.threshold_in, 9.5);
        assert_eq!(capacity.policy.scale_out_amount, 3);
        assert_eq!(capacity.policy.max_weight, 20);
        assert_eq!(capacity.policy.cooldown, Duration::from_secs(60));
        assert!(!capacity.enabled);
        assert_eq!(capacity.fallback_status, RoleStatus::Inactive);
        assert_eq!(capacity.metric, "Scheduled Percentage");
    }

    #[test]
    fn test_missing_required() {
        let err = ScalerConfig::from_vars(vars(&BASE[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SPOT_FLEET"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut pairs = BASE.to_vec();
        pairs.push(("SCALE_IN_AMOUNT", "0"));
        assert!(matches!(
            ScalerConfig::from_vars(vars(&pairs)),
            Err(ConfigError::Invalid { var: "SCALE_IN_AMOUNT", .. })
        ));

        let mut pairs = BASE.to_vec();
        pairs.extend([("MIN_WEIGHT", "5"), ("MAX_WEIGHT", "2")]);
        assert_eq!(
            ScalerConfig::from_vars(vars(&pairs)).unwrap_err(),
            ConfigError::InvertedBounds { min: 5, max: 2 }
        );

        let mut pairs = BASE.to_vec();
        pairs.push(("STATUS", "paused"));
        assert!(ScalerConfig::from_vars(vars(&pairs)).is_err());
    }

    #[rstest]
    #[case("yes", true)]
    #[case("TRUE", true)]
    #[case("t", true)]
    #[case("1", true)]
    #[case("no", false)]
    #[case("false", false)]
    #[case("", false)]
    fn test_str2bool(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(str2bool(raw), expected);
    }
}
