//! Environment-derived configuration.
//!
//! All recognized variables are read through an injectable lookup function,
//! so nothing in the core depends on process globals and tests can supply
//! their own environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, ConfigResult};

pub const ENV_ENGINE_PATH: &str = "MAESTRO_ENGINE_PATH";
pub const ENV_TEMPLATES_PATH: &str = "MAESTRO_TEMPLATES_PATH";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET_KEY";
pub const ENV_BYPASS_ALERT_THRESHOLD: &str = "BYPASS_ALERT_THRESHOLD";
pub const ENV_MAX_REMEDIATION_ITERATIONS: &str = "MAX_REMEDIATION_ITERATIONS";
pub const ENV_DEFAULT_NODE_TIMEOUT_SECONDS: &str = "DEFAULT_NODE_TIMEOUT_SECONDS";

/// Configuration recognized by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaestroConfig {
    pub engine_path: Option<PathBuf>,
    pub templates_path: Option<PathBuf>,
    pub jwt_secret: Option<String>,
    pub bypass_alert_threshold: Option<f64>,
    pub max_remediation_iterations: Option<u32>,
    pub default_node_timeout_secs: Option<u64>,
}

impl MaestroConfig {
    /// Read from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let parse_f64 = |key: &str| -> ConfigResult<Option<f64>> {
            lookup(key)
                .map(|raw| {
                    raw.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("'{}' is not a number", raw),
                    })
                })
                .transpose()
        };
        let parse_u32 = |key: &str| -> ConfigResult<Option<u32>> {
            lookup(key)
                .map(|raw| {
                    raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("'{}' is not a non-negative integer", raw),
                    })
                })
                .transpose()
        };
        let parse_u64 = |key: &str| -> ConfigResult<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("'{}' is not a non-negative integer", raw),
                    })
                })
                .transpose()
        };

        Ok(Self {
            engine_path: lookup(ENV_ENGINE_PATH).map(PathBuf::from),
            templates_path: lookup(ENV_TEMPLATES_PATH).map(PathBuf::from),
            jwt_secret: lookup(ENV_JWT_SECRET),
            bypass_alert_threshold: parse_f64(ENV_BYPASS_ALERT_THRESHOLD)?,
            max_remediation_iterations: parse_u32(ENV_MAX_REMEDIATION_ITERATIONS)?,
            default_node_timeout_secs: parse_u64(ENV_DEFAULT_NODE_TIMEOUT_SECONDS)?,
        })
    }

    /// Effective node timeout, defaulting to 600 seconds.
    pub fn node_timeout_secs(&self) -> u64 {
        self.default_node_timeout_secs.unwrap_or(600)
    }

    /// Effective remediation budget, defaulting to 3 iterations.
    pub fn remediation_iterations(&self) -> u32 {
        self.max_remediation_iterations.unwrap_or(3)
    }

    /// Default data directory for registries and logs.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("maestro"))
            .unwrap_or_else(|| PathBuf::from(".maestro"))
    }
}
