//! Engine configuration
//!
//! All numeric defaults are a tunable baseline. Configuration is read from
//! TOML and then overridden from `PROCFLOW_*` environment variables.

use crate::retry::CallPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub coverage: CoverageConfig,
    pub matching: MatchingConfig,
    pub units: UnitConfig,
    pub balance: BalanceConfig,
    pub calls: CallPolicy,
}

/// Thresholds of the evidence stop rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub process_threshold: f64,
    pub exchange_value_threshold: f64,
    /// Both deltas below this count as a plateau.
    pub plateau_delta: f64,
    pub max_iterations: u32,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            process_threshold: 0.5,
            exchange_value_threshold: 0.6,
            plateau_delta: 0.1,
            max_iterations: 3,
        }
    }
}

/// Which candidate selector the matcher is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// Text-generator selection with similarity fallback.
    #[default]
    Model,
    Similarity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub max_candidates: usize,
    pub similarity_floor: f64,
    pub max_parallel_searches: usize,
    pub selector: SelectorKind,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            similarity_floor: 0.35,
            max_parallel_searches: 4,
            selector: SelectorKind::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub density_conversion: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            density_conversion: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub ok_ratio: f64,
    pub check_ratio: f64,
    pub min_counted: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            ok_ratio: 0.05,
            check_ratio: 0.3,
            min_counted: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment variable {name}={value:?} is not valid")]
    InvalidEnv { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Loading
// ============================================================================

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overrides from any key/value source (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "PROCFLOW_PROCESS_THRESHOLD", &mut self.coverage.process_threshold)?;
        override_with(
            &lookup,
            "PROCFLOW_EXCHANGE_VALUE_THRESHOLD",
            &mut self.coverage.exchange_value_threshold,
        )?;
        override_with(&lookup, "PROCFLOW_PLATEAU_DELTA", &mut self.coverage.plateau_delta)?;
        override_with(&lookup, "PROCFLOW_MAX_ITERATIONS", &mut self.coverage.max_iterations)?;
        override_with(&lookup, "PROCFLOW_MAX_CANDIDATES", &mut self.matching.max_candidates)?;
        override_with(&lookup, "PROCFLOW_SIMILARITY_FLOOR", &mut self.matching.similarity_floor)?;
        override_with(
            &lookup,
            "PROCFLOW_MAX_PARALLEL_SEARCHES",
            &mut self.matching.max_parallel_searches,
        )?;
        override_with(&lookup, "PROCFLOW_DENSITY_CONVERSION", &mut self.units.density_conversion)?;
        override_with(&lookup, "PROCFLOW_BALANCE_OK_RATIO", &mut self.balance.ok_ratio)?;
        override_with(&lookup, "PROCFLOW_BALANCE_CHECK_RATIO", &mut self.balance.check_ratio)?;
        override_with(&lookup, "PROCFLOW_CALL_TIMEOUT_MS", &mut self.calls.timeout_ms)?;
        override_with(&lookup, "PROCFLOW_MAX_RETRIES", &mut self.calls.max_retries)?;
        override_with(&lookup, "PROCFLOW_RETRY_BACKOFF_MS", &mut self.calls.retry_backoff_ms)?;

        if let Some(value) = lookup("PROCFLOW_SELECTOR") {
            self.matching.selector = match value.trim().to_ascii_lowercase().as_str() {
                "model" => SelectorKind::Model,
                "similarity" => SelectorKind::Similarity,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "PROCFLOW_SELECTOR".to_string(),
                        value,
                    })
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        ratio("coverage.process_threshold", self.coverage.process_threshold)?;
        ratio("coverage.exchange_value_threshold", self.coverage.exchange_value_threshold)?;
        ratio("coverage.plateau_delta", self.coverage.plateau_delta)?;
        ratio("matching.similarity_floor", self.matching.similarity_floor)?;
        ratio("balance.ok_ratio", self.balance.ok_ratio)?;
        ratio("balance.check_ratio", self.balance.check_ratio)?;

        if self.coverage.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "coverage.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.balance.ok_ratio > self.balance.check_ratio {
            return Err(ConfigError::Invalid(
                "balance.ok_ratio must not exceed balance.check_ratio".to_string(),
            ));
        }
        if self.matching.max_candidates == 0 || self.matching.max_parallel_searches == 0 {
            return Err(ConfigError::Invalid(
                "matching.max_candidates and matching.max_parallel_searches must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn override_with<T, F>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(name) {
        *slot = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.clone(),
        })?;
    }
    Ok(())
}
