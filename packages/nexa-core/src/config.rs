use nexa_scheduler::ExpirationConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid scheduler config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("frame budget must be positive, got {0}ms")]
    FrameBudget(f64),
    #[error("nested update limit must be at least 1")]
    NestedUpdateLimit,
}

/// Tunables for a [`crate::WorkScheduler`]. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub expiration: ExpirationConfig,
    /// Time an async pass may run before yielding to the host.
    pub frame_budget_ms: f64,
    /// Fallback delay for boundaries that don't set their own.
    pub default_fallback_timeout_ms: f64,
    /// How long a suspension with no boundary may block before the host is told.
    pub missing_boundary_timeout_ms: f64,
    /// Passes allowed in one `perform_work` call before giving up.
    pub nested_update_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiration: ExpirationConfig::default(),
            frame_budget_ms: 5.0,
            default_fallback_timeout_ms: 0.0,
            missing_boundary_timeout_ms: 5000.0,
            nested_update_limit: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_budget_ms.is_nan() || self.frame_budget_ms <= 0.0 {
            return Err(ConfigError::FrameBudget(self.frame_budget_ms));
        }
        if self.nested_update_limit == 0 {
            return Err(ConfigError::NestedUpdateLimit);
        }
        Ok(())
    }
}
