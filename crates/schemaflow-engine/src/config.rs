use std::path::Path;

use anyhow::{Context, Result};
use schemaflow_core::EngineError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCOPE: &str = "default";

/// Engine-wide settings. Run policies fall back to these when a field is unset.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Name of the target schema; one run lock exists per scope.
    pub schema_scope: String,
    pub default_timeout_seconds: Option<u64>,
    pub default_seed_batch_size: u32,
    pub max_batch_size: u32,
    pub history_page_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_scope: DEFAULT_SCOPE.to_string(),
            default_timeout_seconds: Some(300),
            default_seed_batch_size: 500,
            max_batch_size: 10_000,
            history_page_limit: 50,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`EngineError::Validation`] when a field is out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schema_scope.trim().is_empty() {
            return Err(EngineError::Validation(
                "schema_scope MUST be non-empty".to_string(),
            ));
        }
        if self.default_timeout_seconds == Some(0) {
            return Err(EngineError::Validation(
                "default_timeout_seconds MUST be >= 1 when set".to_string(),
            ));
        }
        if self.default_seed_batch_size == 0 || self.max_batch_size == 0 {
            return Err(EngineError::Validation(
                "batch sizes MUST be >= 1".to_string(),
            ));
        }
        if self.default_seed_batch_size > self.max_batch_size {
            return Err(EngineError::Validation(format!(
                "default_seed_batch_size ({}) MUST be <= max_batch_size ({})",
                self.default_seed_batch_size, self.max_batch_size
            )));
        }
        if self.history_page_limit == 0 {
            return Err(EngineError::Validation(
                "history_page_limit MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a JSON config file; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamps a requested seed batch size into `1..=max_batch_size`.
    #[must_use]
    pub fn effective_batch_size(&self, requested: Option<u32>) -> usize {
        let size = requested
            .unwrap_or(self.default_seed_batch_size)
            .clamp(1, self.max_batch_size);
        usize::try_from(size).unwrap_or(usize::MAX)
    }
}
