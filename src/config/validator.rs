// Config Validation
// Strict mode validates config at startup and fails fast with actionable errors

use crate::config::config::HostConfig;
use crate::config::types::{HostError, Result};

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config at startup
pub fn validate_config(config: &HostConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_allocator(config, &mut result);
    validate_pool(config, &mut result);
    validate_bridge(config, &mut result);
    validate_sandbox(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if config.strict_mode && !result.is_valid() {
        let error_msg = format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        );
        return Err(HostError::Config(error_msg));
    }

    for error in &result.errors {
        log::error!("config: {}", error);
    }

    Ok(result)
}

fn validate_allocator(config: &HostConfig, result: &mut ValidationResult) {
    let a = &config.allocator;

    if a.process_budget_bytes == 0 {
        result.add_error("allocator.process_budget_bytes cannot be zero".to_string());
    }
    if a.max_allocation_bytes == 0 {
        result.add_error("allocator.max_allocation_bytes cannot be zero".to_string());
    }
    if a.max_allocation_bytes > a.process_budget_bytes {
        result.add_warning(format!(
            "allocator.max_allocation_bytes ({}) exceeds process budget ({}); the budget gate will bind first",
            a.max_allocation_bytes, a.process_budget_bytes
        ));
    }
    if a.inline_threshold_bytes > a.max_allocation_bytes {
        result.add_error(format!(
            "allocator.inline_threshold_bytes ({}) exceeds max_allocation_bytes ({})",
            a.inline_threshold_bytes, a.max_allocation_bytes
        ));
    }
    if a.inline_threshold_bytes > 16 * 1024 * 1024 {
        result.add_warning(format!(
            "allocator.inline_threshold_bytes {} is very high; large heap buffers fragment the heap",
            a.inline_threshold_bytes
        ));
    }
}

fn validate_pool(config: &HostConfig, result: &mut ValidationResult) {
    let p = &config.pool;

    if p.max_contexts == 0 {
        result.add_error("pool.max_contexts must be at least 1".to_string());
    }
    if p.min_idle > p.max_contexts {
        result.add_error(format!(
            "pool.min_idle ({}) exceeds pool.max_contexts ({})",
            p.min_idle, p.max_contexts
        ));
    }
    if p.acquire_timeout_ms == 0 {
        result.add_warning("pool.acquire_timeout_ms is 0: acquire never waits".to_string());
    }
}

fn validate_bridge(config: &HostConfig, result: &mut ValidationResult) {
    let b = &config.bridge;

    if b.worker_threads == 0 {
        result.add_error("bridge.worker_threads must be at least 1".to_string());
    }
    if b.max_response_bytes == 0 {
        result.add_error("bridge.max_response_bytes cannot be zero".to_string());
    }
    if b.default_timeout_ms == 0 {
        result.add_warning("bridge.default_timeout_ms is 0: operations have no hard timeout".to_string());
    }
}

fn validate_sandbox(config: &HostConfig, result: &mut ValidationResult) {
    let s = &config.sandbox;

    if s.forbidden_globals.is_empty() && s.pivots.is_empty() {
        result.add_error("sandbox policy removes nothing".to_string());
    }
    for pivot in &s.pivots {
        if pivot.properties.is_empty() {
            result.add_error(format!("sandbox pivot {} has no property chain", pivot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&HostConfig::default()).unwrap();
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_strict_mode_fails_fast() {
        let mut config = HostConfig::default();
        config.strict_mode = true;
        config.pool.max_contexts = 0;
        assert!(matches!(validate_config(&config), Err(HostError::Config(_))));
    }

    #[test]
    fn test_permissive_mode_reports_errors() {
        let mut config = HostConfig::default();
        config.pool.min_idle = 10;
        config.pool.max_contexts = 2;
        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_inline_threshold_above_ceiling_is_error() {
        let mut config = HostConfig::default();
        config.allocator.inline_threshold_bytes = config.allocator.max_allocation_bytes + 1;
        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("inline_threshold_bytes"));

        config.strict_mode = true;
        assert!(matches!(validate_config(&config), Err(HostError::Config(_))));
    }
}
