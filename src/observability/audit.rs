/// Security event logging for hostpool
/// Provides structured logging of isolation-relevant events for incident response
///
/// Every event carries correlation ids (context, generation, operation) so a
/// discard or a leak can be traced back to the request that caused it.
use crate::config::types::{AbortReason, ContextId, Generation, HostError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use uuid::Uuid;

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Allocator
    AllocationRefused,
    LeakReclaimed,

    // Sandbox
    SandboxApplied,
    SandboxViolation,

    // Pool lifecycle
    ContextCreated,
    ContextDiscarded,
    PoolExhausted,

    // Bridge
    OperationAborted,
    OperationTimedOut,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::AllocationRefused => SecuritySeverity::Medium,
            SecurityEventType::LeakReclaimed => SecuritySeverity::Medium,
            SecurityEventType::SandboxApplied => SecuritySeverity::Low,
            SecurityEventType::SandboxViolation => SecuritySeverity::Critical,
            SecurityEventType::ContextCreated => SecuritySeverity::Low,
            SecurityEventType::ContextDiscarded => SecuritySeverity::High,
            SecurityEventType::PoolExhausted => SecuritySeverity::High,
            SecurityEventType::OperationAborted => SecuritySeverity::Low,
            SecurityEventType::OperationTimedOut => SecuritySeverity::Medium,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Unique id of this event record
    pub event_id: String,
    /// Execution context the event belongs to
    pub context_id: String,
    /// Context generation at the time of the event
    pub generation: Option<Generation>,
    /// Bridge operation id, for cancellation events
    pub operation_id: Option<u64>,
}

impl CorrelationIds {
    pub fn new(context: ContextId) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            context_id: context.to_string(),
            generation: None,
            operation_id: None,
        }
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_operation(mut self, operation_id: u64) -> Self {
        self.operation_id = Some(operation_id);
        self
    }
}

/// Individual security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub bytes: Option<usize>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        let severity = event_type.default_severity();
        Self {
            event_type,
            severity,
            timestamp: Utc::now(),
            details,
            correlation: None,
            bytes: None,
        }
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// Render as one JSON line for the audit trail
    pub fn to_json_line(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });

        if let Some(correlation) = &self.correlation {
            entry["correlation"] =
                serde_json::to_value(correlation).unwrap_or(serde_json::Value::Null);
        }
        if let Some(bytes) = self.bytes {
            entry["bytes"] = serde_json::json!(bytes);
        }
        entry
    }
}

fn emit_to_log(event: &SecurityEvent) {
    match event.severity {
        SecuritySeverity::Critical => {
            error!("SECURITY CRITICAL: {:?} - {}", event.event_type, event.details)
        }
        SecuritySeverity::High => {
            error!("SECURITY HIGH: {:?} - {}", event.event_type, event.details)
        }
        SecuritySeverity::Medium => {
            warn!("SECURITY MEDIUM: {:?} - {}", event.event_type, event.details)
        }
        SecuritySeverity::Low => {
            info!("SECURITY LOW: {:?} - {}", event.event_type, event.details)
        }
    }
}

/// Security logger that handles both structured logging and the audit trail
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    /// Open (append) the audit trail at `audit_path`
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HostError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_path)
            .map_err(|e| HostError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn log_security_event(&self, event: &SecurityEvent) {
        emit_to_log(event);

        let line = event.to_json_line();
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    error!("Failed to write to audit log: {}", e);
                }
                if let Err(e) = file.flush() {
                    error!("Failed to flush audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on audit log"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

/// Global security logger instance
static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global security logger.
///
/// Without a path, events only go through the `log` facade.
pub fn init_security_logger(audit_path: Option<&Path>) -> Result<()> {
    let Some(path) = audit_path else {
        info!("Audit trail disabled; security events go to the log only");
        return Ok(());
    };

    let logger = SecurityLogger::new(path)?;
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!("Security logger already initialized");
    } else {
        info!("Security audit trail at {}", path.display());
    }
    Ok(())
}

/// Log a security event using the global logger
pub fn log_security_event(event: SecurityEvent) {
    match SECURITY_LOGGER.get() {
        Some(logger) => logger.log_security_event(&event),
        None => emit_to_log(&event),
    }
}

/// Convenience functions for common security events
pub mod events {
    use super::*;

    pub fn allocation_refused(owner: ContextId, detail: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::AllocationRefused,
            format!("Allocation refused: {}", detail),
        )
        .with_correlation(CorrelationIds::new(owner));
        log_security_event(event);
    }

    pub fn leak_reclaimed(owner: ContextId, count: usize, bytes: usize) {
        let event = SecurityEvent::new(
            SecurityEventType::LeakReclaimed,
            format!("Reclaimed {} leaked buffers ({} bytes) on reset", count, bytes),
        )
        .with_correlation(CorrelationIds::new(owner))
        .with_bytes(bytes);
        log_security_event(event);
    }

    pub fn sandbox_applied(context: ContextId, removed: usize, severed: usize) {
        let event = SecurityEvent::new(
            SecurityEventType::SandboxApplied,
            format!(
                "Capability sandbox sealed: {} globals removed, {} pivots severed",
                removed, severed
            ),
        )
        .with_correlation(CorrelationIds::new(context));
        log_security_event(event);
    }

    pub fn sandbox_violation(context: ContextId, generation: Generation, detail: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::SandboxViolation,
            format!("Sandbox verification failed: {}", detail),
        )
        .with_correlation(CorrelationIds::new(context).with_generation(generation));
        log_security_event(event);
    }

    pub fn context_created(context: ContextId) {
        let event = SecurityEvent::new(
            SecurityEventType::ContextCreated,
            "Execution context created".to_string(),
        )
        .with_correlation(CorrelationIds::new(context));
        log_security_event(event);
    }

    pub fn context_discarded(context: ContextId, generation: Generation, reason: &str) {
        let event = SecurityEvent::new(
            SecurityEventType::ContextDiscarded,
            format!("Execution context discarded: {}", reason),
        )
        .with_correlation(CorrelationIds::new(context).with_generation(generation));
        log_security_event(event);
    }

    pub fn pool_exhausted(waited: Duration, max_contexts: usize) {
        let event = SecurityEvent::new(
            SecurityEventType::PoolExhausted,
            format!(
                "No context available after {:?} ({} contexts at capacity)",
                waited, max_contexts
            ),
        );
        log_security_event(event);
    }

    pub fn operation_aborted(context: ContextId, operation_id: u64, reason: AbortReason) {
        let event = SecurityEvent::new(
            SecurityEventType::OperationAborted,
            format!("Operation {} aborted ({})", operation_id, reason),
        )
        .with_correlation(CorrelationIds::new(context).with_operation(operation_id));
        log_security_event(event);
    }

    pub fn operation_timed_out(context: ContextId, operation_id: u64, timeout: Duration) {
        let event = SecurityEvent::new(
            SecurityEventType::OperationTimedOut,
            format!("Operation {} hit its {:?} timeout", operation_id, timeout),
        )
        .with_correlation(CorrelationIds::new(context).with_operation(operation_id));
        log_security_event(event);
    }
}
