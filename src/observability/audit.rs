/// Audit event logging for launches
///
/// Every event is one JSON object emitted on the `jailbox::audit` log target
/// and, when configured, appended as a line to a JSONL audit file.
use crate::config::types::{
    ExecutionResult, LimitKind, Result, SandboxError, TeardownReport,
};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const AUDIT_TARGET: &str = "jailbox::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LaunchStart,
    SetupFailure,
    LimitViolation,
    Cancellation,
    Teardown,
    FinalStatus,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::LaunchStart | AuditEventType::FinalStatus => AuditSeverity::Low,
            AuditEventType::Cancellation | AuditEventType::Teardown => AuditSeverity::Medium,
            AuditEventType::LimitViolation | AuditEventType::SetupFailure => AuditSeverity::High,
        }
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, instance_id: &str, details: impl Into<String>) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
            details: details.into(),
            data: None,
        }
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a serializable payload; serialization failures drop the payload.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

/// Audit sink shared by every launch of one launcher
pub struct AuditLogger {
    audit_file: Option<Mutex<File>>,
    audit_path: Option<PathBuf>,
}

impl AuditLogger {
    /// Log-target only, no file
    pub fn disabled() -> Self {
        Self {
            audit_file: None,
            audit_path: None,
        }
    }

    pub fn new(audit_path: Option<&Path>) -> Result<Self> {
        let path = match audit_path {
            Some(path) => path,
            None => return Ok(Self::disabled()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SandboxError::Config(format!("Failed to create audit log directory: {}", e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                SandboxError::Config(format!(
                    "Failed to open audit log {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            audit_file: Some(Mutex::new(file)),
            audit_path: Some(path.to_path_buf()),
        })
    }

    pub fn audit_path(&self) -> Option<&Path> {
        self.audit_path.as_deref()
    }

    pub fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(target: AUDIT_TARGET, "Failed to encode audit event: {}", e);
                return;
            }
        };

        match event.severity {
            AuditSeverity::Critical | AuditSeverity::High => warn!(target: AUDIT_TARGET, "{}", line),
            AuditSeverity::Medium | AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
        }

        if let Some(file) = &self.audit_file {
            match file.lock() {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", line).and_then(|()| file.flush()) {
                        error!("Failed to write audit log: {}", e);
                    }
                }
                Err(_) => error!("Audit log lock poisoned"),
            }
        }
    }

    pub fn launch_start(&self, instance_id: &str, command: &[String], root: &Path) {
        self.record(
            AuditEvent::new(
                AuditEventType::LaunchStart,
                instance_id,
                format!("launching {:?} in {}", command, root.display()),
            )
            .with_data(&serde_json::json!({ "command": command, "root": root })),
        );
    }

    pub fn setup_failure(&self, instance_id: &str, err: &SandboxError) {
        let severity = match err {
            SandboxError::InvalidPolicy(_) | SandboxError::JailNotProvisioned { .. } => {
                AuditSeverity::Medium
            }
            _ => AuditSeverity::High,
        };
        self.record(
            AuditEvent::new(AuditEventType::SetupFailure, instance_id, err.to_string())
                .with_severity(severity)
                .with_data(&serde_json::json!({ "kind": err.kind() })),
        );
    }

    pub fn limit_violation(&self, instance_id: &str, limit: LimitKind) {
        self.record(
            AuditEvent::new(
                AuditEventType::LimitViolation,
                instance_id,
                format!("{:?} limit exceeded", limit),
            )
            .with_data(&limit),
        );
    }

    pub fn cancellation(&self, instance_id: &str) {
        self.record(AuditEvent::new(
            AuditEventType::Cancellation,
            instance_id,
            "launch cancelled by caller",
        ));
    }

    pub fn teardown(&self, instance_id: &str, report: &TeardownReport) {
        let event = AuditEvent::new(
            AuditEventType::Teardown,
            instance_id,
            format!("released {} resources", report.released.len()),
        )
        .with_data(report);
        let event = if report.complete {
            event.with_severity(AuditSeverity::Low)
        } else {
            event.with_severity(AuditSeverity::Critical)
        };
        self.record(event);
    }

    pub fn final_status(&self, result: &ExecutionResult) {
        self.record(
            AuditEvent::new(
                AuditEventType::FinalStatus,
                &result.instance_id,
                format!("exit code {}", result.exit_code),
            )
            .with_data(result),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn severities_follow_event_types() {
        assert_eq!(
            AuditEventType::LimitViolation.default_severity(),
            AuditSeverity::High
        );
        assert_eq!(
            AuditEventType::LaunchStart.default_severity(),
            AuditSeverity::Low
        );
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let logger = AuditLogger::new(Some(&path)).unwrap();
        assert_eq!(logger.audit_path(), Some(path.as_path()));

        logger.cancellation("abc");
        logger.limit_violation("abc", LimitKind::Memory);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::Cancellation);
        assert_eq!(first.instance_id, "abc");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "limit_violation");
        assert_eq!(second["data"], "memory");
    }

    #[test]
    fn incomplete_teardown_is_critical() {
        let event = AuditEvent::new(AuditEventType::Teardown, "x", "released 0 resources")
            .with_severity(AuditSeverity::Critical);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["severity"], "critical");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn disabled_logger_has_no_file() {
        let logger = AuditLogger::disabled();
        assert!(logger.audit_path().is_none());
        logger.cancellation("quiet");
    }
}
