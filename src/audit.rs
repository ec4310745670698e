//! Audit trail of factor activity.
//!
//! Entries are append-only. Each one is also emitted as a `tracing` event on
//! the `mfa_audit` target so the logging layer can route it to its own file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::factor::FactorKind;

/// Log target used for audit events
pub const AUDIT_TARGET: &str = "mfa_audit";

/// Kinds of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    FactorSetup,
    FactorConfirmed,
    CodeIssued,
    VerifySucceeded,
    VerifyFailed,
    /// Verification aborted before a verdict, e.g. factor disabled or not set up
    VerifyRejected,
    LockedOut,
    AttemptWhileLocked,
    FactorRevoked,
    FactorUnlocked,
    LinkRevoked,
    MfaPassed,
    StoreFailure,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::FactorSetup => "factor_setup",
            AuditEvent::FactorConfirmed => "factor_confirmed",
            AuditEvent::CodeIssued => "code_issued",
            AuditEvent::VerifySucceeded => "verify_succeeded",
            AuditEvent::VerifyFailed => "verify_failed",
            AuditEvent::VerifyRejected => "verify_rejected",
            AuditEvent::LockedOut => "locked_out",
            AuditEvent::AttemptWhileLocked => "attempt_while_locked",
            AuditEvent::FactorRevoked => "factor_revoked",
            AuditEvent::FactorUnlocked => "factor_unlocked",
            AuditEvent::LinkRevoked => "link_revoked",
            AuditEvent::MfaPassed => "mfa_passed",
            AuditEvent::StoreFailure => "store_failure",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown audit event: {}", s))
    }
}

/// One audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: i64,
    pub factor: Option<FactorKind>,
    pub event: AuditEvent,
    pub success: bool,
    /// Internal reason, e.g. "code expired"
    pub reason: Option<String>,
    pub ip: Option<String>,
    pub created_at: i64,
}

impl AuditEntry {
    pub fn new(user_id: i64, event: AuditEvent, success: bool, created_at: i64) -> Self {
        Self {
            user_id,
            factor: None,
            event,
            success,
            reason: None,
            ip: None,
            created_at,
        }
    }

    pub fn factor(mut self, factor: FactorKind) -> Self {
        self.factor = Some(factor);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    /// Emit the entry as a structured log event.
    pub fn trace(&self) {
        let factor = self.factor.map(|f| f.name()).unwrap_or("-");
        let reason = self.reason.as_deref().unwrap_or("");
        let ip = self.ip.as_deref().unwrap_or("");

        if self.success {
            tracing::info!(
                target: AUDIT_TARGET,
                user_id = self.user_id,
                factor,
                event = self.event.as_str(),
                ip,
                "MFA audit"
            );
        } else {
            tracing::warn!(
                target: AUDIT_TARGET,
                user_id = self.user_id,
                factor,
                event = self.event.as_str(),
                reason,
                ip,
                "MFA audit"
            );
        }
    }
}

/// Query over the audit log. Results come back newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<i64>,
    pub factor: Option<FactorKind>,
    pub event: Option<AuditEvent>,
    pub success: Option<bool>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.user_id.map_or(true, |id| entry.user_id == id)
            && self.factor.map_or(true, |f| entry.factor == Some(f))
            && self.event.map_or(true, |e| entry.event == e)
            && self.success.map_or(true, |s| entry.success == s)
            && self.since.map_or(true, |t| entry.created_at >= t)
    }
}
