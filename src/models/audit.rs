use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::approval::ApprovalMethod;

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    ReminderSent,
    Approved,
    Rejected,
    Expired,
    ExecutionStarted,
    Executed,
    Archived,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::ReminderSent => "reminder_sent",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Expired => "expired",
            AuditAction::ExecutionStarted => "execution_started",
            AuditAction::Executed => "executed",
            AuditAction::Archived => "archived",
        }
    }
}

/// One immutable line in an approval's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub approval_token: Uuid,
    pub action: AuditAction,
    pub actor: Option<String>,
    pub method: Option<ApprovalMethod>,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl AuditLogEntry {
    pub fn new(approval_token: Uuid, action: AuditAction, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            approval_token,
            action,
            actor: None,
            method: None,
            timestamp,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn with_method(mut self, method: ApprovalMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
