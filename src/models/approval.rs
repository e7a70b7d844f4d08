//! The approval entity and its state machine.
//!
//! `status` only ever moves out of `Pending`; the guards below return `None`
//! instead of erroring when a transition is not allowed, and every accepted
//! transition hands back the audit entry that must be persisted with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::{AuditAction, AuditLogEntry};

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(format!("unknown approval status: {}", other)),
        }
    }
}

/// Channel through which a decision arrived.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ApprovalMethod {
    EmailLink,
    Ui,
    Api,
}

impl ApprovalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMethod::EmailLink => "email_link",
            ApprovalMethod::Ui => "ui",
            ApprovalMethod::Api => "api",
        }
    }
}

impl std::str::FromStr for ApprovalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_link" | "email" => Ok(ApprovalMethod::EmailLink),
            "ui" => Ok(ApprovalMethod::Ui),
            "api" => Ok(ApprovalMethod::Api),
            other => Err(format!("unknown approval method: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Scheduled checkpoints and the sent-once flags for the three reminders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderState {
    pub scheduled: [Option<DateTime<Utc>>; 3],
    pub sent: [bool; 3],
}

impl ReminderState {
    pub fn new(scheduled: [Option<DateTime<Utc>>; 3]) -> Self {
        Self {
            scheduled,
            sent: [false; 3],
        }
    }

    /// Indices (0-based) of reminders whose checkpoint has passed and that were not sent yet.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<usize> {
        (0..3)
            .filter(|&i| !self.sent[i] && self.scheduled[i].is_some_and(|at| at <= now))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub token: Uuid,
    pub server_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approval_method: Option<ApprovalMethod>,
    pub decided_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub reminders: ReminderState,
    pub execution_status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub execution_output: Option<String>,
    pub execution_error: Option<String>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl Approval {
    /// A fresh pending approval together with its `created` audit entry.
    pub fn new(
        server_id: Uuid,
        scheduled_for: DateTime<Utc>,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        reminders: ReminderState,
    ) -> (Self, AuditLogEntry) {
        let approval = Self {
            token: Uuid::new_v4(),
            server_id,
            scheduled_for,
            created_at,
            deadline,
            status: ApprovalStatus::Pending,
            approved_by: None,
            approval_method: None,
            decided_at: None,
            rejection_reason: None,
            reminders,
            execution_status: ExecutionStatus::Pending,
            exit_code: None,
            execution_output: None,
            execution_error: None,
            execution_started_at: None,
            executed_at: None,
            archived: false,
        };
        let entry = AuditLogEntry::new(approval.token, AuditAction::Created, created_at).with_detail(
            serde_json::json!({
                "server_id": server_id,
                "scheduled_for": scheduled_for,
                "deadline": deadline,
            }),
        );
        (approval, entry)
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn approve(
        &mut self,
        actor: &str,
        method: ApprovalMethod,
        now: DateTime<Utc>,
    ) -> Option<AuditLogEntry> {
        if !self.is_pending() || self.is_past_deadline(now) {
            return None;
        }
        self.status = ApprovalStatus::Approved;
        self.approved_by = Some(actor.to_string());
        self.approval_method = Some(method);
        self.decided_at = Some(now);
        Some(
            AuditLogEntry::new(self.token, AuditAction::Approved, now)
                .with_actor(actor)
                .with_method(method),
        )
    }

    /// Reject a pending approval. Unlike `approve`, this is allowed past the deadline.
    pub fn reject(
        &mut self,
        reason: &str,
        actor: Option<&str>,
        method: Option<ApprovalMethod>,
        now: DateTime<Utc>,
    ) -> Option<AuditLogEntry> {
        if !self.is_pending() {
            return None;
        }
        self.status = ApprovalStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        self.decided_at = Some(now);
        if let Some(actor) = actor {
            self.approved_by = Some(actor.to_string());
        }
        self.approval_method = method;

        let mut entry = AuditLogEntry::new(self.token, AuditAction::Rejected, now)
            .with_detail(serde_json::json!({ "reason": reason }));
        if let Some(actor) = actor {
            entry = entry.with_actor(actor);
        }
        if let Some(method) = method {
            entry = entry.with_method(method);
        }
        Some(entry)
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Option<AuditLogEntry> {
        if !self.is_pending() {
            return None;
        }
        self.status = ApprovalStatus::Expired;
        self.decided_at = Some(now);
        Some(
            AuditLogEntry::new(self.token, AuditAction::Expired, now)
                .with_detail(serde_json::json!({ "deadline": self.deadline })),
        )
    }

    /// Record the outcome of the remote command. Allowed in every status.
    pub fn mark_executed(
        &mut self,
        exit_code: i32,
        output: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> AuditLogEntry {
        self.exit_code = Some(exit_code);
        self.execution_output = Some(output.to_string());
        self.execution_error = (!error.is_empty()).then(|| error.to_string());
        self.execution_status = ExecutionStatus::from_exit_code(exit_code);
        self.executed_at = Some(now);
        AuditLogEntry::new(self.token, AuditAction::Executed, now).with_detail(serde_json::json!({
            "exit_code": exit_code,
            "execution_status": self.execution_status.as_str(),
            "status": self.status.as_str(),
            "error": error,
        }))
    }

    /// Claim the right to run the remote command. Succeeds once per approval.
    pub fn start_execution(&mut self, now: DateTime<Utc>) -> Option<AuditLogEntry> {
        if self.status != ApprovalStatus::Approved
            || self.execution_status != ExecutionStatus::Pending
        {
            return None;
        }
        self.execution_status = ExecutionStatus::InProgress;
        self.execution_started_at = Some(now);
        Some(AuditLogEntry::new(self.token, AuditAction::ExecutionStarted, now))
    }

    /// Whether a claimed execution started before `cutoff` and never recorded a result.
    pub fn is_stale_execution(&self, cutoff: DateTime<Utc>) -> bool {
        self.execution_status == ExecutionStatus::InProgress
            && self.execution_started_at.map_or(true, |at| at < cutoff)
    }

    /// Fail an execution whose runner went away. Refused once a result is in.
    pub fn fail_stale_execution(
        &mut self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<AuditLogEntry> {
        if !self.is_stale_execution(cutoff) {
            return None;
        }
        Some(self.mark_executed(-1, "", "execution interrupted before a result was recorded", now))
    }

    /// Flag reminder `index` (0-based) as sent. Returns `None` if it already was.
    pub fn mark_reminder_sent(&mut self, index: usize, now: DateTime<Utc>) -> Option<AuditLogEntry> {
        if index >= 3 || self.reminders.sent[index] || !self.is_pending() {
            return None;
        }
        self.reminders.sent[index] = true;
        Some(
            AuditLogEntry::new(self.token, AuditAction::ReminderSent, now)
                .with_detail(serde_json::json!({ "reminder": index + 1 })),
        )
    }

    /// Hide a decided approval from default listings. Pending approvals cannot be archived.
    pub fn archive(&mut self, actor: Option<&str>, now: DateTime<Utc>) -> Option<AuditLogEntry> {
        if self.archived || !self.status.is_terminal() {
            return None;
        }
        self.archived = true;
        let entry = AuditLogEntry::new(self.token, AuditAction::Archived, now);
        Some(match actor {
            Some(actor) => entry.with_actor(actor),
            None => entry,
        })
    }
}
