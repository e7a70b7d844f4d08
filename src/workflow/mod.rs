//! The approval workflow service.
//!
//! [`ApprovalService`] owns the only legal mutators of an approval:
//! `approve`, `reject`, `mark_expired`, `mark_executed` (plus scheduling,
//! reminder bookkeeping and archiving). Guard failures come back as
//! `Ok(false)`; only store and lookup failures are errors.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{Config, Toggles};
use crate::metrics;
use crate::models::approval::{Approval, ApprovalMethod, ApprovalStatus};
use crate::models::audit::AuditLogEntry;
use crate::models::server::{NewServer, Server};
use crate::notification::{ApprovalNotice, NoticeKind, Notifier};
use crate::store::{mutation, ApprovalFilter, ApprovalStore, StoreError, Transition};

pub mod deadline;
pub mod execution;
pub mod recovery;
pub mod reminders;

#[cfg(test)]
pub(crate) mod test_support;

pub use execution::ExecutionTrigger;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("server not found: {0}")]
    ServerNotFound(Uuid),

    #[error("server {0} is inactive")]
    ServerInactive(String),

    #[error("invalid server: {0}")]
    InvalidServer(String),

    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ApprovalNotFound(token) => WorkflowError::ApprovalNotFound(token),
            StoreError::ServerNotFound(id) => WorkflowError::ServerNotFound(id),
            StoreError::DuplicateServer(name) => WorkflowError::DuplicateServer(name),
            other => WorkflowError::Store(other),
        }
    }
}

/// Workflow knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub deadline_offset: Duration,
    pub reminder_times: Vec<NaiveTime>,
    pub public_url: String,
    /// Age after which an `in_progress` execution is considered abandoned.
    pub stale_execution_after: Duration,
    pub toggles: Toggles,
}

impl From<&Config> for WorkflowSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            deadline_offset: cfg.deadline_offset(),
            reminder_times: cfg.reminder_times.clone(),
            public_url: cfg.public_url.clone(),
            stale_execution_after: cfg.stale_execution_after(),
            toggles: cfg.toggles.clone(),
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    trigger: ExecutionTrigger,
    settings: WorkflowSettings,
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        trigger: ExecutionTrigger,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            trigger,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    pub fn trigger(&self) -> &ExecutionTrigger {
        &self.trigger
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -- Servers --

    pub async fn add_server(&self, new: NewServer) -> Result<Server, WorkflowError> {
        new.validate().map_err(WorkflowError::InvalidServer)?;
        let server = new.into_server(self.now());
        self.store.insert_server(&server).await?;
        info!(server = %server.name, id = %server.id, "server registered");
        Ok(server)
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>, WorkflowError> {
        Ok(self.store.list_servers().await?)
    }

    async fn server(&self, id: Uuid) -> Result<Server, WorkflowError> {
        self.store
            .get_server(id)
            .await?
            .ok_or(WorkflowError::ServerNotFound(id))
    }

    // -- Queries --

    pub async fn get(&self, token: Uuid) -> Result<Approval, WorkflowError> {
        self.store
            .get_approval(token)
            .await?
            .ok_or(WorkflowError::ApprovalNotFound(token))
    }

    pub async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, WorkflowError> {
        Ok(self.store.list_approvals(filter).await?)
    }

    pub async fn audit_log(&self, token: Uuid) -> Result<Vec<AuditLogEntry>, WorkflowError> {
        // Distinguish "unknown token" from "no history".
        self.get(token).await?;
        Ok(self.store.audit_log(token).await?)
    }

    // -- Lifecycle --

    /// Open a pending approval for `server_id`. The deadline is counted from now.
    pub async fn schedule(
        &self,
        server_id: Uuid,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Approval, WorkflowError> {
        let server = self.server(server_id).await?;
        if !server.is_active {
            return Err(WorkflowError::ServerInactive(server.name));
        }

        let now = self.now();
        let deadline = now + self.settings.deadline_offset;
        let reminders = reminders::schedule(now, deadline, &self.settings.reminder_times);
        let (approval, entry) = Approval::new(
            server.id,
            scheduled_for.unwrap_or(now),
            now,
            deadline,
            reminders,
        );
        self.store.insert_approval(&approval, &entry).await?;
        metrics::record_transition(entry.action.as_str());

        info!(
            token = %approval.token,
            server = %server.name,
            deadline = %approval.deadline,
            "approval requested"
        );
        self.notify(
            ApprovalNotice::new(NoticeKind::Requested, &approval, &server)
                .with_links(&self.settings.public_url),
        )
        .await;
        Ok(approval)
    }

    /// Approve a pending approval before its deadline. On success the remote
    /// command is dispatched exactly once.
    pub async fn approve(
        &self,
        token: Uuid,
        actor: &str,
        method: ApprovalMethod,
    ) -> Result<bool, WorkflowError> {
        let now = self.now();
        let actor_owned = actor.to_string();
        let t = self
            .store
            .transition(
                token,
                mutation(move |a| a.approve(&actor_owned, method, now)),
            )
            .await?;

        if !self.observe("approve", &t) {
            debug!(token = %token, status = t.approval.status.as_str(), "approve refused");
            return Ok(false);
        }
        info!(token = %token, actor, method = method.as_str(), "approval granted");

        // Dispatch before any await: if this future is dropped past this point
        // the run still happens.
        if self.settings.toggles.auto_execute {
            self.trigger.fire(t.approval.clone());
        } else {
            info!(token = %token, "auto-execute disabled, not dispatching remote command");
        }
        self.notify_for(NoticeKind::Approved, &t.approval, serde_json::json!({ "by": actor }))
            .await;
        Ok(true)
    }

    pub async fn reject(
        &self,
        token: Uuid,
        reason: &str,
        actor: Option<&str>,
        method: Option<ApprovalMethod>,
    ) -> Result<bool, WorkflowError> {
        let now = self.now();
        let reason_owned = reason.to_string();
        let actor_owned = actor.map(str::to_string);
        let t = self
            .store
            .transition(
                token,
                mutation(move |a| a.reject(&reason_owned, actor_owned.as_deref(), method, now)),
            )
            .await?;

        if !self.observe("reject", &t) {
            return Ok(false);
        }
        info!(token = %token, reason, "approval rejected");
        self.notify_for(
            NoticeKind::Rejected,
            &t.approval,
            serde_json::json!({ "reason": reason, "by": actor }),
        )
        .await;
        Ok(true)
    }

    /// Expire a pending approval. Normally only called by the deadline enforcer.
    pub async fn mark_expired(&self, token: Uuid) -> Result<bool, WorkflowError> {
        let now = self.now();
        let t = self
            .store
            .transition(token, mutation(move |a| a.mark_expired(now)))
            .await?;
        if !self.observe("mark_expired", &t) {
            return Ok(false);
        }
        info!(token = %token, deadline = %t.approval.deadline, "approval expired");
        self.notify_for(NoticeKind::Expired, &t.approval, serde_json::Value::Null)
            .await;
        Ok(true)
    }

    /// Record a remote execution result. Accepted in every approval status.
    pub async fn mark_executed(
        &self,
        token: Uuid,
        exit_code: i32,
        output: &str,
        error: &str,
    ) -> Result<Approval, WorkflowError> {
        let approval = execution::record_result(
            self.store.as_ref(),
            self.now(),
            token,
            exit_code,
            output,
            error,
        )
        .await?;
        Ok(approval)
    }

    pub async fn archive(&self, token: Uuid, actor: Option<&str>) -> Result<bool, WorkflowError> {
        let now = self.now();
        let actor_owned = actor.map(str::to_string);
        let t = self
            .store
            .transition(token, mutation(move |a| a.archive(actor_owned.as_deref(), now)))
            .await?;
        Ok(self.observe("archive", &t))
    }

    fn observe(&self, operation: &str, t: &Transition) -> bool {
        match &t.entry {
            Some(entry) => {
                metrics::record_transition(entry.action.as_str());
                true
            }
            None => {
                metrics::record_refused(operation);
                false
            }
        }
    }

    async fn notify_for(&self, kind: NoticeKind, approval: &Approval, details: serde_json::Value) {
        match self.store.get_server(approval.server_id).await {
            Ok(Some(server)) => {
                let mut notice = ApprovalNotice::new(kind, approval, &server).with_details(details);
                if approval.status == ApprovalStatus::Pending {
                    notice = notice.with_links(&self.settings.public_url);
                }
                self.notify(notice).await;
            }
            Ok(None) => warn!(token = %approval.token, "server vanished, notification skipped"),
            Err(e) => warn!(token = %approval.token, error = %e, "cannot load server for notification"),
        }
    }

    async fn notify(&self, notice: ApprovalNotice) {
        if !self.settings.toggles.notifications {
            debug!(token = %notice.token, kind = notice.kind.as_str(), "notifications disabled");
            return;
        }
        if let Err(e) = self.notifier.notify(&notice).await {
            warn!(
                token = %notice.token,
                kind = notice.kind.as_str(),
                error = %e,
                "notification failed"
            );
        }
    }
}
