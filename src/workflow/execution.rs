//! Execution trigger: runs the server's command once an approval is granted.
//!
//! The approval token is the idempotency key. Before anything runs, the
//! trigger claims the execution in the store (`pending -> in_progress`);
//! a second `fire` for the same token loses that claim and does nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::metrics;
use crate::models::approval::{Approval, ExecutionStatus};
use crate::notification::{ApprovalNotice, NoticeKind, Notifier};
use crate::ssh::RemoteExecutor;
use crate::store::{mutation, ApprovalStore, StoreError};

/// Exit code recorded when the command never produced one (timeout, spawn failure).
pub const NO_EXIT_CODE: i32 = -1;

/// Waits before each attempt to persist a finished run.
const RECORD_BACKOFF_MS: [u64; 3] = [0, 500, 2_000];

/// Apply `mark_executed` under the row lock. Always succeeds for an existing token.
pub(crate) async fn record_result(
    store: &dyn ApprovalStore,
    now: DateTime<Utc>,
    token: Uuid,
    exit_code: i32,
    output: &str,
    error: &str,
) -> Result<Approval, StoreError> {
    let output = output.to_string();
    let error = error.to_string();
    let t = store
        .transition(
            token,
            mutation(move |a| Some(a.mark_executed(exit_code, &output, &error, now))),
        )
        .await?;
    metrics::record_transition("executed");
    Ok(t.approval)
}

#[derive(Clone)]
pub struct ExecutionTrigger {
    store: Arc<dyn ApprovalStore>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn RemoteExecutor>,
    notifier: Option<Arc<dyn Notifier>>,
    timeout: Duration,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExecutionTrigger {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn RemoteExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            executor,
            notifier: None,
            timeout,
            inflight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Send an "executed" notice to the server's approvers after each run.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Dispatch the remote command for a freshly approved approval on a background task.
    pub fn fire(&self, approval: Approval) {
        let trigger = self.clone();
        let token = approval.token;
        let handle = tokio::spawn(async move {
            if let Err(e) = trigger.run(token).await {
                error!(token = %token, error = %e, "execution trigger failed");
            }
        });

        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }

    /// Wait for every execution started by [`fire`](Self::fire) so far.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "execution task panicked");
            }
        }
    }

    /// Claim, run and record the execution for `token`.
    ///
    /// Returns `Ok(None)` when the claim was lost (not approved, or already
    /// started by another invocation).
    pub async fn run(&self, token: Uuid) -> Result<Option<Approval>, StoreError> {
        let now = self.clock.now();
        let claim = self
            .store
            .transition(token, mutation(move |a| a.start_execution(now)))
            .await?;
        if !claim.applied() {
            info!(
                token = %token,
                execution_status = claim.approval.execution_status.as_str(),
                "execution already claimed or not approved, skipping"
            );
            return Ok(None);
        }
        metrics::record_transition("execution_started");

        let approval = claim.approval;
        let Some(server) = self.store.get_server(approval.server_id).await? else {
            warn!(token = %token, server_id = %approval.server_id, "server missing at execution time");
            let done = self.record(token, NO_EXIT_CODE, "", "server not found").await?;
            metrics::record_execution("failed");
            return Ok(Some(done));
        };

        info!(token = %token, server = %server.name, host = %server.hostname, "executing remote command");
        let (exit_code, output, err_text, outcome) =
            match tokio::time::timeout(self.timeout, self.executor.execute(&server)).await {
                Ok(Ok(out)) => {
                    let outcome = if out.exit_code == 0 { "success" } else { "failed" };
                    let mut err_text = out.stderr;
                    if out.truncated {
                        err_text.push_str("\n[output truncated]");
                    }
                    (out.exit_code, out.stdout, err_text, outcome)
                }
                Ok(Err(e)) => (NO_EXIT_CODE, String::new(), e.to_string(), "failed"),
                Err(_) => (
                    NO_EXIT_CODE,
                    String::new(),
                    format!("remote command timed out after {}s", self.timeout.as_secs()),
                    "timeout",
                ),
            };

        let done = self.record(token, exit_code, &output, &err_text).await?;
        metrics::record_execution(outcome);

        if done.execution_status == ExecutionStatus::Success {
            info!(token = %token, server = %server.name, "remote command succeeded");
        } else {
            warn!(token = %token, server = %server.name, exit_code, error = %err_text, "remote command failed");
        }

        if let Some(ref notifier) = self.notifier {
            let notice = ApprovalNotice::new(NoticeKind::Executed, &done, &server).with_details(
                serde_json::json!({
                    "exit_code": exit_code,
                    "execution_status": done.execution_status.as_str(),
                }),
            );
            if let Err(e) = notifier.notify(&notice).await {
                warn!(token = %token, error = %e, "execution notification failed");
            }
        }

        Ok(Some(done))
    }

    /// Persist a finished run, retrying store failures. If every attempt
    /// fails the row stays `in_progress` until the stale-execution sweep
    /// fails it.
    async fn record(
        &self,
        token: Uuid,
        exit_code: i32,
        output: &str,
        error: &str,
    ) -> Result<Approval, StoreError> {
        let mut last_err = None;
        for (attempt, delay_ms) in RECORD_BACKOFF_MS.into_iter().enumerate() {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match record_result(self.store.as_ref(), self.clock.now(), token, exit_code, output, error)
                .await
            {
                Ok(done) => return Ok(done),
                Err(e) => {
                    warn!(token = %token, attempt, error = %e, "cannot record execution result");
                    last_err = Some(e);
                }
            }
        }
        error!(token = %token, exit_code, "execution result lost; row left in_progress");
        Err(last_err.unwrap_or(StoreError::ApprovalNotFound(token)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::models::approval::{ApprovalMethod, ApprovalStatus};
    use crate::models::audit::AuditAction;
    use crate::workflow::test_support::{
        harness, harness_on, harness_with, new_server, FailingStore, FakeExecutor, OutageExecutor,
    };
    use crate::workflow::WorkflowSettings;

    #[tokio::test]
    async fn test_approve_runs_command_once() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();

        assert!(h
            .service
            .approve(approval.token, "ops@example.com", ApprovalMethod::EmailLink)
            .await
            .unwrap());
        h.service.trigger().drain().await;

        // A second fire for the same token loses the claim.
        assert!(h.service.trigger().run(approval.token).await.unwrap().is_none());
        assert_eq!(h.executor.calls(), 1);

        let done = h.service.get(approval.token).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Approved);
        assert_eq!(done.execution_status, ExecutionStatus::Success);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.execution_output.as_deref(), Some("ran /opt/backup.sh"));

        let actions: Vec<_> = h
            .service
            .audit_log(approval.token)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Created,
                AuditAction::Approved,
                AuditAction::ExecutionStarted,
                AuditAction::Executed,
            ]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let h = harness_with(FakeExecutor::new(3), WorkflowSettings::default());
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.service
            .approve(approval.token, "ops", ApprovalMethod::Api)
            .await
            .unwrap();
        h.service.trigger().drain().await;

        let done = h.service.get(approval.token).await.unwrap();
        assert_eq!(done.execution_status, ExecutionStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let mut slow = FakeExecutor::new(0);
        slow.delay = Duration::from_secs(60);
        let mut settings = WorkflowSettings::default();
        settings.toggles.auto_execute = false;
        let h = harness_with(slow, settings);
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        assert!(h
            .service
            .approve(approval.token, "ops", ApprovalMethod::Ui)
            .await
            .unwrap());
        assert_eq!(
            h.service.get(approval.token).await.unwrap().execution_status,
            ExecutionStatus::Pending
        );

        let trigger = ExecutionTrigger::new(
            Arc::new(h.store.clone()),
            h.clock.clone(),
            h.executor.clone(),
            Duration::from_millis(50),
        );
        let done = trigger.run(approval.token).await.unwrap().unwrap();
        assert_eq!(done.execution_status, ExecutionStatus::Failed);
        assert_eq!(done.exit_code, Some(NO_EXIT_CODE));
        assert!(done.execution_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_pending_approval_is_not_executed() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        assert!(h.service.trigger().run(approval.token).await.unwrap().is_none());
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_record_result_in_any_status() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.service
            .reject(approval.token, "no", None, None)
            .await
            .unwrap();

        let done = h
            .service
            .mark_executed(approval.token, 0, "manual run", "")
            .await
            .unwrap();
        assert_eq!(done.status, ApprovalStatus::Rejected);
        assert_eq!(done.execution_status, ExecutionStatus::Success);
        assert_eq!(done.execution_error, None);
    }

    #[tokio::test]
    async fn test_result_recorded_after_transient_store_failure() {
        let store = FailingStore::default();
        let mut settings = WorkflowSettings::default();
        settings.toggles.auto_execute = false;
        let h = harness_on(store.clone(), settings);
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.service
            .approve(approval.token, "ops", ApprovalMethod::Api)
            .await
            .unwrap();

        let trigger = ExecutionTrigger::new(
            Arc::new(store.clone()),
            h.clock.clone(),
            Arc::new(OutageExecutor {
                store: store.clone(),
                failures: 1,
            }),
            Duration::from_secs(5),
        );
        let done = trigger.run(approval.token).await.unwrap().unwrap();
        assert_eq!(done.execution_status, ExecutionStatus::Success);
        assert_eq!(
            h.service.get(approval.token).await.unwrap().execution_status,
            ExecutionStatus::Success
        );
    }
}
