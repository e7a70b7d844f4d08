//! Execution recovery sweeps.
//!
//! `approve` dispatches the remote run in-process. If the process dies (or
//! the dispatch is lost) between the approval commit and the claim, the row
//! sits at `approved` + `execution_status = pending`; if it dies mid-run the
//! row sits at `in_progress`. These sweeps move both back onto a path that
//! ends in a recorded result. The `start_execution` claim keeps re-dispatch
//! exactly-once.

use tracing::{info, warn};

use super::{ApprovalService, WorkflowError};
use crate::metrics;
use crate::models::approval::{ApprovalStatus, ExecutionStatus};
use crate::notification::NoticeKind;
use crate::store::{mutation, ApprovalFilter};

impl ApprovalService {
    /// Dispatch every approved approval whose command was never claimed.
    /// Returns how many were handed to the trigger.
    pub async fn dispatch_approved(&self) -> Result<usize, WorkflowError> {
        if !self.settings.toggles.auto_execute {
            return Ok(0);
        }
        let approved = self
            .store
            .list_approvals(&ApprovalFilter {
                status: Some(ApprovalStatus::Approved),
                include_archived: true,
                ..Default::default()
            })
            .await?;

        let mut dispatched = 0;
        for approval in approved {
            if approval.execution_status != ExecutionStatus::Pending {
                continue;
            }
            info!(token = %approval.token, "dispatching approved execution that never started");
            self.trigger.fire(approval);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fail executions stuck `in_progress` for longer than the SSH timeout
    /// allows, with exit code -1.
    pub async fn fail_stale_executions(&self) -> Result<usize, WorkflowError> {
        let now = self.now();
        let cutoff = now - self.settings.stale_execution_after;
        let approved = self
            .store
            .list_approvals(&ApprovalFilter {
                status: Some(ApprovalStatus::Approved),
                include_archived: true,
                ..Default::default()
            })
            .await?;

        let mut failed = 0;
        for approval in approved.into_iter().filter(|a| a.is_stale_execution(cutoff)) {
            let t = match self
                .store
                .transition(approval.token, mutation(move |a| a.fail_stale_execution(cutoff, now)))
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    warn!(token = %approval.token, error = %e, "cannot fail stale execution");
                    continue;
                }
            };
            if !self.observe("fail_stale_execution", &t) {
                continue;
            }
            metrics::record_execution("interrupted");
            warn!(
                token = %approval.token,
                started_at = ?approval.execution_started_at,
                "execution never recorded a result, marked failed"
            );
            self.notify_for(
                NoticeKind::Executed,
                &t.approval,
                serde_json::json!({
                    "exit_code": t.approval.exit_code,
                    "execution_status": t.approval.execution_status.as_str(),
                }),
            )
            .await;
            failed += 1;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use crate::models::approval::{ApprovalMethod, ApprovalStatus, ExecutionStatus};
    use crate::store::{mutation, ApprovalStore};
    use crate::workflow::execution::NO_EXIT_CODE;
    use crate::workflow::test_support::{
        harness, harness_on, new_server, FailingStore, OutageExecutor,
    };
    use crate::workflow::{ExecutionTrigger, WorkflowSettings};

    #[tokio::test]
    async fn test_lost_dispatch_is_picked_up_once() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();

        // Approved in the store, but the trigger never heard about it.
        let now = h.service.now();
        h.store
            .transition(
                approval.token,
                mutation(move |a| a.approve("ops", ApprovalMethod::Api, now)),
            )
            .await
            .unwrap();

        assert_eq!(h.service.dispatch_approved().await.unwrap(), 1);
        h.service.trigger().drain().await;
        assert_eq!(h.executor.calls(), 1);
        assert_eq!(
            h.service.get(approval.token).await.unwrap().execution_status,
            ExecutionStatus::Success
        );

        assert_eq!(h.service.dispatch_approved().await.unwrap(), 0);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_sweep_respects_auto_execute() {
        let mut settings = WorkflowSettings::default();
        settings.toggles.auto_execute = false;
        let h = harness_on(FailingStore::default(), settings);
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.service
            .approve(approval.token, "ops", ApprovalMethod::Api)
            .await
            .unwrap();

        assert_eq!(h.service.dispatch_approved().await.unwrap(), 0);
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_unrecorded_execution_is_failed_after_timeout_window() {
        let store = FailingStore::default();
        let mut settings = WorkflowSettings::default();
        settings.toggles.auto_execute = false;
        settings.stale_execution_after = ChronoDuration::minutes(5);
        let h = harness_on(store.clone(), settings);
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.service
            .approve(approval.token, "ops", ApprovalMethod::Api)
            .await
            .unwrap();

        // The store stays down for every attempt to record the result.
        let trigger = ExecutionTrigger::new(
            Arc::new(store.clone()),
            h.clock.clone(),
            Arc::new(OutageExecutor {
                store: store.clone(),
                failures: 3,
            }),
            Duration::from_secs(5),
        );
        assert!(trigger.run(approval.token).await.is_err());
        assert_eq!(
            h.service.get(approval.token).await.unwrap().execution_status,
            ExecutionStatus::InProgress
        );

        // Still inside the window: the run might be alive somewhere.
        assert_eq!(h.service.fail_stale_executions().await.unwrap(), 0);

        h.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(h.service.fail_stale_executions().await.unwrap(), 1);
        let done = h.service.get(approval.token).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Approved);
        assert_eq!(done.execution_status, ExecutionStatus::Failed);
        assert_eq!(done.exit_code, Some(NO_EXIT_CODE));
        assert_eq!(h.service.fail_stale_executions().await.unwrap(), 0);
    }
}
