//! Deadline enforcer: the only path into `expired`.

use tracing::{debug, info, warn};

use super::{ApprovalService, WorkflowError};
use crate::notification::NoticeKind;
use crate::store::mutation;

impl ApprovalService {
    /// Expire every pending approval whose deadline has passed. Returns how
    /// many were expired by this pass.
    ///
    /// Only the initial scan can fail the pass. A row that cannot be
    /// transitioned is logged and left for the next pass.
    pub async fn expire_overdue(&self) -> Result<usize, WorkflowError> {
        let now = self.now();
        let overdue = self.store.list_overdue(now).await?;
        if overdue.is_empty() {
            return Ok(0);
        }
        debug!(candidates = overdue.len(), "expiring overdue approvals");

        let mut expired = 0;
        for approval in overdue {
            // Re-check under the row lock: a decision may have landed since the scan.
            let result = self
                .store
                .transition(
                    approval.token,
                    mutation(move |a| {
                        if a.deadline < now {
                            a.mark_expired(now)
                        } else {
                            None
                        }
                    }),
                )
                .await;
            let t = match result {
                Ok(t) => t,
                Err(e) => {
                    warn!(token = %approval.token, error = %e, "cannot expire approval, will retry next pass");
                    continue;
                }
            };
            if !self.observe("mark_expired", &t) {
                continue;
            }
            info!(token = %t.approval.token, deadline = %t.approval.deadline, "approval expired");
            self.notify_for(NoticeKind::Expired, &t.approval, serde_json::Value::Null)
                .await;
            expired += 1;
        }
        Ok(expired)
    }
}
