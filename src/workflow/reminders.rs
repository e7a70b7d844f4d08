//! Reminder engine.
//!
//! Reminder checkpoints are wall-clock times (UTC). When an approval is
//! created each checkpoint is pinned to an instant: the first occurrence of
//! its time strictly after the previous checkpoint, starting from creation.
//! Instants past the deadline are dropped.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, info, warn};

use super::{ApprovalService, WorkflowError};
use crate::models::approval::{ApprovalStatus, ReminderState};
use crate::notification::{ApprovalNotice, NoticeKind};
use crate::store::{mutation, ApprovalFilter};

/// First instant strictly after `after` whose UTC wall-clock time is `at`.
fn next_occurrence(after: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let candidate = after.date_naive().and_time(at).and_utc();
    if candidate > after {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// Pin up to three reminder checkpoints for an approval created at `created_at`.
pub fn schedule(
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    times: &[NaiveTime],
) -> ReminderState {
    let mut scheduled = [None; 3];
    let mut prev = created_at;
    for (slot, &at) in scheduled.iter_mut().zip(times) {
        let instant = next_occurrence(prev, at);
        if instant <= deadline {
            *slot = Some(instant);
        }
        prev = instant;
    }
    ReminderState::new(scheduled)
}

impl ApprovalService {
    /// One reminder pass over all pending approvals. Returns the number of
    /// reminder notices sent.
    ///
    /// The sent flag is set under the row lock before notifying, so two
    /// concurrent passes never both send the same reminder. A row whose flag
    /// cannot be written is logged and skipped; only the scan fails the pass.
    pub async fn send_due_reminders(&self) -> Result<usize, WorkflowError> {
        if !self.settings.toggles.reminders {
            debug!("reminders disabled, skipping pass");
            return Ok(0);
        }

        let now = self.now();
        let pending = self
            .store
            .list_approvals(&ApprovalFilter {
                status: Some(ApprovalStatus::Pending),
                include_archived: true,
                ..Default::default()
            })
            .await?;

        let mut sent = 0;
        for approval in pending {
            if approval.is_past_deadline(now) {
                continue;
            }
            let due = approval.reminders.due(now);
            if due.is_empty() {
                continue;
            }

            let mut flagged = Vec::new();
            let mut latest = approval;
            for index in due {
                let t = match self
                    .store
                    .transition(latest.token, mutation(move |a| a.mark_reminder_sent(index, now)))
                    .await
                {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(token = %latest.token, reminder = index + 1, error = %e, "cannot flag reminder");
                        break;
                    }
                };
                if self.observe("mark_reminder_sent", &t) {
                    flagged.push(index + 1);
                }
                latest = t.approval;
            }
            if flagged.is_empty() {
                continue;
            }

            let server = match self.store.get_server(latest.server_id).await {
                Ok(Some(server)) => server,
                Ok(None) => {
                    warn!(token = %latest.token, "server vanished, reminder skipped");
                    continue;
                }
                Err(e) => {
                    warn!(token = %latest.token, error = %e, "cannot load server for reminder");
                    continue;
                }
            };

            info!(
                token = %latest.token,
                server = %server.name,
                reminders = ?flagged,
                "sending approval reminder"
            );
            self.notify(
                ApprovalNotice::new(NoticeKind::Reminder, &latest, &server)
                    .with_links(&self.settings.public_url)
                    .with_details(serde_json::json!({
                        "reminder": flagged.last(),
                        "remaining_minutes": (latest.deadline - now).num_minutes(),
                    })),
            )
            .await;
            sent += 1;
        }
        Ok(sent)
    }
}
