//! Background job: send due approval reminders.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::workflow::ApprovalService;

/// Spawn the reminder loop. Call this once at startup.
pub fn spawn(service: ApprovalService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match service.send_due_reminders().await {
                Ok(0) => {}
                Ok(sent) => tracing::info!(sent, "reminder pass complete"),
                Err(e) => tracing::error!("reminder job failed: {}", e),
            }
        }
    })
}
