//! Background job: expire pending approvals past their deadline.
//!
//! Polling is the only path to `expired`; nothing else flips the status.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::workflow::ApprovalService;

/// Spawn the deadline enforcer loop. Call this once at startup.
pub fn spawn(service: ApprovalService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match service.expire_overdue().await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired, "deadline pass complete"),
                Err(e) => tracing::error!("expiry job failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::approval::ApprovalStatus;
    use crate::workflow::test_support::{harness, new_server};

    #[tokio::test]
    async fn test_loop_expires_overdue() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        h.clock.set(approval.deadline + chrono::Duration::seconds(1));

        let handle = spawn(h.service.clone(), Duration::from_millis(10));
        for _ in 0..50 {
            if h.service.get(approval.token).await.unwrap().status == ApprovalStatus::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(
            h.service.get(approval.token).await.unwrap().status,
            ApprovalStatus::Expired
        );
    }
}
