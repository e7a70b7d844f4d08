//! Background job: recover executions that lost their runner.
//!
//! Each tick fails `in_progress` rows older than the SSH timeout window,
//! then re-dispatches approved rows that were never claimed. The first tick
//! fires immediately, so a restart recovers before serving for long.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::workflow::ApprovalService;

/// Spawn the execution recovery loop. Call this once at startup.
pub fn spawn(service: ApprovalService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match service.fail_stale_executions().await {
                Ok(0) => {}
                Ok(failed) => tracing::warn!(failed, "stale executions marked failed"),
                Err(e) => tracing::error!("stale execution sweep failed: {}", e),
            }
            match service.dispatch_approved().await {
                Ok(0) => {}
                Ok(dispatched) => tracing::info!(dispatched, "re-dispatched approved executions"),
                Err(e) => tracing::error!("execution dispatch sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::approval::{ApprovalMethod, ExecutionStatus};
    use crate::store::{mutation, ApprovalStore};
    use crate::workflow::test_support::{harness, new_server};

    #[tokio::test]
    async fn test_loop_dispatches_on_first_tick() {
        let h = harness();
        let server = h.service.add_server(new_server("db-01")).await.unwrap();
        let approval = h.service.schedule(server.id, None).await.unwrap();
        let now = h.service.now();
        h.store
            .transition(
                approval.token,
                mutation(move |a| a.approve("ops", ApprovalMethod::Api, now)),
            )
            .await
            .unwrap();

        let handle = spawn(h.service.clone(), Duration::from_secs(3600));
        for _ in 0..50 {
            if h.service.get(approval.token).await.unwrap().execution_status
                == ExecutionStatus::Success
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        h.service.trigger().drain().await;
        assert_eq!(h.executor.calls(), 1);
    }
}
