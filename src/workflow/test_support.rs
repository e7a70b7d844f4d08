//! Fixtures shared by the workflow unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::{ApprovalService, ExecutionTrigger, WorkflowSettings};
use crate::clock::ManualClock;
use crate::models::server::{NewServer, Server};
use crate::notification::{ApprovalNotice, NoticeKind, Notifier};
use crate::ssh::{CommandOutput, ExecError, RemoteExecutor};
use crate::models::approval::Approval;
use crate::models::audit::AuditLogEntry;
use crate::store::memory::MemoryStore;
use crate::store::{ApprovalFilter, ApprovalStore, Mutation, StoreError, Transition};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<ApprovalNotice>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NoticeKind> {
        self.notices.lock().unwrap().iter().map(|n| n.kind).collect()
    }

    pub fn count(&self, kind: NoticeKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Executor that counts invocations and returns a fixed exit code after `delay`.
pub struct FakeExecutor {
    pub calls: AtomicUsize,
    pub exit_code: i32,
    pub delay: Duration,
}

impl FakeExecutor {
    pub fn new(exit_code: i32) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            exit_code,
            delay: Duration::ZERO,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, server: &Server) -> Result<CommandOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CommandOutput {
            exit_code: self.exit_code,
            stdout: format!("ran {}", server.command),
            stderr: String::new(),
            truncated: false,
        })
    }
}

/// Memory store whose transitions fail for selected tokens, like a row
/// stuck behind a lock timeout.
#[derive(Clone, Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    broken: Arc<Mutex<HashSet<Uuid>>>,
    fail_next: Arc<AtomicUsize>,
}

impl FailingStore {
    /// Fail the next `n` transitions, whatever their token.
    pub fn fail_next_transitions(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_transitions_for(&self, token: Uuid) {
        self.broken.lock().unwrap().insert(token);
    }

    pub fn heal(&self) {
        self.broken.lock().unwrap().clear();
        self.fail_next.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ApprovalStore for FailingStore {
    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        self.inner.insert_server(server).await
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        self.inner.get_server(id).await
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        self.inner.list_servers().await
    }

    async fn insert_approval(
        &self,
        approval: &Approval,
        entry: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        self.inner.insert_approval(approval, entry).await
    }

    async fn get_approval(&self, token: Uuid) -> Result<Option<Approval>, StoreError> {
        self.inner.get_approval(token).await
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, StoreError> {
        self.inner.list_approvals(filter).await
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        self.inner.list_overdue(now).await
    }

    async fn transition<'a>(
        &self,
        token: Uuid,
        mutation: Mutation<'a>,
    ) -> Result<Transition, StoreError> {
        let scheduled_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.broken.lock().unwrap().contains(&token) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.transition(token, mutation).await
    }

    async fn audit_log(&self, token: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.inner.audit_log(token).await
    }
}

/// Executor whose run coincides with a store outage of `failures` transitions.
pub struct OutageExecutor {
    pub store: FailingStore,
    pub failures: usize,
}

#[async_trait]
impl RemoteExecutor for OutageExecutor {
    async fn execute(&self, _server: &Server) -> Result<CommandOutput, ExecError> {
        self.store.fail_next_transitions(self.failures);
        Ok(CommandOutput {
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
            truncated: false,
        })
    }
}

pub struct Harness {
    pub service: ApprovalService,
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub executor: Arc<FakeExecutor>,
}

fn build(
    backend: Arc<dyn ApprovalStore>,
    store: MemoryStore,
    executor: FakeExecutor,
    settings: WorkflowSettings,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = Arc::new(executor);
    let trigger = ExecutionTrigger::new(
        backend.clone(),
        clock.clone(),
        executor.clone(),
        Duration::from_secs(5),
    )
    .with_notifier(notifier.clone());
    let service = ApprovalService::new(
        backend,
        clock.clone(),
        notifier.clone(),
        trigger,
        settings,
    );
    Harness {
        service,
        store,
        clock,
        notifier,
        executor,
    }
}

pub fn harness_with(executor: FakeExecutor, settings: WorkflowSettings) -> Harness {
    let store = MemoryStore::new();
    build(Arc::new(store.clone()), store, executor, settings)
}

/// Harness whose service runs on `store`; `Harness::store` is its inner memory store.
pub fn harness_on(store: FailingStore, settings: WorkflowSettings) -> Harness {
    let inner = store.inner.clone();
    build(Arc::new(store), inner, FakeExecutor::new(0), settings)
}

pub fn harness() -> Harness {
    harness_with(FakeExecutor::new(0), WorkflowSettings::default())
}

pub fn new_server(name: &str) -> NewServer {
    NewServer {
        name: name.into(),
        hostname: format!("{}.internal", name),
        ssh_port: None,
        ssh_user: "deploy".into(),
        command: "/opt/backup.sh".into(),
        approvers: vec!["ops@example.com".into()],
    }
}
