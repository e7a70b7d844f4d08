//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sshgate::clock::ManualClock;
use sshgate::config::Config;
use sshgate::models::server::{NewServer, Server};
use sshgate::notification::{ApprovalNotice, NoticeKind, Notifier};
use sshgate::ssh::{CommandOutput, ExecError, RemoteExecutor};
use sshgate::store::memory::MemoryStore;
use sshgate::workflow::{ApprovalService, ExecutionTrigger, WorkflowSettings};

pub const ADMIN_KEY: &str = "test-admin-key-0123456789";

/// Monday 08:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<ApprovalNotice>>,
}

impl RecordingNotifier {
    pub fn count(&self, kind: NoticeKind) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Notifier that always fails, for fire-and-forget checks.
pub struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _notice: &ApprovalNotice) -> anyhow::Result<()> {
        anyhow::bail!("mail relay unreachable")
    }
}

pub struct ScriptedExecutor {
    calls: AtomicUsize,
    exit_code: i32,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(exit_code: i32, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            exit_code,
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, server: &Server) -> Result<CommandOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(CommandOutput {
            exit_code: self.exit_code,
            stdout: format!("{} done", server.command),
            stderr: String::new(),
            truncated: false,
        })
    }
}

pub struct Env {
    pub service: ApprovalService,
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub executor: Arc<ScriptedExecutor>,
}

pub struct EnvBuilder {
    executor: ScriptedExecutor,
    timeout: Duration,
    notifier: Option<Arc<dyn Notifier>>,
    settings: WorkflowSettings,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self {
            executor: ScriptedExecutor::new(0, Duration::ZERO),
            timeout: Duration::from_secs(5),
            notifier: None,
            settings: WorkflowSettings::from(&Config::default()),
        }
    }

    pub fn executor(mut self, executor: ScriptedExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Env {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let recording = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn Notifier> = self
            .notifier
            .unwrap_or_else(|| recording.clone() as Arc<dyn Notifier>);
        let executor = Arc::new(self.executor);
        let trigger = ExecutionTrigger::new(
            Arc::new(store.clone()),
            clock.clone(),
            executor.clone(),
            self.timeout,
        );
        let service = ApprovalService::new(
            Arc::new(store.clone()),
            clock.clone(),
            notifier,
            trigger,
            self.settings,
        );
        Env {
            service,
            store,
            clock,
            notifier: recording,
            executor,
        }
    }
}

pub fn env() -> Env {
    EnvBuilder::new().build()
}

pub fn new_server(name: &str) -> NewServer {
    NewServer {
        name: name.into(),
        hostname: format!("{}.internal", name),
        ssh_port: Some(22),
        ssh_user: "deploy".into(),
        command: "/usr/local/bin/nightly-backup".into(),
        approvers: vec!["ops@example.com".into(), "lead@example.com".into()],
    }
}
