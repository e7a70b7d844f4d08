//! Outbound notifications to approvers.
//!
//! Delivery is fire-and-forget: a failed notification is logged and never
//! blocks or reverts an approval transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::models::approval::Approval;
use crate::models::server::Server;

pub mod slack;
pub mod webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Requested,
    Reminder,
    Approved,
    Rejected,
    Expired,
    Executed,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Requested => "approval_requested",
            NoticeKind::Reminder => "approval_reminder",
            NoticeKind::Approved => "approval_approved",
            NoticeKind::Rejected => "approval_rejected",
            NoticeKind::Expired => "approval_expired",
            NoticeKind::Executed => "approval_executed",
        }
    }
}

/// One approval-related message addressed to a server's approvers.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalNotice {
    pub kind: NoticeKind,
    pub token: Uuid,
    pub server_name: String,
    pub hostname: String,
    pub recipients: Vec<String>,
    pub scheduled_for: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub approve_url: Option<String>,
    pub reject_url: Option<String>,
    pub details: serde_json::Value,
}

impl ApprovalNotice {
    pub fn new(kind: NoticeKind, approval: &Approval, server: &Server) -> Self {
        Self {
            kind,
            token: approval.token,
            server_name: server.name.clone(),
            hostname: server.hostname.clone(),
            recipients: server.approvers.clone(),
            scheduled_for: approval.scheduled_for,
            deadline: approval.deadline,
            approve_url: None,
            reject_url: None,
            details: serde_json::Value::Null,
        }
    }

    /// Attach the email-link endpoints for approving and rejecting.
    pub fn with_links(mut self, public_url: &str) -> Self {
        match decision_links(public_url, self.token) {
            Ok((approve, reject)) => {
                self.approve_url = Some(approve);
                self.reject_url = Some(reject);
            }
            Err(e) => tracing::warn!(public_url, error = %e, "cannot build approval links"),
        }
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// `(approve, reject)` URLs for the public email-link endpoints.
pub fn decision_links(public_url: &str, token: Uuid) -> Result<(String, String), url::ParseError> {
    let base = Url::parse(public_url)?;
    let approve = base.join(&format!("approve/{}", token))?;
    let reject = base.join(&format!("reject/{}", token))?;
    Ok((approve.to_string(), reject.to_string()))
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &ApprovalNotice) -> anyhow::Result<()>;
}

/// Fans a notice out to every configured channel.
#[derive(Clone, Default)]
pub struct NotifierSet {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    async fn notify(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        let mut failures = 0usize;
        for channel in &self.channels {
            if let Err(e) = channel.notify(notice).await {
                failures += 1;
                tracing::warn!(
                    token = %notice.token,
                    kind = notice.kind.as_str(),
                    error = %e,
                    "notification channel failed"
                );
            }
        }
        if failures > 0 {
            anyhow::bail!("{} of {} notification channels failed", failures, self.channels.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _notice: &ApprovalNotice) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    #[test]
    fn test_decision_links() {
        let token = Uuid::nil();
        let (approve, reject) = decision_links("https://gate.example.com/", token).unwrap();
        assert_eq!(
            approve,
            "https://gate.example.com/approve/00000000-0000-0000-0000-000000000000"
        );
        assert!(reject.ends_with("/reject/00000000-0000-0000-0000-000000000000"));
        assert!(decision_links("not a url", token).is_err());
    }

    #[tokio::test]
    async fn test_notifier_set_reports_failures() {
        let set = NotifierSet::new().with(Arc::new(Failing));
        let server = crate::models::server::NewServer {
            name: "db".into(),
            hostname: "db".into(),
            ssh_port: None,
            ssh_user: "ops".into(),
            command: "true".into(),
            approvers: vec!["a@example.com".into()],
        }
        .into_server(Utc::now());
        let (approval, _) = Approval::new(
            server.id,
            Utc::now(),
            Utc::now(),
            Utc::now(),
            Default::default(),
        );
        let notice = ApprovalNotice::new(NoticeKind::Requested, &approval, &server);
        assert!(set.notify(&notice).await.is_err());
        assert!(NotifierSet::new().notify(&notice).await.is_ok());
    }
}
