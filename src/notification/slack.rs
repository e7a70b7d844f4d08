use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::{ApprovalNotice, NoticeKind, Notifier};

#[derive(Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            webhook_url,
        }
    }
}

fn render(notice: &ApprovalNotice) -> String {
    let headline = match notice.kind {
        NoticeKind::Requested => "🚨 *Approval Required* 🚨",
        NoticeKind::Reminder => "⏰ *Approval Reminder*",
        NoticeKind::Approved => "✅ *Approved*",
        NoticeKind::Rejected => "⛔ *Rejected*",
        NoticeKind::Expired => "⌛ *Approval Expired*",
        NoticeKind::Executed => "🛠️ *Maintenance Executed*",
    };

    let mut text = format!(
        "{}\n\nServer: `{}` ({})\nToken: `{}`\nScheduled: {}\nDeadline: {}",
        headline,
        notice.server_name,
        notice.hostname,
        notice.token,
        notice.scheduled_for,
        notice.deadline
    );
    if let (Some(approve), Some(reject)) = (&notice.approve_url, &notice.reject_url) {
        text.push_str(&format!("\n\nApprove: {}\nReject: {}", approve, reject));
    }
    if !notice.details.is_null() {
        text.push_str(&format!(
            "\n```{}```",
            serde_json::to_string_pretty(&notice.details).unwrap_or_default()
        ));
    }
    text
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        let url = match &self.webhook_url {
            Some(u) => u,
            None => {
                tracing::debug!("No Slack webhook URL configured, skipping notification");
                return Ok(());
            }
        };

        let message = SlackMessage {
            text: render(notice),
        };

        let resp = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .context("failed to send slack notification")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("slack returned error: status={}, body={}", status, body);
        }

        tracing::info!(token = %notice.token, kind = notice.kind.as_str(), "Sent Slack notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}
