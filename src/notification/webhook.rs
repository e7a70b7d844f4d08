use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ApprovalNotice, Notifier};

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event payload sent to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event type identifier, e.g. "approval_requested", "approval_expired".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub approval_token: String,
    pub server: String,
    pub recipients: Vec<String>,
    /// Event-specific details (deadline, links, exit code, etc.).
    pub details: serde_json::Value,
}

impl WebhookEvent {
    pub fn from_notice(notice: &ApprovalNotice) -> Self {
        Self {
            event_type: notice.kind.as_str().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_token: notice.token.to_string(),
            server: notice.server_name.clone(),
            recipients: notice.recipients.clone(),
            details: serde_json::json!({
                "hostname": notice.hostname,
                "scheduled_for": notice.scheduled_for,
                "deadline": notice.deadline,
                "approve_url": notice.approve_url,
                "reject_url": notice.reject_url,
                "extra": notice.details,
            }),
        }
    }
}

// ── Signing ──────────────────────────────────────────────────

/// `sha256=<hex>` HMAC of the exact request body, sent as `X-Sshgate-Signature`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Posts approval events as signed JSON to every configured URL.
///
/// Delivery happens inside `notify`, so a one-shot CLI pass does not exit
/// with a webhook still in flight. Each URL gets the attempts in `backoff`
/// (default: immediately, then after 1s, 5s and 25s, plus jitter).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    secret: Option<String>,
    backoff: Vec<Duration>,
}

/// One signed delivery: the body and headers stay identical across retries.
struct Delivery<'a> {
    event_type: &'a str,
    id: String,
    timestamp: String,
    body: Vec<u8>,
    signature: Option<String>,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>, secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("sshgate-webhook/1.0")
                .build()
                .unwrap_or_default(),
            urls,
            secret,
            backoff: [0, 1, 5, 25].into_iter().map(Duration::from_secs).collect(),
        }
    }

    /// Override the retry schedule. The first delay applies to the first attempt.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    fn prepare<'a>(&self, event: &'a WebhookEvent) -> Result<Delivery<'a>> {
        let body = serde_json::to_vec(event).context("cannot serialize webhook event")?;
        Ok(Delivery {
            event_type: &event.event_type,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp().to_string(),
            signature: self.secret.as_deref().map(|secret| sign(secret, &body)),
            body,
        })
    }

    async fn post_once(&self, url: &str, delivery: &Delivery<'_>) -> Result<()> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("x-sshgate-event", delivery.event_type)
            .header("x-sshgate-delivery-id", &delivery.id)
            .header("x-sshgate-timestamp", &delivery.timestamp);
        if let Some(sig) = &delivery.signature {
            req = req.header("x-sshgate-signature", sig);
        }

        let resp = req.body(delivery.body.clone()).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("endpoint answered {}: {}", status, body)
    }

    /// Deliver `event` to one URL, walking the retry schedule until a 2xx.
    pub async fn deliver(&self, url: &str, event: &WebhookEvent) -> Result<()> {
        let delivery = self.prepare(event)?;
        let mut last_err = None;

        for (attempt, &delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(delay + jitter).await;
            }
            match self.post_once(url, &delivery).await {
                Ok(()) => {
                    info!(url, event_type = delivery.event_type, delivery_id = %delivery.id, attempt, "webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    debug!(url, delivery_id = %delivery.id, attempt, error = %e, "webhook attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let cause = last_err.map(|e| e.to_string()).unwrap_or_else(|| "no attempts configured".into());
        anyhow::bail!(
            "webhook {} not delivered to {} after {} attempt(s): {}",
            delivery.id,
            url,
            self.backoff.len(),
            cause
        )
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &ApprovalNotice) -> Result<()> {
        if self.urls.is_empty() {
            debug!("no webhook URLs configured, skipping notification");
            return Ok(());
        }

        let event = WebhookEvent::from_notice(notice);
        let outcomes =
            futures::future::join_all(self.urls.iter().map(|url| self.deliver(url, &event))).await;

        let mut failed = 0usize;
        for (url, outcome) in self.urls.iter().zip(outcomes) {
            if let Err(e) = outcome {
                failed += 1;
                warn!(url, token = %notice.token, error = %e, "webhook delivery failed");
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} webhook endpoints unreachable", failed, self.urls.len());
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────
