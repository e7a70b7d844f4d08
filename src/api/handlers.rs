use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    Form, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::approval::{Approval, ApprovalMethod, ApprovalStatus};
use crate::models::audit::AuditLogEntry;
use crate::models::server::{NewServer, Server};
use crate::store::ApprovalFilter;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct ScheduleRequest {
    pub server_id: Uuid,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub decision: String, // "approve" | "reject"
    pub actor: String,
    pub method: Option<String>,
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct DecisionResponse {
    pub token: Uuid,
    pub status: String,
    pub updated: bool,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub server_id: Option<Uuid>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Deserialize)]
pub struct ArchiveParams {
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct LinkForm {
    pub by: Option<String>,
    pub reason: Option<String>,
}

fn parse_token(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        tracing::warn!("invalid approval token: {}", raw);
        AppError::BadRequest(format!("invalid approval token: {}", raw))
    })
}

// ── Servers ───────────────────────────────────────────────────

/// GET /api/v1/servers
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Server>>, AppError> {
    Ok(Json(state.service.list_servers().await?))
}

/// POST /api/v1/servers
pub async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewServer>,
) -> Result<impl IntoResponse, AppError> {
    let server = state.service.add_server(payload).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

// ── Approvals ─────────────────────────────────────────────────

/// GET /api/v1/approvals
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Approval>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ApprovalStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = ApprovalFilter {
        status,
        server_id: params.server_id,
        include_archived: params.include_archived,
    };
    Ok(Json(state.service.list(&filter).await?))
}

/// POST /api/v1/approvals: open a new approval request
pub async fn schedule_approval(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let approval = state
        .service
        .schedule(payload.server_id, payload.scheduled_for)
        .await?;
    Ok((StatusCode::CREATED, Json(approval)))
}

/// GET /api/v1/approvals/:token
pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Approval>, AppError> {
    let token = parse_token(&token)?;
    Ok(Json(state.service.get(token).await?))
}

/// GET /api/v1/approvals/:token/audit
pub async fn get_audit_log(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Vec<AuditLogEntry>>, AppError> {
    let token = parse_token(&token)?;
    Ok(Json(state.service.audit_log(token).await?))
}

/// POST /api/v1/approvals/:token/decision: approve or reject
pub async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(payload): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let token = parse_token(&token)?;
    let method = payload
        .method
        .as_deref()
        .map(str::parse::<ApprovalMethod>)
        .transpose()
        .map_err(AppError::BadRequest)?
        .unwrap_or(ApprovalMethod::Api);

    tracing::info!(
        token = %token,
        decision = %payload.decision,
        actor = %payload.actor,
        "decide_approval"
    );

    let updated = match payload.decision.to_lowercase().as_str() {
        "approved" | "approve" => {
            state
                .service
                .approve(token, &payload.actor, method)
                .await?
        }
        "rejected" | "reject" => {
            let reason = payload.reason.as_deref().unwrap_or("rejected");
            state
                .service
                .reject(token, reason, Some(&payload.actor), Some(method))
                .await?
        }
        other => {
            tracing::warn!("decide_approval: invalid decision: {}", other);
            return Err(AppError::BadRequest(format!("invalid decision: {}", other)));
        }
    };

    let current = state.service.get(token).await?;
    if !updated {
        return Err(AppError::Conflict(format!(
            "approval {} is {} and can no longer be decided",
            token,
            current.status.as_str()
        )));
    }

    Ok(Json(DecisionResponse {
        token,
        status: current.status.as_str().to_string(),
        updated,
    }))
}

/// POST /api/v1/approvals/:token/archive
pub async fn archive_approval(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(params): Query<ArchiveParams>,
) -> Result<Json<DecisionResponse>, AppError> {
    let token = parse_token(&token)?;
    let updated = state
        .service
        .archive(token, params.actor.as_deref())
        .await?;
    let current = state.service.get(token).await?;
    if !updated {
        return Err(AppError::Conflict(format!(
            "approval {} cannot be archived while {}",
            token,
            if current.archived { "archived" } else { current.status.as_str() }
        )));
    }
    Ok(Json(DecisionResponse {
        token,
        status: current.status.as_str().to_string(),
        updated,
    }))
}

// ── Email links ───────────────────────────────────────────────
//
// GET only renders a confirmation form: mail scanners and link unfurlers
// fetch URLs on their own. The decision is taken by the form's POST.

fn link_page(status: StatusCode, title: &str, body: &str) -> (StatusCode, Html<String>) {
    (
        status,
        Html(format!(
            "<!doctype html><html><head><title>{title}</title></head>\
             <body><h1>{title}</h1>{body}</body></html>"
        )),
    )
}

/// Why an approval can no longer take `verb`, or `None` if it can.
fn undecidable(approval: &Approval, now: DateTime<Utc>, verb: &str) -> Option<String> {
    if !approval.is_pending() {
        return Some(format!(
            "<p>This request is {} and can no longer be {}.</p>",
            approval.status.as_str(),
            verb
        ));
    }
    if verb == "approved" && approval.is_past_deadline(now) {
        return Some("<p>The approval deadline has passed.</p>".to_string());
    }
    None
}

fn actor_or_default(by: Option<String>) -> String {
    by.map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "email-link".to_string())
}

/// GET /approve/:token: confirmation form
pub async fn confirm_approve(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<(StatusCode, Html<String>), AppError> {
    let token = parse_token(&token)?;
    let approval = state.service.get(token).await?;
    if let Some(why) = undecidable(&approval, state.service.now(), "approved") {
        return Ok(link_page(StatusCode::CONFLICT, "Not approvable", &why));
    }
    Ok(link_page(
        StatusCode::OK,
        "Approve maintenance run?",
        &format!(
            "<p>Approval {token} expires at {deadline}.</p>\
             <form method=\"post\">\
             <label>Your name or email <input name=\"by\" required></label>\
             <button type=\"submit\">Approve and run</button></form>",
            deadline = approval.deadline.to_rfc3339(),
        ),
    ))
}

/// POST /approve/:token (form: by)
pub async fn approve_link(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Form(form): Form<LinkForm>,
) -> Result<(StatusCode, Html<String>), AppError> {
    let token = parse_token(&token)?;
    let actor = actor_or_default(form.by);
    if state
        .service
        .approve(token, &actor, ApprovalMethod::EmailLink)
        .await?
    {
        return Ok(link_page(
            StatusCode::OK,
            "Approved",
            "<p>The maintenance run has been approved and dispatched.</p>",
        ));
    }
    let current = state.service.get(token).await?;
    let why = undecidable(&current, state.service.now(), "approved")
        .unwrap_or_else(|| "<p>This request can no longer be approved.</p>".to_string());
    Ok(link_page(StatusCode::CONFLICT, "Not approved", &why))
}

/// GET /reject/:token: confirmation form
pub async fn confirm_reject(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<(StatusCode, Html<String>), AppError> {
    let token = parse_token(&token)?;
    let approval = state.service.get(token).await?;
    if let Some(why) = undecidable(&approval, state.service.now(), "rejected") {
        return Ok(link_page(StatusCode::CONFLICT, "Not rejectable", &why));
    }
    Ok(link_page(
        StatusCode::OK,
        "Reject maintenance run?",
        &format!(
            "<p>Approval {token}.</p>\
             <form method=\"post\">\
             <label>Your name or email <input name=\"by\" required></label>\
             <label>Reason <input name=\"reason\"></label>\
             <button type=\"submit\">Reject</button></form>"
        ),
    ))
}

/// POST /reject/:token (form: by, reason)
pub async fn reject_link(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Form(form): Form<LinkForm>,
) -> Result<(StatusCode, Html<String>), AppError> {
    let token = parse_token(&token)?;
    let actor = actor_or_default(form.by);
    let reason = form
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "rejected via email link".to_string());
    if state
        .service
        .reject(token, &reason, Some(&actor), Some(ApprovalMethod::EmailLink))
        .await?
    {
        return Ok(link_page(
            StatusCode::OK,
            "Rejected",
            "<p>The maintenance run has been rejected.</p>",
        ));
    }
    let current = state.service.get(token).await?;
    let why = undecidable(&current, state.service.now(), "rejected")
        .unwrap_or_else(|| "<p>This request can no longer be rejected.</p>".to_string());
    Ok(link_page(StatusCode::CONFLICT, "Not rejected", &why))
}

// ── Ops ───────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::encode_metrics(),
    )
}
