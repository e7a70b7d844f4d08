use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{ApprovalFilter, ApprovalStore, Mutation, StoreError, Transition};
use crate::models::approval::{Approval, ApprovalMethod, ApprovalStatus, ExecutionStatus, ReminderState};
use crate::models::audit::AuditLogEntry;
use crate::models::server::Server;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn append_audit(
        tx: &mut Transaction<'_, Postgres>,
        entry: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO approval_audit_log (id, approval_token, action, actor, method, timestamp, detail)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(entry.id)
        .bind(entry.approval_token)
        .bind(entry.action)
        .bind(&entry.actor)
        .bind(entry.method)
        .bind(entry.timestamp)
        .bind(&entry.detail)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for PgStore {
    // -- Server Operations --

    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO servers (id, name, hostname, ssh_port, ssh_user, command, approvers, is_active, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.hostname)
        .bind(server.ssh_port)
        .bind(&server.ssh_user)
        .bind(&server.command)
        .bind(&server.approvers)
        .bind(server.is_active)
        .bind(server.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateServer(server.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -- Approval Operations --

    async fn insert_approval(
        &self,
        approval: &Approval,
        entry: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"INSERT INTO approvals (
                   token, server_id, scheduled_for, created_at, deadline, status,
                   reminder_1_at, reminder_2_at, reminder_3_at, execution_status, archived)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(approval.token)
        .bind(approval.server_id)
        .bind(approval.scheduled_for)
        .bind(approval.created_at)
        .bind(approval.deadline)
        .bind(approval.status)
        .bind(approval.reminders.scheduled[0])
        .bind(approval.reminders.scheduled[1])
        .bind(approval.reminders.scheduled[2])
        .bind(approval.execution_status)
        .bind(approval.archived)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(e)) = &result {
            if e.is_foreign_key_violation() {
                return Err(StoreError::ServerNotFound(approval.server_id));
            }
        }
        result?;

        Self::append_audit(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_approval(&self, token: Uuid) -> Result<Option<Approval>, StoreError> {
        let row = sqlx::query_as::<_, ApprovalRow>("SELECT * FROM approvals WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Approval::from))
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, StoreError> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"SELECT * FROM approvals
               WHERE ($1::varchar IS NULL OR status = $1)
                 AND ($2::uuid IS NULL OR server_id = $2)
                 AND ($3 OR archived = FALSE)
               ORDER BY created_at ASC"#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.server_id)
        .bind(filter.include_archived)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Approval::from).collect())
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            "SELECT * FROM approvals WHERE status = 'pending' AND deadline < $1 ORDER BY deadline ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Approval::from).collect())
    }

    async fn transition<'a>(
        &self,
        token: Uuid,
        mutation: Mutation<'a>,
    ) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock: concurrent transitions on the same token serialize here.
        let row = sqlx::query_as::<_, ApprovalRow>(
            "SELECT * FROM approvals WHERE token = $1 FOR UPDATE",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::ApprovalNotFound(token))?;
        let current = Approval::from(row);

        let mut next = current.clone();
        let Some(entry) = mutation(&mut next) else {
            tx.rollback().await?;
            return Ok(Transition {
                approval: current,
                entry: None,
            });
        };

        sqlx::query(
            r#"UPDATE approvals SET
                   status = $2, approved_by = $3, approval_method = $4, decided_at = $5,
                   rejection_reason = $6,
                   reminder_1_sent = $7, reminder_2_sent = $8, reminder_3_sent = $9,
                   execution_status = $10, exit_code = $11, execution_output = $12,
                   execution_error = $13, executed_at = $14, archived = $15,
                   execution_started_at = $16
               WHERE token = $1"#,
        )
        .bind(next.token)
        .bind(next.status)
        .bind(&next.approved_by)
        .bind(next.approval_method)
        .bind(next.decided_at)
        .bind(&next.rejection_reason)
        .bind(next.reminders.sent[0])
        .bind(next.reminders.sent[1])
        .bind(next.reminders.sent[2])
        .bind(next.execution_status)
        .bind(next.exit_code)
        .bind(&next.execution_output)
        .bind(&next.execution_error)
        .bind(next.executed_at)
        .bind(next.archived)
        .bind(next.execution_started_at)
        .execute(&mut *tx)
        .await?;

        Self::append_audit(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok(Transition {
            approval: next,
            entry: Some(entry),
        })
    }

    async fn audit_log(&self, token: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM approval_audit_log WHERE approval_token = $1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(token)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// -- Row structs --

#[derive(Debug, sqlx::FromRow)]
struct ApprovalRow {
    token: Uuid,
    server_id: Uuid,
    scheduled_for: DateTime<Utc>,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    status: ApprovalStatus,
    approved_by: Option<String>,
    approval_method: Option<ApprovalMethod>,
    decided_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    reminder_1_at: Option<DateTime<Utc>>,
    reminder_2_at: Option<DateTime<Utc>>,
    reminder_3_at: Option<DateTime<Utc>>,
    reminder_1_sent: bool,
    reminder_2_sent: bool,
    reminder_3_sent: bool,
    execution_status: ExecutionStatus,
    exit_code: Option<i32>,
    execution_output: Option<String>,
    execution_error: Option<String>,
    execution_started_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    archived: bool,
}

impl From<ApprovalRow> for Approval {
    fn from(row: ApprovalRow) -> Self {
        Approval {
            token: row.token,
            server_id: row.server_id,
            scheduled_for: row.scheduled_for,
            created_at: row.created_at,
            deadline: row.deadline,
            status: row.status,
            approved_by: row.approved_by,
            approval_method: row.approval_method,
            decided_at: row.decided_at,
            rejection_reason: row.rejection_reason,
            reminders: ReminderState {
                scheduled: [row.reminder_1_at, row.reminder_2_at, row.reminder_3_at],
                sent: [row.reminder_1_sent, row.reminder_2_sent, row.reminder_3_sent],
            },
            execution_status: row.execution_status,
            exit_code: row.exit_code,
            execution_output: row.execution_output,
            execution_error: row.execution_error,
            execution_started_at: row.execution_started_at,
            executed_at: row.executed_at,
            archived: row.archived,
        }
    }
}
