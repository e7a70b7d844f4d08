//! Persistence for servers, approvals and their audit trail.
//!
//! Every approval mutation goes through [`ApprovalStore::transition`], which
//! holds the row lock while the mutation runs and writes the resulting audit
//! entry in the same unit of work as the new row state. A mutation that
//! returns `None` (a refused guard) leaves both untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::approval::{Approval, ApprovalStatus};
use crate::models::audit::AuditLogEntry;
use crate::models::server::Server;

pub mod memory;
pub mod postgres;

/// A guarded change applied to an approval under its row lock.
pub type Mutation<'a> = Box<dyn FnOnce(&mut Approval) -> Option<AuditLogEntry> + Send + 'a>;

/// Box a closure as a [`Mutation`].
pub fn mutation<'a, F>(f: F) -> Mutation<'a>
where
    F: FnOnce(&mut Approval) -> Option<AuditLogEntry> + Send + 'a,
{
    Box::new(f)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("approval not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("server not found: {0}")]
    ServerNotFound(Uuid),

    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Outcome of [`ApprovalStore::transition`].
#[derive(Debug, Clone)]
pub struct Transition {
    /// Row state after the call (unchanged if the guard refused).
    pub approval: Approval,
    /// The audit entry written, if the guard accepted.
    pub entry: Option<AuditLogEntry>,
}

impl Transition {
    pub fn applied(&self) -> bool {
        self.entry.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub server_id: Option<Uuid>,
    pub include_archived: bool,
}

impl ApprovalFilter {
    pub fn matches(&self, approval: &Approval) -> bool {
        self.status.map_or(true, |s| approval.status == s)
            && self.server_id.map_or(true, |id| approval.server_id == id)
            && (self.include_archived || !approval.archived)
    }
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert_server(&self, server: &Server) -> Result<(), StoreError>;

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>, StoreError>;

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    /// Persist a new approval together with its `created` entry.
    async fn insert_approval(
        &self,
        approval: &Approval,
        entry: &AuditLogEntry,
    ) -> Result<(), StoreError>;

    async fn get_approval(&self, token: Uuid) -> Result<Option<Approval>, StoreError>;

    /// Approvals matching `filter`, oldest first.
    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, StoreError>;

    /// Pending approvals whose deadline is strictly before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError>;

    /// Lock the row, apply `mutation`, and persist row + audit entry atomically.
    async fn transition<'a>(
        &self,
        token: Uuid,
        mutation: Mutation<'a>,
    ) -> Result<Transition, StoreError>;

    /// Audit history of an approval, oldest first.
    async fn audit_log(&self, token: Uuid) -> Result<Vec<AuditLogEntry>, StoreError>;
}
