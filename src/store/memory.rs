//! In-process store. DashMap entry guards stand in for row locks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{ApprovalFilter, ApprovalStore, Mutation, StoreError, Transition};
use crate::models::approval::Approval;
use crate::models::audit::AuditLogEntry;
use crate::models::server::Server;

#[derive(Clone, Default)]
pub struct MemoryStore {
    servers: Arc<DashMap<Uuid, Server>>,
    approvals: Arc<DashMap<Uuid, Approval>>,
    audit: Arc<DashMap<Uuid, Vec<AuditLogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        if self.servers.iter().any(|s| s.name == server.name) {
            return Err(StoreError::DuplicateServer(server.name.clone()));
        }
        self.servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<Server>, StoreError> {
        Ok(self.servers.get(&id).map(|s| s.clone()))
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let mut servers: Vec<Server> = self.servers.iter().map(|s| s.clone()).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn insert_approval(
        &self,
        approval: &Approval,
        entry: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        if !self.servers.contains_key(&approval.server_id) {
            return Err(StoreError::ServerNotFound(approval.server_id));
        }
        self.approvals.insert(approval.token, approval.clone());
        self.audit.entry(approval.token).or_default().push(entry.clone());
        Ok(())
    }

    async fn get_approval(&self, token: Uuid) -> Result<Option<Approval>, StoreError> {
        Ok(self.approvals.get(&token).map(|a| a.clone()))
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, StoreError> {
        let mut rows: Vec<Approval> = self
            .approvals
            .iter()
            .filter(|a| filter.matches(a))
            .map(|a| a.clone())
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, StoreError> {
        let mut rows: Vec<Approval> = self
            .approvals
            .iter()
            .filter(|a| a.is_pending() && a.deadline < now)
            .map(|a| a.clone())
            .collect();
        rows.sort_by_key(|a| a.deadline);
        Ok(rows)
    }

    async fn transition<'a>(
        &self,
        token: Uuid,
        mutation: Mutation<'a>,
    ) -> Result<Transition, StoreError> {
        let mut row = self
            .approvals
            .get_mut(&token)
            .ok_or(StoreError::ApprovalNotFound(token))?;

        // Work on a copy so a refused guard can never leave a partial write.
        let mut draft = row.clone();
        let entry = mutation(&mut draft);
        if let Some(ref entry) = entry {
            self.audit.entry(token).or_default().push(entry.clone());
            *row = draft.clone();
        }
        Ok(Transition {
            approval: row.clone(),
            entry,
        })
    }

    async fn audit_log(&self, token: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self.audit.get(&token).map(|e| e.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mutation;
    use crate::models::approval::{ApprovalMethod, ApprovalStatus, ReminderState};
    use crate::models::audit::AuditAction;
    use crate::models::server::NewServer;
    use chrono::Duration;

    async fn seeded() -> (MemoryStore, Approval) {
        let store = MemoryStore::new();
        let server = NewServer {
            name: "web-01".into(),
            hostname: "web-01".into(),
            ssh_port: None,
            ssh_user: "ops".into(),
            command: "uptime".into(),
            approvers: vec!["ops@example.com".into()],
        }
        .into_server(Utc::now());
        store.insert_server(&server).await.unwrap();

        let now = Utc::now();
        let (approval, entry) =
            Approval::new(server.id, now, now, now + Duration::hours(24), ReminderState::default());
        store.insert_approval(&approval, &entry).await.unwrap();
        (store, approval)
    }

    #[tokio::test]
    async fn test_transition_applies_and_audits() {
        let (store, approval) = seeded().await;
        let now = Utc::now();
        let t = store
            .transition(
                approval.token,
                mutation(move |a| a.approve("alice", ApprovalMethod::Api, now)),
            )
            .await
            .unwrap();
        assert!(t.applied());
        assert_eq!(t.approval.status, ApprovalStatus::Approved);

        let log = store.audit_log(approval.token).await.unwrap();
        let actions: Vec<_> = log.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Approved]);
    }

    #[tokio::test]
    async fn test_refused_transition_writes_nothing() {
        let (store, approval) = seeded().await;
        let t = store
            .transition(approval.token, mutation(|_| None))
            .await
            .unwrap();
        assert!(!t.applied());
        assert_eq!(store.audit_log(approval.token).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (store, _) = seeded().await;
        let err = store
            .transition(Uuid::new_v4(), mutation(|_| None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_server_name() {
        let (store, _) = seeded().await;
        let dup = NewServer {
            name: "web-01".into(),
            hostname: "web-02".into(),
            ssh_port: None,
            ssh_user: "ops".into(),
            command: "uptime".into(),
            approvers: vec!["ops@example.com".into()],
        }
        .into_server(Utc::now());
        assert!(matches!(
            store.insert_server(&dup).await,
            Err(StoreError::DuplicateServer(_))
        ));
    }

    #[tokio::test]
    async fn test_list_overdue_only_pending() {
        let (store, approval) = seeded().await;
        let later = approval.deadline + Duration::hours(1);
        assert_eq!(store.list_overdue(later).await.unwrap().len(), 1);
        assert!(store.list_overdue(approval.deadline).await.unwrap().is_empty());

        store
            .transition(approval.token, mutation(move |a| a.mark_expired(later)))
            .await
            .unwrap();
        assert!(store.list_overdue(later).await.unwrap().is_empty());
    }
}
