use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host and user names may never start with `-`, so they can't be read as ssh options.
static SSH_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// A machine whose maintenance script is gated behind an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub ssh_port: i32,
    pub ssh_user: String,
    /// Command run on the host once an approval is granted.
    pub command: String,
    /// Notification recipients (addresses or chat handles).
    pub approvers: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub hostname: String,
    pub ssh_port: Option<i32>,
    pub ssh_user: String,
    pub command: String,
    pub approvers: Vec<String>,
}

impl NewServer {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if !SSH_NAME_RE.is_match(&self.hostname) {
            return Err(format!("invalid hostname: '{}'", self.hostname));
        }
        if !SSH_NAME_RE.is_match(&self.ssh_user) {
            return Err(format!("invalid ssh user: '{}'", self.ssh_user));
        }
        if let Some(port) = self.ssh_port {
            if !(1..=65535).contains(&port) {
                return Err(format!("invalid ssh port: {}", port));
            }
        }
        if self.command.trim().is_empty() {
            return Err("command must not be empty".into());
        }
        if self.approvers.iter().all(|a| a.trim().is_empty()) {
            return Err("at least one approver is required".into());
        }
        Ok(())
    }

    pub fn into_server(self, now: DateTime<Utc>) -> Server {
        Server {
            id: Uuid::new_v4(),
            name: self.name,
            hostname: self.hostname,
            ssh_port: self.ssh_port.unwrap_or(22),
            ssh_user: self.ssh_user,
            command: self.command,
            approvers: self
                .approvers
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            is_active: true,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewServer {
        NewServer {
            name: "db-01".into(),
            hostname: "db-01.internal".into(),
            ssh_port: None,
            ssh_user: "deploy".into(),
            command: "/opt/maintenance/run.sh".into(),
            approvers: vec!["ops@example.com".into()],
        }
    }

    #[test]
    fn test_valid_server() {
        let s = sample();
        assert!(s.validate().is_ok());
        let server = s.into_server(Utc::now());
        assert_eq!(server.ssh_port, 22);
        assert!(server.is_active);
    }

    #[test]
    fn test_option_injection_rejected() {
        let mut s = sample();
        s.hostname = "-oProxyCommand=evil".into();
        assert!(s.validate().is_err());

        let mut s = sample();
        s.ssh_user = "-l root".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_requires_approver_and_command() {
        let mut s = sample();
        s.approvers = vec!["  ".into()];
        assert!(s.validate().is_err());

        let mut s = sample();
        s.command = String::new();
        assert!(s.validate().is_err());

        let mut s = sample();
        s.ssh_port = Some(70000);
        assert!(s.validate().is_err());
    }
}
