use clap::{Parser, Subcommand};

/// sshgate: approval gate for scheduled SSH maintenance runs
#[derive(Parser)]
#[command(name = "sshgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and background jobs
    Serve {
        /// Port to bind (overrides SSHGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage gated servers
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Manage approval requests
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Run a single pass of a background job (for cron)
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Register a server and its maintenance command
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        port: Option<i32>,
        #[arg(long)]
        user: String,
        #[arg(long)]
        command: String,
        /// Comma-separated notification recipients
        #[arg(long, value_delimiter = ',')]
        approvers: Vec<String>,
    },
    /// List registered servers
    List,
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// Open a new approval request for a server
    Schedule {
        #[arg(long)]
        server_id: String,
        /// RFC 3339 timestamp of the planned run (defaults to now)
        #[arg(long)]
        scheduled_for: Option<String>,
    },
    /// List approval requests
    List {
        /// pending, approved, rejected or expired
        #[arg(short, long)]
        status: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Show one approval and its audit trail
    Show { token: String },
    /// Approve a pending request
    Approve {
        token: String,
        #[arg(long, env = "USER")]
        by: String,
    },
    /// Reject a pending request
    Reject {
        token: String,
        #[arg(long, default_value = "rejected from CLI")]
        reason: String,
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// Hide a decided request from default listings
    Archive {
        token: String,
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Expire pending approvals past their deadline
    Expire,
    /// Send due reminders
    Remind,
    /// Fail interrupted executions and dispatch approved ones that never ran
    Executions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_add() {
        let cli = Cli::try_parse_from([
            "sshgate",
            "server",
            "add",
            "--name",
            "db-01",
            "--hostname",
            "db-01.internal",
            "--user",
            "deploy",
            "--command",
            "/opt/backup.sh",
            "--approvers",
            "a@example.com,b@example.com",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Server {
                command: ServerCommands::Add { approvers, port, .. },
            }) => {
                assert_eq!(approvers.len(), 2);
                assert_eq!(port, None);
            }
            _ => panic!("expected server add"),
        }
    }

    #[test]
    fn test_parse_jobs() {
        let cli = Cli::try_parse_from(["sshgate", "jobs", "expire"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Jobs {
                command: JobCommands::Expire
            })
        ));
        let cli = Cli::try_parse_from(["sshgate", "jobs", "executions"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Jobs {
                command: JobCommands::Executions
            })
        ));
    }
}
