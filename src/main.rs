use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use sshgate::clock::SystemClock;
use sshgate::config::{self, Config, StoreBackend};
use sshgate::models::approval::{ApprovalMethod, ApprovalStatus};
use sshgate::models::server::NewServer;
use sshgate::notification::slack::SlackNotifier;
use sshgate::notification::webhook::WebhookNotifier;
use sshgate::notification::NotifierSet;
use sshgate::ssh::SshExecutor;
use sshgate::store::memory::MemoryStore;
use sshgate::store::postgres::PgStore;
use sshgate::store::{ApprovalFilter, ApprovalStore};
use sshgate::workflow::{ApprovalService, ExecutionTrigger, WorkflowSettings};
use sshgate::{api, cli, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Export spans over OTLP only when a collector endpoint is configured.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sshgate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json_logs = std::env::var("SSHGATE_LOG_FORMAT").as_deref() == Ok("json");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sshgate=debug,tower_http=debug".into()),
        ))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with(telemetry_layer)
        .init();

    let cfg = config::init(config::load()?)?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port.unwrap_or(cfg.port)).await,
        Some(cli::Commands::Server { command }) => {
            let service = build_service(cfg).await?;
            handle_server_command(&service, command).await
        }
        Some(cli::Commands::Approval { command }) => {
            let service = build_service(cfg).await?;
            let result = handle_approval_command(&service, command).await;
            // An approval from the CLI dispatches the remote run; wait for it.
            service.trigger().drain().await;
            result
        }
        Some(cli::Commands::Jobs { command }) => {
            let service = build_service(cfg).await?;
            let result = handle_job_command(&service, command).await;
            service.trigger().drain().await;
            result
        }
        None => run_server(cfg, cfg.port).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn ApprovalStore>> {
    match cfg.store {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; approvals are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
    }
}

async fn build_service(cfg: &Config) -> anyhow::Result<ApprovalService> {
    let store = build_store(cfg).await?;
    let clock = Arc::new(SystemClock);

    let mut channels = NotifierSet::new();
    if cfg.slack_webhook_url.is_some() {
        channels = channels.with(Arc::new(SlackNotifier::new(cfg.slack_webhook_url.clone())));
    }
    if !cfg.webhook_urls.is_empty() {
        channels = channels.with(Arc::new(WebhookNotifier::new(
            cfg.webhook_urls.clone(),
            cfg.webhook_secret.clone(),
        )));
    }
    if channels.is_empty() {
        tracing::warn!("No notification channel configured; approvers will not be told about requests");
    }
    let notifier = Arc::new(channels);

    let executor = Arc::new(SshExecutor::new(cfg.ssh_binary.clone(), cfg.ssh_identity.clone()));
    let mut trigger = ExecutionTrigger::new(store.clone(), clock.clone(), executor, cfg.ssh_timeout());
    if cfg.toggles.notifications {
        trigger = trigger.with_notifier(notifier.clone());
    }

    Ok(ApprovalService::new(
        store,
        clock,
        notifier,
        trigger,
        WorkflowSettings::from(cfg),
    ))
}

async fn run_server(cfg: &Config, port: u16) -> anyhow::Result<()> {
    let service = build_service(cfg).await?;

    let state = Arc::new(AppState {
        service: service.clone(),
        config: cfg.clone(),
    });
    let app = api::app(state);

    let reminders = jobs::reminders::spawn(
        service.clone(),
        Duration::from_secs(cfg.reminder_interval_secs),
    );
    let expiry = jobs::expiry::spawn(
        service.clone(),
        Duration::from_secs(cfg.deadline_interval_secs),
    );
    let executions = jobs::executions::spawn(
        service.clone(),
        Duration::from_secs(cfg.execution_sweep_interval_secs),
    );
    tracing::info!(
        reminder_every_secs = cfg.reminder_interval_secs,
        deadline_every_secs = cfg.deadline_interval_secs,
        execution_sweep_every_secs = cfg.execution_sweep_interval_secs,
        "Background jobs started"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sshgate listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reminders.abort();
    expiry.abort();
    executions.abort();
    tracing::info!("Waiting for in-flight executions...");
    service.trigger().drain().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

fn parse_uuid(raw: &str, what: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid {}: {}", what, raw))
}

async fn handle_server_command(
    service: &ApprovalService,
    cmd: cli::ServerCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::ServerCommands::Add {
            name,
            hostname,
            port,
            user,
            command,
            approvers,
        } => {
            let server = service
                .add_server(NewServer {
                    name,
                    hostname,
                    ssh_port: port,
                    ssh_user: user,
                    command,
                    approvers,
                })
                .await?;
            println!("Server registered: {}", server.name);
            println!("   ID: {}", server.id);
        }
        cli::ServerCommands::List => {
            let servers = service.list_servers().await?;
            if servers.is_empty() {
                println!("No servers registered.");
                return Ok(());
            }
            println!("{:<38} {:<20} {:<30} APPROVERS", "ID", "NAME", "TARGET");
            for s in servers {
                println!(
                    "{:<38} {:<20} {:<30} {}",
                    s.id,
                    s.name,
                    format!("{}@{}:{}", s.ssh_user, s.hostname, s.ssh_port),
                    s.approvers.join(",")
                );
            }
        }
    }
    Ok(())
}

async fn handle_approval_command(
    service: &ApprovalService,
    cmd: cli::ApprovalCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::ApprovalCommands::Schedule {
            server_id,
            scheduled_for,
        } => {
            let server_id = parse_uuid(&server_id, "server id")?;
            let scheduled_for = scheduled_for
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|t| t.with_timezone(&Utc))
                        .with_context(|| format!("invalid --scheduled-for: {}", raw))
                })
                .transpose()?;
            let approval = service.schedule(server_id, scheduled_for).await?;
            println!("Approval requested:");
            println!("   Token:    {}", approval.token);
            println!("   Deadline: {}", approval.deadline.to_rfc3339());
        }
        cli::ApprovalCommands::List { status, all } => {
            let status = status
                .as_deref()
                .map(str::parse::<ApprovalStatus>)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let approvals = service
                .list(&ApprovalFilter {
                    status,
                    server_id: None,
                    include_archived: all,
                })
                .await?;
            if approvals.is_empty() {
                println!("No approvals.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:<10} DEADLINE", "TOKEN", "STATUS", "EXECUTION");
            for a in approvals {
                println!(
                    "{:<38} {:<10} {:<10} {}",
                    a.token,
                    a.status.as_str(),
                    a.execution_status.as_str(),
                    a.deadline.to_rfc3339()
                );
            }
        }
        cli::ApprovalCommands::Show { token } => {
            let token = parse_uuid(&token, "token")?;
            let approval = service.get(token).await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
            println!("\nAudit trail:");
            for entry in service.audit_log(token).await? {
                println!(
                    "  {}  {:<18} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.action.as_str(),
                    entry.actor.as_deref().unwrap_or("-")
                );
            }
        }
        cli::ApprovalCommands::Approve { token, by } => {
            let token = parse_uuid(&token, "token")?;
            if service.approve(token, &by, ApprovalMethod::Api).await? {
                println!("Approval {} approved; remote command dispatched.", token);
            } else {
                anyhow::bail!("approval {} could not be approved (not pending or past deadline)", token);
            }
        }
        cli::ApprovalCommands::Reject { token, reason, by } => {
            let token = parse_uuid(&token, "token")?;
            if service
                .reject(token, &reason, by.as_deref(), Some(ApprovalMethod::Api))
                .await?
            {
                println!("Approval {} rejected.", token);
            } else {
                anyhow::bail!("approval {} is no longer pending", token);
            }
        }
        cli::ApprovalCommands::Archive { token, by } => {
            let token = parse_uuid(&token, "token")?;
            if service.archive(token, by.as_deref()).await? {
                println!("Approval {} archived.", token);
            } else {
                anyhow::bail!("approval {} is still pending or already archived", token);
            }
        }
    }
    Ok(())
}

async fn handle_job_command(service: &ApprovalService, cmd: cli::JobCommands) -> anyhow::Result<()> {
    match cmd {
        cli::JobCommands::Expire => {
            let expired = service.expire_overdue().await?;
            println!("Expired {} approval(s)", expired);
        }
        cli::JobCommands::Remind => {
            let sent = service.send_due_reminders().await?;
            println!("Sent {} reminder(s)", sent);
        }
        cli::JobCommands::Executions => {
            let failed = service.fail_stale_executions().await?;
            let dispatched = service.dispatch_approved().await?;
            println!(
                "Failed {} stale execution(s), dispatched {} approved execution(s)",
                failed, dispatched
            );
        }
    }
    Ok(())
}
