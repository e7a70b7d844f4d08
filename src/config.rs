use chrono::NaiveTime;
use once_cell::sync::OnceCell;
use serde::Deserialize;

static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Feature switches read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Toggles {
    /// Send reminder notifications. SSHGATE_ENABLE_REMINDERS, default on.
    pub reminders: bool,
    /// Send any notification at all. SSHGATE_ENABLE_NOTIFICATIONS, default on.
    pub notifications: bool,
    /// Dispatch the remote command when an approval is granted.
    /// SSHGATE_AUTO_EXECUTE, default on.
    pub auto_execute: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            reminders: true,
            notifications: true,
            auto_execute: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store: StoreBackend,
    pub admin_key: Option<String>,
    /// Base URL used to build the approve/reject links sent to approvers.
    pub public_url: String,
    pub slack_webhook_url: Option<String>,
    /// Comma-separated list of webhook URLs to notify on approval events.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
    /// Hours between creation and deadline.
    pub deadline_hours: i64,
    /// Reminder checkpoints as wall-clock times (UTC).
    pub reminder_times: Vec<NaiveTime>,
    pub reminder_interval_secs: u64,
    pub deadline_interval_secs: u64,
    /// How often approved-but-unrun and interrupted executions are swept.
    pub execution_sweep_interval_secs: u64,
    pub ssh_timeout_secs: u64,
    pub ssh_binary: String,
    pub ssh_identity: Option<String>,
    pub toggles: Toggles,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "postgres://localhost/sshgate".into(),
            store: StoreBackend::Postgres,
            admin_key: None,
            public_url: "http://localhost:8080".into(),
            slack_webhook_url: None,
            webhook_urls: Vec::new(),
            webhook_secret: None,
            deadline_hours: 24,
            reminder_times: default_reminder_times(),
            reminder_interval_secs: 60,
            deadline_interval_secs: 60,
            execution_sweep_interval_secs: 60,
            ssh_timeout_secs: 300,
            ssh_binary: "ssh".into(),
            ssh_identity: None,
            toggles: Toggles::default(),
        }
    }
}

impl Config {
    pub fn deadline_offset(&self) -> chrono::Duration {
        chrono::Duration::hours(self.deadline_hours)
    }

    pub fn ssh_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ssh_timeout_secs)
    }

    /// An `in_progress` execution older than this has lost its runner.
    pub fn stale_execution_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.ssh_timeout_secs + STALE_EXECUTION_GRACE_SECS) as i64)
    }
}

const STALE_EXECUTION_GRACE_SECS: u64 = 120;

fn default_reminder_times() -> Vec<NaiveTime> {
    [(14, 0), (20, 0), (7, 0)]
        .into_iter()
        .filter_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0))
        .collect()
}

/// Parse `"14:00,20:00,07:00"` into checkpoint times. At most three are used.
pub fn parse_reminder_times(raw: &str) -> anyhow::Result<Vec<NaiveTime>> {
    let times = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| anyhow::anyhow!("invalid reminder time '{}': {}", s, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if times.len() > 3 {
        anyhow::bail!("at most 3 reminder times are supported, got {}", times.len());
    }
    Ok(times)
}

fn parse_flag(name: &str, raw: Option<String>, default: bool) -> anyhow::Result<bool> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be a boolean (true/false), got '{}'", name, other),
    }
}

fn parse_value<T>(name: &str, raw: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", name, raw, e)),
        None => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> anyhow::Result<bool> {
    parse_flag(name, std::env::var(name).ok(), default)
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(name, std::env::var(name).ok(), default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    let defaults = Config::default();

    let store = match std::env::var("SSHGATE_STORE").as_deref() {
        Ok("memory") => StoreBackend::Memory,
        Ok("postgres") | Err(_) => StoreBackend::Postgres,
        Ok(other) => anyhow::bail!("SSHGATE_STORE must be 'postgres' or 'memory', got '{}'", other),
    };

    let reminder_times = match std::env::var("SSHGATE_REMINDER_TIMES") {
        Ok(raw) => parse_reminder_times(&raw)?,
        Err(_) => defaults.reminder_times,
    };

    let deadline_hours = env_parse("SSHGATE_DEADLINE_HOURS", defaults.deadline_hours)?;
    if deadline_hours <= 0 {
        anyhow::bail!("SSHGATE_DEADLINE_HOURS must be positive, got {}", deadline_hours);
    }

    let admin_key = std::env::var("SSHGATE_ADMIN_KEY").ok();
    if admin_key.is_none() {
        eprintln!("⚠️  SSHGATE_ADMIN_KEY is not set; the management API will reject every request.");
    }

    Ok(Config {
        port: env_parse("SSHGATE_PORT", defaults.port)?,
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        store,
        admin_key,
        public_url: std::env::var("SSHGATE_PUBLIC_URL").unwrap_or(defaults.public_url),
        slack_webhook_url: std::env::var("SSHGATE_SLACK_WEBHOOK_URL").ok(),
        webhook_urls: std::env::var("SSHGATE_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: std::env::var("SSHGATE_WEBHOOK_SECRET").ok(),
        deadline_hours,
        reminder_times,
        reminder_interval_secs: env_parse("SSHGATE_REMINDER_INTERVAL_SECS", defaults.reminder_interval_secs)?,
        deadline_interval_secs: env_parse("SSHGATE_DEADLINE_INTERVAL_SECS", defaults.deadline_interval_secs)?,
        execution_sweep_interval_secs: env_parse(
            "SSHGATE_EXECUTION_SWEEP_SECS",
            defaults.execution_sweep_interval_secs,
        )?,
        ssh_timeout_secs: env_parse("SSHGATE_SSH_TIMEOUT_SECS", defaults.ssh_timeout_secs)?,
        ssh_binary: std::env::var("SSHGATE_SSH_BINARY").unwrap_or(defaults.ssh_binary),
        ssh_identity: std::env::var("SSHGATE_SSH_IDENTITY").ok(),
        toggles: Toggles {
            reminders: env_flag("SSHGATE_ENABLE_REMINDERS", true)?,
            notifications: env_flag("SSHGATE_ENABLE_NOTIFICATIONS", true)?,
            auto_execute: env_flag("SSHGATE_AUTO_EXECUTE", true)?,
        },
    })
}

/// Install the process-wide configuration. Fails if called twice.
pub fn init(cfg: Config) -> anyhow::Result<&'static Config> {
    let mut fresh = false;
    let installed = CONFIG.get_or_init(|| {
        fresh = true;
        cfg
    });
    if !fresh {
        anyhow::bail!("configuration already initialised");
    }
    Ok(installed)
}
