use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::restart::RestartConfig;

const DEFAULT_MAX_RUNNING: usize = 10;
const DEFAULT_KEY_LENGTH: usize = 16;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024; // 5 MiB
const DEFAULT_LOG_SHIP_MAX_BYTES: usize = 3000;
const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn var(lookup: Lookup<'_>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn var_u64(lookup: Lookup<'_>, name: &str) -> Option<u64> {
    var(lookup, name).and_then(|v| v.parse::<u64>().ok())
}

fn var_usize(lookup: Lookup<'_>, name: &str) -> Option<usize> {
    var(lookup, name).and_then(|v| v.parse::<usize>().ok())
}

fn var_bool(lookup: Lookup<'_>, name: &str, default_value: bool) -> bool {
    match var(lookup, name).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

fn var_secs(lookup: Lookup<'_>, name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_secs(
        var_u64(lookup, name)
            .map(|v| v.clamp(min, max))
            .unwrap_or(default),
    )
}

fn absolute(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// Everything the process supervisor needs; split out so tests can build one
/// around a temp dir without touching the environment.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub uploads_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub max_running: usize,
    pub python_bin: String,
    pub node_bin: String,
    pub shell_bin: String,
    pub install_requirements: bool,
    pub install_timeout: Duration,
    pub monitor_interval: Duration,
    pub log_ship_interval: Duration,
    pub log_ship_max_bytes: usize,
    pub stop_timeout: Duration,
    pub restart: RestartConfig,
}

impl SupervisorConfig {
    pub fn for_root(data_root: &Path) -> Self {
        Self {
            uploads_dir: data_root.join("uploads"),
            logs_dir: data_root.join("logs"),
            max_running: DEFAULT_MAX_RUNNING,
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),
            shell_bin: "sh".to_string(),
            install_requirements: true,
            install_timeout: Duration::from_secs(10 * 60),
            monitor_interval: Duration::from_secs(5),
            log_ship_interval: Duration::from_secs(30 * 60),
            log_ship_max_bytes: DEFAULT_LOG_SHIP_MAX_BYTES,
            stop_timeout: Duration::from_secs(10),
            restart: RestartConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub owner_id: i64,
    /// Receives crash notifications in addition to the owning chat.
    pub admin_chat_id: i64,
    pub data_root: PathBuf,
    pub key_length: usize,
    pub max_upload_bytes: u64,
    pub upload_requires_owner: bool,
    pub stop_on_exit: bool,
    pub telegram_api: String,
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn new(bot_token: impl Into<String>, owner_id: i64, data_root: PathBuf) -> Self {
        let supervisor = SupervisorConfig::for_root(&data_root);
        Self {
            bot_token: bot_token.into(),
            owner_id,
            admin_chat_id: owner_id,
            data_root,
            key_length: DEFAULT_KEY_LENGTH,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upload_requires_owner: false,
            stop_on_exit: false,
            telegram_api: DEFAULT_TELEGRAM_API.to_string(),
            supervisor,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> anyhow::Result<Self> {
        let bot_token = var(lookup, "BOT_TOKEN").context("BOT_TOKEN is required")?;
        let owner_id = var(lookup, "OWNER_ID")
            .context("OWNER_ID is required")?
            .parse::<i64>()
            .context("OWNER_ID must be a numeric user id")?;

        let data_root = absolute(PathBuf::from(
            var(lookup, "HOSTBOT_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        ));

        let mut cfg = Self::new(bot_token, owner_id, data_root);

        if let Some(raw) = var(lookup, "ADMIN_CHAT_ID") {
            cfg.admin_chat_id = raw
                .parse::<i64>()
                .context("ADMIN_CHAT_ID must be a numeric chat id")?;
        }
        cfg.key_length = var_usize(lookup, "HOSTBOT_KEY_LENGTH")
            .map(|v| v.clamp(8, 64))
            .unwrap_or(DEFAULT_KEY_LENGTH);
        cfg.max_upload_bytes = var_u64(lookup, "HOSTBOT_MAX_UPLOAD_BYTES")
            .map(|v| v.clamp(1024, 50 * 1024 * 1024))
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        cfg.upload_requires_owner = var_bool(lookup, "HOSTBOT_UPLOAD_REQUIRES_OWNER", false);
        cfg.stop_on_exit = var_bool(lookup, "HOSTBOT_STOP_ON_EXIT", false);
        if let Some(api) = var(lookup, "HOSTBOT_TELEGRAM_API") {
            cfg.telegram_api = api.trim_end_matches('/').to_string();
        }

        let s = &mut cfg.supervisor;
        s.max_running = var_usize(lookup, "HOSTBOT_MAX_RUNNING")
            .map(|v| v.clamp(1, 500))
            .unwrap_or(DEFAULT_MAX_RUNNING);
        if let Some(v) = var(lookup, "HOSTBOT_PYTHON") {
            s.python_bin = v;
        }
        if let Some(v) = var(lookup, "HOSTBOT_NODE") {
            s.node_bin = v;
        }
        if let Some(v) = var(lookup, "HOSTBOT_SHELL") {
            s.shell_bin = v;
        }
        s.install_requirements = var_bool(lookup, "HOSTBOT_INSTALL_REQUIREMENTS", true);
        s.monitor_interval = var_secs(lookup, "HOSTBOT_MONITOR_INTERVAL_SECS", 1, 300, 5);
        s.log_ship_interval =
            var_secs(lookup, "HOSTBOT_LOG_SHIP_INTERVAL_SECS", 10, 24 * 60 * 60, 30 * 60);
        s.log_ship_max_bytes = var_usize(lookup, "HOSTBOT_LOG_SHIP_MAX_BYTES")
            .map(|v| v.clamp(256, 3800))
            .unwrap_or(DEFAULT_LOG_SHIP_MAX_BYTES);
        s.stop_timeout = var_secs(lookup, "HOSTBOT_STOP_TIMEOUT_SECS", 1, 120, 10);

        let r = &mut s.restart;
        r.max_restarts = var_u64(lookup, "HOSTBOT_RESTART_MAX")
            .map(|v| v.clamp(0, 100) as u32)
            .unwrap_or(r.max_restarts);
        r.window = var_secs(
            lookup,
            "HOSTBOT_RESTART_WINDOW_SECS",
            10,
            24 * 60 * 60,
            r.window.as_secs(),
        );
        r.min_uptime = var_secs(
            lookup,
            "HOSTBOT_RESTART_MIN_UPTIME_SECS",
            1,
            60 * 60,
            r.min_uptime.as_secs(),
        );
        r.backoff_ms = var_u64(lookup, "HOSTBOT_RESTART_BACKOFF_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(r.backoff_ms);
        r.backoff_max_ms = var_u64(lookup, "HOSTBOT_RESTART_BACKOFF_MAX_MS")
            .map(|v| v.clamp(r.backoff_ms, 60 * 60 * 1000))
            .unwrap_or(r.backoff_max_ms.max(r.backoff_ms));
        r.restart_on_success = var_bool(lookup, "HOSTBOT_RESTART_ON_SUCCESS", true);

        Ok(cfg)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_root.join("state")
    }
}
