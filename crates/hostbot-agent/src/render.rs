//! Chat-facing text and inline buttons. Transport-neutral: the Telegram
//! adapter turns `Reply` into `sendMessage` parameters.

use chrono::Utc;
use hostbot_process::{ProcessState, ProcessStatus, ScriptName};

use crate::{error::truncate_utf8, keys::KeySummary, supervisor::StartOutcome};

/// Telegram rejects messages over 4096 characters.
pub const MAX_MESSAGE_BYTES: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub buttons: Vec<Vec<Button>>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: clip(&text.into()),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Vec<Button>>) -> Self {
        self.buttons = buttons;
        self
    }
}

pub fn clip(text: &str) -> String {
    truncate_utf8(text, MAX_MESSAGE_BYTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    RunAuto,
    Stop,
    Restart,
    Logs,
    Delete,
    Menu,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::RunAuto => "run_auto",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Logs => "logs",
            Action::Delete => "delete",
            Action::Menu => "menu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "run" => Action::Run,
            "run_auto" => Action::RunAuto,
            "stop" => Action::Stop,
            "restart" => Action::Restart,
            "logs" => Action::Logs,
            "delete" => Action::Delete,
            "menu" => Action::Menu,
            _ => return None,
        })
    }
}

pub fn callback_data(action: Action, name: &ScriptName) -> String {
    format!("{}|{}", action.as_str(), name)
}

/// Splits `action|filename`. The name is returned raw; callers validate it.
pub fn parse_callback(data: &str) -> Option<(Action, &str)> {
    let (action, name) = data.split_once('|')?;
    Some((Action::parse(action)?, name))
}

fn button(label: &str, action: Action, name: &ScriptName) -> Button {
    Button {
        label: label.to_string(),
        data: callback_data(action, name),
    }
}

pub fn file_menu(name: &ScriptName, running: bool, is_owner: bool) -> Vec<Vec<Button>> {
    let mut rows = Vec::new();
    if !name.kind().is_runnable() {
        rows.push(vec![button("🗑 Delete", Action::Delete, name)]);
        return rows;
    }

    let first = if running {
        vec![
            button("⏹ Stop", Action::Stop, name),
            button("🔄 Restart", Action::Restart, name),
        ]
    } else {
        vec![button("▶️ Run", Action::Run, name)]
    };
    rows.push(first);
    if is_owner && !running {
        rows.push(vec![button("🔑 Run (auto key)", Action::RunAuto, name)]);
    }
    rows.push(vec![
        button("📜 Logs", Action::Logs, name),
        button("🗑 Delete", Action::Delete, name),
    ]);
    rows
}

pub fn file_card(name: &ScriptName, status: Option<&ProcessStatus>) -> String {
    match status {
        Some(s) => format!("📄 {name}\n{}", status_line(s)),
        None => format!("📄 {name}\n⚪ stopped"),
    }
}

fn status_line(s: &ProcessStatus) -> String {
    let state = match s.state {
        ProcessState::Running => "🟢 running",
        ProcessState::Restarting => "🟡 restarting",
    };
    let pid = s.pid.map(|p| format!(" pid {p}")).unwrap_or_default();
    let uptime = Utc::now().signed_duration_since(s.started_at);
    let mut line = format!("{state}{pid}, up {}", human_duration(uptime.num_seconds()));
    if s.restarts_in_window > 0 {
        line.push_str(&format!(", {} recent restarts", s.restarts_in_window));
    }
    line
}

pub fn human_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (d, h, m, s) = (secs / 86400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if d > 0 {
        format!("{d}d {h}h")
    } else if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

pub fn status_text(entries: &[ProcessStatus]) -> String {
    if entries.is_empty() {
        return "Nothing is running.".to_string();
    }
    let mut out = format!("Running scripts ({}):\n", entries.len());
    for s in entries {
        out.push_str(&format!("\n• {} - {}", s.name, status_line(s)));
        if let Some(key) = &s.key_used {
            out.push_str(&format!(" [key {}…]", key.get(..4).unwrap_or(key.as_str())));
        }
    }
    clip(&out)
}

pub fn files_text(files: &[(ScriptName, bool)]) -> String {
    if files.is_empty() {
        return "No files uploaded yet. Send a .py, .js or .sh file as a document.".to_string();
    }
    let mut out = String::from("Your files:\n");
    for (name, running) in files {
        let mark = if *running { "🟢" } else { "⚪" };
        out.push_str(&format!("\n{mark} {name}"));
    }
    clip(&out)
}

pub fn keys_text(keys: &[KeySummary]) -> String {
    if keys.is_empty() {
        return "No keys issued. Use /genkey <days> [capacity] [label].".to_string();
    }
    let mut out = String::from("Access keys:\n");
    for k in keys {
        let state = if k.expired { "expired" } else { "valid" };
        out.push_str(&format!(
            "\n{} {}/{} {} until {}",
            k.key,
            k.used,
            k.capacity,
            state,
            k.expires_at.format("%Y-%m-%d %H:%M UTC")
        ));
        if !k.label.is_empty() {
            out.push_str(&format!(" ({})", k.label));
        }
    }
    clip(&out)
}

pub fn started_text(outcome: &StartOutcome) -> String {
    let s = &outcome.status;
    let verb = if outcome.replaced { "Restarted" } else { "Started" };
    let pid = s.pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
    let mut out = format!("✅ {verb} {}{pid}.", s.name);
    for w in &outcome.warnings {
        out.push_str(&format!("\n⚠️ {w}"));
    }
    clip(&out)
}

pub fn log_text(name: &ScriptName, tail: Option<String>) -> String {
    match tail {
        Some(t) if !t.trim().is_empty() => clip(&format!("📜 {name}\n{t}")),
        _ => format!("📜 {name}: log is empty."),
    }
}

pub fn help_text(is_owner: bool) -> String {
    let mut out = String::from(
        "Script host.\n\n\
         Send a .py, .js, .sh or requirements.txt file as a document to upload it.\n\n\
         /redeem <KEY> - activate an access key\n\
         /runkey <KEY> <file> - run a file with a key\n\
         /stopkey <KEY> <file> - stop a file started with that key\n\
         /run <file>, /stop <file>, /restart <file>\n\
         /logs <file> - recent output\n\
         /delete <file> - remove a file and its log\n\
         /files - your files\n\
         /status - running scripts",
    );
    if is_owner {
        out.push_str(
            "\n\nOwner:\n\
             /genkey <days> [capacity] [label] - issue a key\n\
             /keys - list keys",
        );
    }
    out
}
