//! Chat command router. Turns inbound events into registry/supervisor calls
//! and a `Reply`; errors become a short coded message for the caller.

use chrono::Duration;
use hostbot_process::ScriptName;

use crate::{
    app::App,
    error::{AccessError, CommandError, ErrorPayload, KeyError, SupervisorError},
    keys::normalize_key,
    render::{self, Action, Button, Reply},
    supervisor::StartRequest,
};

const MAX_KEY_DAYS: i64 = 3650;
const LOG_TAIL_BYTES: usize = 3500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub chat_id: i64,
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Command { caller: Caller, text: String },
    Callback { caller: Caller, data: String },
    /// A document that already passed `prepare_upload` and was downloaded.
    Upload {
        caller: Caller,
        name: ScriptName,
        bytes: Vec<u8>,
    },
}

impl Inbound {
    pub fn caller(&self) -> Caller {
        match self {
            Inbound::Command { caller, .. }
            | Inbound::Callback { caller, .. }
            | Inbound::Upload { caller, .. } => *caller,
        }
    }
}

/// `/cmd@botname a b` → ("cmd", ["a", "b"]). `None` for plain text.
pub fn parse_command(text: &str) -> Option<(String, Vec<&str>)> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?.strip_prefix('/')?;
    let cmd = head.split('@').next().unwrap_or(head);
    if cmd.is_empty() {
        return None;
    }
    Some((cmd.to_ascii_lowercase(), parts.collect()))
}

pub async fn handle(app: &App, inbound: Inbound) -> Reply {
    let caller = inbound.caller();
    let result = match inbound {
        Inbound::Command { text, .. } => handle_command(app, caller, &text).await,
        Inbound::Callback { data, .. } => handle_callback(app, caller, &data).await,
        Inbound::Upload { name, bytes, .. } => finish_upload(app, caller, name, &bytes).await,
    };
    result.unwrap_or_else(|e| error_reply(app, caller, &e))
}

pub fn error_reply(app: &App, caller: Caller, err: &CommandError) -> Reply {
    let payload = ErrorPayload::from_error(err);
    if err.is_internal() {
        tracing::error!(
            user_id = caller.user_id,
            chat_id = caller.chat_id,
            code = payload.code,
            error = %payload.message,
            "handler failed"
        );
        if caller.chat_id != app.config.owner_id {
            app.outbox.send(
                app.config.owner_id,
                format!(
                    "⚠️ Internal error for user {} in chat {}:\n{}",
                    caller.user_id, caller.chat_id, payload.message
                ),
            );
        }
    } else {
        tracing::debug!(user_id = caller.user_id, code = payload.code, "request rejected");
    }
    Reply::text(payload.to_chat_text())
}

fn arg<'a>(args: &[&'a str], i: usize, usage: &str) -> Result<&'a str, CommandError> {
    args.get(i)
        .copied()
        .ok_or_else(|| CommandError::usage(format!("Usage: {usage}")))
}

fn file_arg(args: &[&str], i: usize, usage: &str) -> Result<ScriptName, CommandError> {
    Ok(ScriptName::parse(arg(args, i, usage)?)?)
}

async fn require_authorized(app: &App, caller: Caller) -> Result<(), CommandError> {
    let keys = app.keys.lock().await;
    app.gate.require_authorized(caller.user_id, &keys)?;
    Ok(())
}

async fn require_file(app: &App, caller: Caller, name: &ScriptName) -> Result<(), CommandError> {
    require_authorized(app, caller).await?;
    let ledger = app.ledger.lock().await;
    app.gate.require_file_access(caller.user_id, name, &ledger)?;
    Ok(())
}

pub async fn handle_command(app: &App, caller: Caller, text: &str) -> Result<Reply, CommandError> {
    let Some((cmd, args)) = parse_command(text) else {
        return Err(CommandError::usage("Send a command, e.g. /help."));
    };
    let is_owner = app.gate.is_owner(caller.user_id);

    match cmd.as_str() {
        "start" | "help" => Ok(Reply::text(render::help_text(is_owner))),
        "genkey" => genkey(app, caller, &args).await,
        "keys" => {
            app.gate.require_owner(caller.user_id)?;
            let list = app.keys.lock().await.list();
            Ok(Reply::text(render::keys_text(&list)))
        }
        "redeem" => {
            let key = arg(&args, 0, "/redeem <KEY>")?;
            let v = app.keys.lock().await.validate(caller.user_id, key).await?;
            let text = if v.newly_added {
                format!(
                    "✅ Key accepted. Valid until {}. {} slot(s) left.",
                    v.expires_at.format("%Y-%m-%d %H:%M UTC"),
                    v.remaining
                )
            } else {
                format!(
                    "✅ You already redeemed this key. Valid until {}.",
                    v.expires_at.format("%Y-%m-%d %H:%M UTC")
                )
            };
            Ok(Reply::text(text))
        }
        "runkey" => {
            const USAGE: &str = "/runkey <KEY> <file>";
            let key = arg(&args, 0, USAGE)?;
            let name = file_arg(&args, 1, USAGE)?;
            {
                let ledger = app.ledger.lock().await;
                app.gate.require_file_access(caller.user_id, &name, &ledger)?;
            }
            let v = app.keys.lock().await.validate(caller.user_id, key).await?;
            run(app, caller, name, Some(v.key)).await
        }
        "stopkey" => {
            const USAGE: &str = "/stopkey <KEY> <file>";
            let key = normalize_key(arg(&args, 0, USAGE)?);
            let name = file_arg(&args, 1, USAGE)?;
            app.keys.lock().await.check(&key)?;
            let status = app
                .supervisor
                .get(&name)
                .await
                .ok_or_else(|| SupervisorError::NotRunning(name.clone()))?;
            if !is_owner && status.key_used.as_deref() != Some(key.as_str()) {
                return Err(KeyError::WrongKey(name).into());
            }
            stop(app, caller, name).await
        }
        "run" => {
            let name = file_arg(&args, 0, "/run <file>")?;
            require_file(app, caller, &name).await?;
            run(app, caller, name, None).await
        }
        "stop" => {
            let name = file_arg(&args, 0, "/stop <file>")?;
            require_file(app, caller, &name).await?;
            stop(app, caller, name).await
        }
        "restart" => {
            let name = file_arg(&args, 0, "/restart <file>")?;
            require_file(app, caller, &name).await?;
            restart(app, caller, name).await
        }
        "delete" => {
            let name = file_arg(&args, 0, "/delete <file>")?;
            require_file(app, caller, &name).await?;
            delete(app, name).await
        }
        "logs" => {
            let name = file_arg(&args, 0, "/logs <file>")?;
            require_file(app, caller, &name).await?;
            logs(app, name).await
        }
        "files" => files(app, caller).await,
        "status" => status(app, caller).await,
        _ => Err(CommandError::usage("Unknown command. Try /help.")),
    }
}

async fn genkey(app: &App, caller: Caller, args: &[&str]) -> Result<Reply, CommandError> {
    const USAGE: &str = "Usage: /genkey <days> [capacity] [label]";
    app.gate.require_owner(caller.user_id)?;

    let days = arg(args, 0, "/genkey <days> [capacity] [label]")?
        .parse::<i64>()
        .ok()
        .filter(|d| (1..=MAX_KEY_DAYS).contains(d))
        .ok_or_else(|| CommandError::usage(format!("{USAGE} (days: 1-{MAX_KEY_DAYS})")))?;
    let capacity = match args.get(1) {
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|c| *c >= 1)
            .ok_or_else(|| CommandError::usage(format!("{USAGE} (capacity must be >= 1)")))?,
        None => 1,
    };
    let label = args.get(2..).map(|rest| rest.join(" ")).unwrap_or_default();

    let (key, entry) = app
        .keys
        .lock()
        .await
        .issue(Duration::days(days), capacity, label)
        .await?;
    Ok(Reply::text(format!(
        "🔑 New key:\n{key}\nValid until {} for {} user(s).",
        entry.expires_at.format("%Y-%m-%d %H:%M UTC"),
        entry.capacity
    )))
}

async fn run(
    app: &App,
    caller: Caller,
    name: ScriptName,
    key_used: Option<String>,
) -> Result<Reply, CommandError> {
    let outcome = app
        .supervisor
        .start(StartRequest {
            name: name.clone(),
            chat_id: caller.chat_id,
            owner_id: caller.user_id,
            key_used,
        })
        .await?;
    let is_owner = app.gate.is_owner(caller.user_id);
    Ok(Reply::text(render::started_text(&outcome))
        .with_buttons(render::file_menu(&name, true, is_owner)))
}

async fn stop(app: &App, caller: Caller, name: ScriptName) -> Result<Reply, CommandError> {
    app.supervisor.stop(&name).await?;
    let is_owner = app.gate.is_owner(caller.user_id);
    Ok(Reply::text(format!("⏹ Stopped {name}."))
        .with_buttons(render::file_menu(&name, false, is_owner)))
}

async fn restart(app: &App, caller: Caller, name: ScriptName) -> Result<Reply, CommandError> {
    let outcome = app
        .supervisor
        .restart(StartRequest {
            name: name.clone(),
            chat_id: caller.chat_id,
            owner_id: caller.user_id,
            key_used: None,
        })
        .await?;
    let is_owner = app.gate.is_owner(caller.user_id);
    Ok(Reply::text(render::started_text(&outcome))
        .with_buttons(render::file_menu(&name, true, is_owner)))
}

async fn delete(app: &App, name: ScriptName) -> Result<Reply, CommandError> {
    let out = app.delete_file(&name).await?;
    let note = if out.was_running { " (it was stopped first)" } else { "" };
    Ok(Reply::text(format!("🗑 Deleted {name}{note}.")))
}

async fn logs(app: &App, name: ScriptName) -> Result<Reply, CommandError> {
    let tail = app.supervisor.tail_log(&name, LOG_TAIL_BYTES).await?;
    Ok(Reply::text(render::log_text(&name, tail)))
}

async fn files(app: &App, caller: Caller) -> Result<Reply, CommandError> {
    require_authorized(app, caller).await?;
    let names = app.visible_files(caller.user_id).await;

    let mut listed = Vec::with_capacity(names.len());
    let mut buttons = Vec::with_capacity(names.len());
    for name in names {
        let running = app.supervisor.is_running(&name).await;
        buttons.push(vec![Button {
            label: name.to_string(),
            data: render::callback_data(Action::Menu, &name),
        }]);
        listed.push((name, running));
    }
    Ok(Reply::text(render::files_text(&listed)).with_buttons(buttons))
}

async fn status(app: &App, caller: Caller) -> Result<Reply, CommandError> {
    require_authorized(app, caller).await?;
    let mut entries = app.supervisor.status().await;
    if !app.gate.is_owner(caller.user_id) {
        let mine = app.visible_files(caller.user_id).await;
        entries.retain(|s| mine.contains(&s.name) || s.owner_id == caller.user_id);
    }
    Ok(Reply::text(render::status_text(&entries)))
}

pub async fn handle_callback(app: &App, caller: Caller, data: &str) -> Result<Reply, CommandError> {
    let Some((action, raw_name)) = render::parse_callback(data) else {
        return Err(CommandError::usage("That button is no longer supported."));
    };
    let name = ScriptName::parse(raw_name)?;

    match action {
        Action::RunAuto => {
            app.gate.require_owner(caller.user_id)?;
            let key = app
                .keys
                .lock()
                .await
                .most_recent_valid()
                .ok_or(KeyError::NoValidKey)?;
            run(app, caller, name, Some(key)).await
        }
        Action::Run => {
            require_file(app, caller, &name).await?;
            run(app, caller, name, None).await
        }
        Action::Stop => {
            require_file(app, caller, &name).await?;
            stop(app, caller, name).await
        }
        Action::Restart => {
            require_file(app, caller, &name).await?;
            restart(app, caller, name).await
        }
        Action::Logs => {
            require_file(app, caller, &name).await?;
            logs(app, name).await
        }
        Action::Delete => {
            require_file(app, caller, &name).await?;
            delete(app, name).await
        }
        Action::Menu => {
            require_file(app, caller, &name).await?;
            let status = app.supervisor.get(&name).await;
            let is_owner = app.gate.is_owner(caller.user_id);
            Ok(Reply::text(render::file_card(&name, status.as_ref()))
                .with_buttons(render::file_menu(&name, status.is_some(), is_owner)))
        }
    }
}

/// Checks an incoming document before it is downloaded.
pub async fn prepare_upload(
    app: &App,
    caller: Caller,
    file_name: &str,
    size: Option<u64>,
) -> Result<ScriptName, CommandError> {
    if app.config.upload_requires_owner {
        app.gate.require_owner(caller.user_id)?;
    } else {
        require_authorized(app, caller).await?;
    }

    let name = ScriptName::parse(file_name)?;
    if let Some(size) = size {
        check_size(app, size)?;
    }

    let ledger = app.ledger.lock().await;
    match ledger.owner_of(&name) {
        Some(uploader) if uploader != caller.user_id && !app.gate.is_owner(caller.user_id) => {
            Err(AccessError::NotYourFile(name).into())
        }
        _ => Ok(name),
    }
}

fn check_size(app: &App, size: u64) -> Result<(), CommandError> {
    let max = app.config.max_upload_bytes;
    if size > max {
        return Err(too_large(size, max));
    }
    Ok(())
}

pub fn too_large(size: u64, max: u64) -> CommandError {
    CommandError::usage(format!(
        "File is too large ({} KiB, max {} KiB).",
        size.div_ceil(1024),
        max / 1024
    ))
}

pub async fn finish_upload(
    app: &App,
    caller: Caller,
    name: ScriptName,
    bytes: &[u8],
) -> Result<Reply, CommandError> {
    check_size(app, bytes.len() as u64)?;
    let replaced = app
        .store_upload(caller.user_id, caller.chat_id, &name, bytes)
        .await?;
    let running = app.supervisor.is_running(&name).await;

    let mut text = if replaced {
        format!("📥 Replaced {name}.")
    } else {
        format!("📥 Saved {name}.")
    };
    if running {
        text.push_str(" It is running the old version; restart to apply.");
    }
    let is_owner = app.gate.is_owner(caller.user_id);
    Ok(Reply::text(text).with_buttons(render::file_menu(&name, running, is_owner)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{OWNER, test_app};

    const OWNER_CALLER: Caller = Caller {
        user_id: OWNER,
        chat_id: OWNER,
    };

    fn user(id: i64) -> Caller {
        Caller {
            user_id: id,
            chat_id: id * 10,
        }
    }

    async fn cmd(app: &App, caller: Caller, text: &str) -> Result<Reply, CommandError> {
        handle_command(app, caller, text).await
    }

    async fn new_key(app: &App, args: &str) -> String {
        let reply = cmd(app, OWNER_CALLER, &format!("/genkey {args}")).await.unwrap();
        reply.text.lines().nth(1).unwrap().to_string()
    }

    async fn upload(app: &App, caller: Caller, file: &str, body: &str) -> ScriptName {
        let name = prepare_upload(app, caller, file, Some(body.len() as u64))
            .await
            .unwrap();
        finish_upload(app, caller, name.clone(), body.as_bytes())
            .await
            .unwrap();
        name
    }

    #[test]
    fn parse_command_strips_bot_suffix() {
        let (cmd, args) = parse_command("/RunKey@host_bot ABC bot.py").unwrap();
        assert_eq!(cmd, "runkey");
        assert_eq!(args, vec!["ABC", "bot.py"]);
        assert!(parse_command("hello").is_none());
        assert!(parse_command("/").is_none());
        assert_eq!(parse_command("/status").unwrap().1.len(), 0);
    }

    #[tokio::test]
    async fn owner_only_commands_are_gated() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;

        let err = cmd(&app, user(2), "/genkey 1").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = cmd(&app, user(2), "/keys").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let err = cmd(&app, OWNER_CALLER, "/genkey 0").await.unwrap_err();
        assert_eq!(err.code(), "usage");
        let err = cmd(&app, OWNER_CALLER, "/genkey 1 0").await.unwrap_err();
        assert_eq!(err.code(), "usage");

        let key = new_key(&app, "3 2 team a").await;
        assert_eq!(key.len(), 16);
        let listed = cmd(&app, OWNER_CALLER, "/keys").await.unwrap();
        assert!(listed.text.contains(&key));
        assert!(listed.text.contains("0/2"));
        assert!(listed.text.contains("(team a)"));
    }

    #[tokio::test]
    async fn redeem_grants_access_and_respects_capacity() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let key = new_key(&app, "1").await;

        let err = cmd(&app, user(2), "/files").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let ok = cmd(&app, user(2), &format!("/redeem {}", key.to_lowercase()))
            .await
            .unwrap();
        assert!(ok.text.contains("Key accepted"));
        assert!(cmd(&app, user(2), "/files").await.is_ok());

        let again = cmd(&app, user(2), &format!("/redeem {key}")).await.unwrap();
        assert!(again.text.contains("already"));

        let err = cmd(&app, user(3), &format!("/redeem {key}")).await.unwrap_err();
        assert_eq!(err.code(), "key_capacity");
        let err = cmd(&app, user(3), "/redeem NOPE").await.unwrap_err();
        assert_eq!(err.code(), "invalid_key");
    }

    #[tokio::test]
    async fn runkey_then_stopkey_requires_the_same_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let key_a = new_key(&app, "1").await;
        let key_b = new_key(&app, "1").await;

        cmd(&app, user(2), &format!("/redeem {key_a}")).await.unwrap();
        let name = upload(&app, user(2), "job.sh", "sleep 30\n").await;

        let started = cmd(&app, user(2), &format!("/runkey {key_a} job.sh"))
            .await
            .unwrap();
        assert!(started.text.contains("Started job.sh"), "{}", started.text);
        let status = app.supervisor.get(&name).await.unwrap();
        assert_eq!(status.key_used.as_deref(), Some(key_a.as_str()));
        assert_eq!(status.chat_id, 20);

        let err = cmd(&app, user(2), &format!("/stopkey {key_b} job.sh"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "wrong_key");
        assert!(app.supervisor.is_running(&name).await);

        cmd(&app, user(2), &format!("/stopkey {key_a} job.sh"))
            .await
            .unwrap();
        assert!(!app.supervisor.is_running(&name).await);

        let err = cmd(&app, user(2), &format!("/stopkey {key_a} job.sh"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_running");
    }

    #[tokio::test]
    async fn users_cannot_touch_each_others_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let key = new_key(&app, "1 2").await;
        cmd(&app, user(2), &format!("/redeem {key}")).await.unwrap();
        cmd(&app, user(3), &format!("/redeem {key}")).await.unwrap();

        upload(&app, user(2), "mine.sh", "sleep 30\n").await;
        let err = cmd(&app, user(3), "/run mine.sh").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = cmd(&app, user(3), "/delete mine.sh").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = prepare_upload(&app, user(3), "mine.sh", Some(10)).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let files = cmd(&app, user(3), "/files").await.unwrap();
        assert!(!files.text.contains("mine.sh"));
        let files = cmd(&app, OWNER_CALLER, "/files").await.unwrap();
        assert!(files.text.contains("mine.sh"));
        assert_eq!(files.buttons[0][0].data, "menu|mine.sh");
    }

    #[tokio::test]
    async fn runkey_on_someone_elses_file_keeps_the_slot() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let shared = new_key(&app, "1 1").await;
        cmd(&app, user(2), &format!("/redeem {shared}")).await.unwrap();
        upload(&app, user(2), "mine.sh", "sleep 30\n").await;

        let key = new_key(&app, "1 1").await;
        let err = cmd(&app, user(3), &format!("/runkey {key} mine.sh"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(!app.keys.lock().await.is_active_consumer(3));

        let ok = cmd(&app, user(4), &format!("/redeem {key}")).await.unwrap();
        assert!(ok.text.contains("Key accepted"));
    }

    #[tokio::test]
    async fn run_stop_restart_logs_delete_flow() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let name = upload(&app, OWNER_CALLER, "svc.sh", "echo svc-up\nsleep 30\n").await;

        let started = cmd(&app, OWNER_CALLER, "/run svc.sh").await.unwrap();
        assert_eq!(started.buttons[0][0].data, "stop|svc.sh");
        let first_pid = app.supervisor.get(&name).await.unwrap().pid;
        let log = app.supervisor.log_path(&name);
        for _ in 0..200 {
            if std::fs::read_to_string(&log).is_ok_and(|t| t.contains("svc-up")) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }

        let status = cmd(&app, OWNER_CALLER, "/status").await.unwrap();
        assert!(status.text.contains("svc.sh"));

        let restarted = cmd(&app, OWNER_CALLER, "/restart svc.sh").await.unwrap();
        assert!(restarted.text.contains("Restarted"));
        assert_ne!(app.supervisor.get(&name).await.unwrap().pid, first_pid);

        cmd(&app, OWNER_CALLER, "/stop svc.sh").await.unwrap();
        let err = cmd(&app, OWNER_CALLER, "/stop svc.sh").await.unwrap_err();
        assert_eq!(err.code(), "not_running");

        let logs = cmd(&app, OWNER_CALLER, "/logs svc.sh").await.unwrap();
        assert!(logs.text.contains("svc-up"), "{}", logs.text);

        let deleted = cmd(&app, OWNER_CALLER, "/delete svc.sh").await.unwrap();
        assert!(deleted.text.contains("Deleted svc.sh"));
        assert!(!app.supervisor.script_path(&name).exists());
        assert!(!app.supervisor.log_path(&name).exists());
        assert!(app.visible_files(OWNER).await.is_empty());
    }

    #[tokio::test]
    async fn run_auto_button_is_owner_only_and_needs_a_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let name = upload(&app, OWNER_CALLER, "auto.sh", "sleep 30\n").await;

        let err = handle_callback(&app, user(2), "run_auto|auto.sh").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = handle_callback(&app, OWNER_CALLER, "run_auto|auto.sh")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_valid_key");

        let key = new_key(&app, "2").await;
        handle_callback(&app, OWNER_CALLER, "run_auto|auto.sh").await.unwrap();
        let status = app.supervisor.get(&name).await.unwrap();
        assert_eq!(status.key_used, Some(key));

        let menu = handle_callback(&app, OWNER_CALLER, "menu|auto.sh").await.unwrap();
        assert!(menu.text.contains("running"));
        handle_callback(&app, OWNER_CALLER, "stop|auto.sh").await.unwrap();

        let err = handle_callback(&app, OWNER_CALLER, "noop").await.unwrap_err();
        assert_eq!(err.code(), "usage");
    }

    #[tokio::test]
    async fn uploads_are_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;

        let err = prepare_upload(&app, OWNER_CALLER, "notes.txt", Some(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_name");
        let err = prepare_upload(&app, OWNER_CALLER, "big.py", Some(6 * 1024 * 1024))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "usage");
        let err = prepare_upload(&app, user(2), "x.py", Some(10)).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let reply = handle(
            &app,
            Inbound::Upload {
                caller: OWNER_CALLER,
                name: ScriptName::parse("ok.py").unwrap(),
                bytes: b"print('hi')\n".to_vec(),
            },
        )
        .await;
        assert!(reply.text.contains("Saved ok.py"));
        assert!(reply.buttons.iter().flatten().any(|b| b.data == "run|ok.py"));
    }

    #[tokio::test]
    async fn errors_render_as_coded_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let reply = handle(
            &app,
            Inbound::Command {
                caller: OWNER_CALLER,
                text: "/run missing.py".to_string(),
            },
        )
        .await;
        assert!(reply.text.starts_with("❌ missing.py is not uploaded"));
        assert!(reply.text.ends_with("[not_found]"));
    }
}
