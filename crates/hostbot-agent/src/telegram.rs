//! Telegram Bot API adapter: long polling, replies with inline keyboards,
//! callback acknowledgements and document downloads.

use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    app::App,
    commands::{self, Caller, Inbound},
    error::{CommandError, format_error_chain},
    notify::Notice,
    render::Reply,
};

const POLL_TIMEOUT_SECS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// `size` is a lower bound when the body was cut off mid-stream.
    #[error("document exceeds {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl From<DownloadError> for CommandError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::TooLarge { size, max } => commands::too_large(size, max),
            DownloadError::Transport(e) => CommandError::Internal(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub document: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

/// What an update asks of us, with the caller already resolved.
#[derive(Debug)]
enum Event {
    Command { caller: Caller, text: String },
    Callback { id: String, caller: Caller, data: String },
    Document { caller: Caller, doc: Document },
}

fn classify(update: Update) -> Option<Event> {
    if let Some(q) = update.callback_query {
        let chat_id = q.message.as_ref().map(|m| m.chat.id)?;
        return Some(Event::Callback {
            id: q.id,
            caller: Caller {
                user_id: q.from.id,
                chat_id,
            },
            data: q.data.unwrap_or_default(),
        });
    }

    let msg = update.message?;
    let caller = Caller {
        user_id: msg.from.as_ref()?.id,
        chat_id: msg.chat.id,
    };
    if let Some(doc) = msg.document {
        return Some(Event::Document { caller, doc });
    }
    let text = msg.text?;
    if !text.trim_start().starts_with('/') {
        return None;
    }
    Some(Event::Command { caller, text })
}

fn reply_markup(reply: &Reply) -> Option<Value> {
    if reply.buttons.is_empty() {
        return None;
    }
    let rows: Vec<Vec<Value>> = reply
        .buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.data }))
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    // Both embed the token; never log them.
    method_base: String,
    file_base: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hostbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            method_base: format!("{api_base}/bot{token}"),
            file_base: format!("{api_base}/file/bot{token}"),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> anyhow::Result<T> {
        let mut retried = false;
        loop {
            let resp = self
                .http
                .post(format!("{}/{method}", self.method_base))
                .json(body)
                .send()
                .await
                .map_err(|e| e.without_url())
                .with_context(|| format!("telegram {method}"))?;
            let parsed: ApiResponse<T> = resp
                .json()
                .await
                .map_err(|e| e.without_url())
                .with_context(|| format!("decode telegram {method} response"))?;

            if parsed.ok {
                return parsed
                    .result
                    .with_context(|| format!("telegram {method}: missing result"));
            }
            let retry_after = parsed.parameters.and_then(|p| p.retry_after);
            match retry_after {
                Some(secs) if !retried => {
                    tracing::warn!(method, retry_after = secs, "telegram rate limit");
                    tokio::time::sleep(Duration::from_secs(secs.min(60))).await;
                    retried = true;
                }
                _ => anyhow::bail!(
                    "telegram {method} failed: {}",
                    parsed.description.unwrap_or_else(|| "unknown error".to_string())
                ),
            }
        }
    }

    pub async fn get_me(&self) -> anyhow::Result<User> {
        self.call("getMe", &json!({})).await
    }

    pub async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, reply: &Reply) -> anyhow::Result<()> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": reply.text,
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup(reply) {
            body["reply_markup"] = markup;
        }
        let _: Value = self.call("sendMessage", &body).await?;
        Ok(())
    }

    pub async fn answer_callback(&self, callback_id: &str) -> anyhow::Result<()> {
        let _: Value = self
            .call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }))
            .await?;
        Ok(())
    }

    /// Fetches a document, refusing to buffer more than `max_bytes`.
    pub async fn download(&self, file_id: &str, max_bytes: u64) -> Result<Vec<u8>, DownloadError> {
        let file: TgFile = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let path = file.file_path.context("telegram getFile: no file_path")?;

        let resp = self
            .http
            .get(format!("{}/{path}", self.file_base))
            .send()
            .await
            .map_err(|e| e.without_url())
            .context("download document")?
            .error_for_status()
            .map_err(|e| e.without_url())
            .context("download document (status)")?;
        if let Some(len) = resp.content_length()
            && len > max_bytes
        {
            return Err(DownloadError::TooLarge {
                size: len,
                max: max_bytes,
            });
        }

        let mut stream = resp.bytes_stream();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| e.without_url())
                .context("read document body chunk")?;
            let size = out.len() as u64 + chunk.len() as u64;
            if size > max_bytes {
                return Err(DownloadError::TooLarge {
                    size,
                    max: max_bytes,
                });
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Long-polls forever. Notices from background tasks are drained on a
/// separate task so a slow chat never blocks polling.
pub async fn run(
    app: App,
    client: TelegramClient,
    mut notices: UnboundedReceiver<Notice>,
) -> anyhow::Result<()> {
    let me = client
        .get_me()
        .await
        .context("telegram getMe (check BOT_TOKEN)")?;
    tracing::info!(bot_id = me.id, bot = ?me.username, "telegram bot connected");

    let drain = client.clone();
    tokio::spawn(async move {
        while let Some(n) = notices.recv().await {
            if let Err(e) = drain.send_message(n.chat_id, &Reply::text(n.text)).await {
                tracing::warn!(chat_id = n.chat_id, error = %format_error_chain(&e), "notice not delivered");
            }
        }
    });

    let mut offset = 0i64;
    let mut backoff = Duration::from_millis(500);
    loop {
        match client.get_updates(offset).await {
            Ok(updates) => {
                backoff = Duration::from_millis(500);
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(event) = classify(update) else {
                        continue;
                    };
                    let app = app.clone();
                    let client = client.clone();
                    tokio::spawn(async move { dispatch(&app, &client, event).await });
                }
            }
            Err(e) => {
                tracing::warn!(error = %format_error_chain(&e), "telegram poll failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}

async fn dispatch(app: &App, client: &TelegramClient, event: Event) {
    let (chat_id, reply) = match event {
        Event::Command { caller, text } => {
            tracing::debug!(user_id = caller.user_id, chat_id = caller.chat_id, "command");
            let reply = commands::handle(app, Inbound::Command { caller, text }).await;
            (caller.chat_id, reply)
        }
        Event::Callback { id, caller, data } => {
            if let Err(e) = client.answer_callback(&id).await {
                tracing::debug!(error = %format_error_chain(&e), "answerCallbackQuery failed");
            }
            if data.is_empty() {
                return;
            }
            let reply = commands::handle(app, Inbound::Callback { caller, data }).await;
            (caller.chat_id, reply)
        }
        Event::Document { caller, doc } => {
            let reply = match receive_document(app, client, caller, &doc).await {
                Ok(inbound) => commands::handle(app, inbound).await,
                Err(e) => commands::error_reply(app, caller, &e),
            };
            (caller.chat_id, reply)
        }
    };

    if let Err(e) = client.send_message(chat_id, &reply).await {
        tracing::warn!(chat_id, error = %format_error_chain(&e), "reply not delivered");
    }
}

async fn receive_document(
    app: &App,
    client: &TelegramClient,
    caller: Caller,
    doc: &Document,
) -> Result<Inbound, CommandError> {
    let file_name = doc.file_name.as_deref().unwrap_or_default();
    let name = commands::prepare_upload(app, caller, file_name, doc.file_size).await?;
    let bytes = client
        .download(&doc.file_id, app.config.max_upload_bytes)
        .await?;
    Ok(Inbound::Upload {
        caller,
        name,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Button;

    fn update(v: Value) -> Update {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn oversized_download_is_a_usage_error() {
        let err: CommandError = DownloadError::TooLarge {
            size: 6 * 1024 * 1024,
            max: 5 * 1024 * 1024,
        }
        .into();
        assert_eq!(err.code(), "usage");
        assert!(!err.is_internal());
        assert!(err.to_string().contains("max 5120 KiB"), "{err}");

        let err: CommandError = DownloadError::Transport(anyhow::anyhow!("connection reset")).into();
        assert!(err.is_internal());
    }

    #[test]
    fn commands_and_plain_text_are_told_apart() {
        let cmd = update(json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "date": 0,
                "from": { "id": 5, "is_bot": false, "first_name": "a" },
                "chat": { "id": -100, "type": "group" },
                "text": "/status"
            }
        }));
        match classify(cmd) {
            Some(Event::Command { caller, text }) => {
                assert_eq!(caller, Caller { user_id: 5, chat_id: -100 });
                assert_eq!(text, "/status");
            }
            other => panic!("unexpected {other:?}"),
        }

        let chatter = update(json!({
            "update_id": 11,
            "message": { "message_id": 2, "date": 0, "from": { "id": 5 }, "chat": { "id": 5 }, "text": "hi" }
        }));
        assert!(classify(chatter).is_none());
    }

    #[test]
    fn documents_and_callbacks_are_classified() {
        let doc = update(json!({
            "update_id": 12,
            "message": {
                "message_id": 3,
                "date": 0,
                "from": { "id": 5 },
                "chat": { "id": 5 },
                "document": { "file_id": "F1", "file_unique_id": "u", "file_name": "bot.py", "file_size": 12 }
            }
        }));
        match classify(doc) {
            Some(Event::Document { doc, .. }) => {
                assert_eq!(doc.file_name.as_deref(), Some("bot.py"));
                assert_eq!(doc.file_size, Some(12));
            }
            other => panic!("unexpected {other:?}"),
        }

        let cb = update(json!({
            "update_id": 13,
            "callback_query": {
                "id": "Q",
                "from": { "id": 7 },
                "message": { "message_id": 4, "date": 0, "chat": { "id": 70 } },
                "chat_instance": "x",
                "data": "stop|bot.py"
            }
        }));
        match classify(cb) {
            Some(Event::Callback { id, caller, data }) => {
                assert_eq!(id, "Q");
                assert_eq!(caller, Caller { user_id: 7, chat_id: 70 });
                assert_eq!(data, "stop|bot.py");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyboard_markup_mirrors_buttons() {
        assert!(reply_markup(&Reply::text("x")).is_none());
        let reply = Reply::text("x").with_buttons(vec![vec![Button {
            label: "Run".to_string(),
            data: "run|a.py".to_string(),
        }]]);
        let markup = reply_markup(&reply).unwrap();
        assert_eq!(markup["inline_keyboard"][0][0]["callback_data"], "run|a.py");
        assert_eq!(markup["inline_keyboard"][0][0]["text"], "Run");
    }

    #[test]
    fn api_errors_carry_retry_after() {
        let parsed: ApiResponse<Value> = serde_json::from_value(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests",
            "parameters": { "retry_after": 3 }
        }))
        .unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.parameters.unwrap().retry_after, Some(3));
    }
}
