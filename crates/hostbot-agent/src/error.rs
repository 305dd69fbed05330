use std::io;

use chrono::{DateTime, Utc};
use hostbot_process::{NameError, ScriptName};

const MAX_MESSAGE_BYTES: usize = 2048;
const MAX_HINT_BYTES: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key")]
    Unknown,
    #[error("key expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("key already used by {capacity} of {capacity} allowed users")]
    CapacityReached { capacity: u32 },
    #[error("this key did not start {0}")]
    WrongKey(ScriptName),
    #[error("no valid key available")]
    NoValidKey,
    #[error("failed to save key registry: {0}")]
    Persist(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0} is not uploaded")]
    NotFound(ScriptName),
    #[error("{0} is not running")]
    NotRunning(ScriptName),
    #[error("{0} cannot be run")]
    NotRunnable(ScriptName),
    #[error("too many scripts running (max {0})")]
    TooManyRunning(usize),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: ScriptName,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| SupervisorError::Io { context, source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("only the owner can do that")]
    NotOwner,
    #[error("you are not authorized")]
    NotAuthorized,
    #[error("{0} belongs to another user")]
    NotYourFile(ScriptName),
}

/// Anything a chat handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn usage(text: impl Into<String>) -> Self {
        Self::Usage(text.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Key(KeyError::Unknown) => "invalid_key",
            CommandError::Key(KeyError::Expired(_)) => "key_expired",
            CommandError::Key(KeyError::CapacityReached { .. }) => "key_capacity",
            CommandError::Key(KeyError::WrongKey(_)) => "wrong_key",
            CommandError::Key(KeyError::NoValidKey) => "no_valid_key",
            CommandError::Key(KeyError::Persist(_)) => "internal",
            CommandError::Supervisor(SupervisorError::NotFound(_)) => "not_found",
            CommandError::Supervisor(SupervisorError::NotRunning(_)) => "not_running",
            CommandError::Supervisor(SupervisorError::NotRunnable(_)) => "not_runnable",
            CommandError::Supervisor(SupervisorError::TooManyRunning(_)) => "too_many_running",
            CommandError::Supervisor(SupervisorError::Spawn { .. }) => "spawn_failed",
            CommandError::Supervisor(SupervisorError::Io { .. }) => "io_error",
            CommandError::Access(_) => "forbidden",
            CommandError::Name(_) => "invalid_name",
            CommandError::Usage(_) => "usage",
            CommandError::Internal(_) => "internal",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CommandError::Key(KeyError::Unknown | KeyError::Expired(_)) => {
                Some("Ask the owner for a fresh key.")
            }
            CommandError::Key(KeyError::NoValidKey) => {
                Some("Create one with /genkey <days>, then use /runkey <KEY> <file>.")
            }
            CommandError::Supervisor(SupervisorError::NotFound(_)) => {
                Some("Send the file as a document first.")
            }
            CommandError::Supervisor(SupervisorError::TooManyRunning(_)) => {
                Some("Stop another script with /stop <file> and try again.")
            }
            CommandError::Supervisor(SupervisorError::NotRunnable(_)) => {
                Some("requirements.txt is installed automatically before Python scripts start.")
            }
            CommandError::Access(AccessError::NotAuthorized) => {
                Some("Redeem an access key with /redeem <KEY>.")
            }
            _ => None,
        }
    }

    /// Unexpected failures get logged and forwarded to the owner.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CommandError::Internal(_)
                | CommandError::Key(KeyError::Persist(_))
                | CommandError::Supervisor(SupervisorError::Io { .. })
        )
    }
}

#[derive(Debug, Clone)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    pub hint: Option<String>,
}

impl ErrorPayload {
    pub fn from_error(err: &CommandError) -> Self {
        let message = match err {
            CommandError::Internal(e) => format_error_chain(e),
            other => other.to_string(),
        };
        Self {
            code: err.code(),
            message: truncate_utf8(&message, MAX_MESSAGE_BYTES),
            hint: err.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }

    pub fn to_chat_text(&self) -> String {
        let mut out = format!("❌ {}", self.message);
        if let Some(hint) = &self.hint {
            out.push('\n');
            out.push_str(hint);
        }
        out.push_str(&format!("\n[{}]", self.code));
        out
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
