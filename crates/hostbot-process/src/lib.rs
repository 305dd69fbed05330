use std::fmt;

use chrono::{DateTime, Utc};

/// Dependency manifest installed with pip before a Python script starts.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

// Button payloads are `action|name` and Telegram caps callback data at 64 bytes.
const MAX_NAME_LEN: usize = 48;

/// File name of an upload as the chat user sent it.
///
/// NOTE: This is not a path. Separators and traversal are rejected so the name
/// can be joined onto the uploads directory as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScriptName(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScriptKind {
    Python,
    Node,
    Shell,
    Requirements,
}

impl ScriptKind {
    pub fn is_runnable(self) -> bool {
        !matches!(self, ScriptKind::Requirements)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("file name is empty")]
    Empty,
    #[error("file name is longer than {MAX_NAME_LEN} bytes")]
    TooLong,
    #[error("file name must not contain path separators or control characters")]
    InvalidCharacter,
    #[error("file name must not start with a dot")]
    Hidden,
    #[error("unsupported file type: {0} (allowed: .py, .js, .sh, {REQUIREMENTS_FILE})")]
    UnsupportedExtension(String),
}

impl ScriptName {
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(NameError::InvalidCharacter);
        }
        // Also rules out "." and "..".
        if name.starts_with('.') {
            return Err(NameError::Hidden);
        }
        if kind_of(name).is_none() {
            let ext = name
                .rsplit_once('.')
                .map(|(_, ext)| format!(".{ext}"))
                .unwrap_or_else(|| name.to_string());
            return Err(NameError::UnsupportedExtension(ext));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ScriptKind {
        // Construction guarantees a known kind.
        kind_of(&self.0).unwrap_or(ScriptKind::Requirements)
    }

    pub fn log_file_name(&self) -> String {
        format!("{}.log", self.0)
    }
}

fn kind_of(name: &str) -> Option<ScriptKind> {
    if name == REQUIREMENTS_FILE {
        return Some(ScriptKind::Requirements);
    }
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    match ext.to_ascii_lowercase().as_str() {
        "py" => Some(ScriptKind::Python),
        "js" => Some(ScriptKind::Node),
        "sh" => Some(ScriptKind::Shell),
        _ => None,
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ScriptName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ScriptName> for String {
    fn from(value: ScriptName) -> Self {
        value.0
    }
}

/// Identifies one run of a script. Start and restart mint a new id; crash
/// respawns keep it so the run's background tasks stay attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(self.0.as_str())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Running,
    /// Crashed; the monitor is waiting out the backoff before respawning.
    Restarting,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub name: ScriptName,
    pub run_id: RunId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub chat_id: i64,
    pub owner_id: i64,
    pub key_used: Option<String>,
    pub started_at: DateTime<Utc>,
    pub restarts_in_window: u32,
}
