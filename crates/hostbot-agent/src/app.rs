use std::sync::Arc;

use anyhow::Context;
use hostbot_process::ScriptName;
use tokio::sync::Mutex;

use crate::{
    config::Config,
    error::{CommandError, SupervisorError},
    gate::AccessGate,
    keys::KeyRegistry,
    ledger::FileLedger,
    notify::Outbox,
    store,
    supervisor::{DeleteOutcome, ProcessSupervisor},
};

/// Shared service state handed to every handler.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub gate: AccessGate,
    pub keys: Arc<Mutex<KeyRegistry>>,
    pub ledger: Arc<Mutex<FileLedger>>,
    pub supervisor: ProcessSupervisor,
    pub outbox: Outbox,
}

impl App {
    pub async fn open(config: Config, outbox: Outbox) -> anyhow::Result<Self> {
        let state_dir = config.state_dir();
        for dir in [
            &config.supervisor.uploads_dir,
            &config.supervisor.logs_dir,
            &state_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }

        let keys_path = state_dir.join("keys.json");
        let keys = KeyRegistry::load(&keys_path, config.key_length)
            .await
            .with_context(|| format!("load {}", keys_path.display()))?;
        let ledger = FileLedger::load(&state_dir)
            .await
            .with_context(|| format!("load file ledgers from {}", state_dir.display()))?;

        let supervisor =
            ProcessSupervisor::new(config.supervisor.clone(), outbox.clone(), config.admin_chat_id);

        tracing::info!(
            data_root = %config.data_root.display(),
            max_running = config.supervisor.max_running,
            "state loaded"
        );
        Ok(Self {
            gate: AccessGate::new(config.owner_id),
            config: Arc::new(config),
            keys: Arc::new(Mutex::new(keys)),
            ledger: Arc::new(Mutex::new(ledger)),
            supervisor,
            outbox,
        })
    }

    /// Puts an uploaded file in place and records who sent it. Returns
    /// whether a file of that name already existed.
    pub async fn store_upload(
        &self,
        user_id: i64,
        chat_id: i64,
        name: &ScriptName,
        bytes: &[u8],
    ) -> Result<bool, CommandError> {
        let path = self.supervisor.script_path(name);
        let existed = self
            .supervisor
            .with_name_locked(name, || async {
                let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
                store::write_atomic(&path, bytes)
                    .await
                    .map_err(SupervisorError::io(format!("write {}", path.display())))?;
                Ok::<_, SupervisorError>(existed)
            })
            .await?;

        self.ledger
            .lock()
            .await
            .record_upload(user_id, chat_id, name)
            .await
            .context("update file ledger")?;

        tracing::info!(name = %name, user_id, bytes = bytes.len(), existed, "file uploaded");
        Ok(existed)
    }

    /// Stops, removes the file and its log, and forgets it in every ledger.
    pub async fn delete_file(&self, name: &ScriptName) -> Result<DeleteOutcome, CommandError> {
        let out = self.supervisor.delete(name).await?;
        let tracked = self
            .ledger
            .lock()
            .await
            .remove(name)
            .await
            .context("update file ledger")?;

        if !out.was_running && !out.removed_script && !tracked {
            return Err(SupervisorError::NotFound(name.clone()).into());
        }
        Ok(out)
    }

    /// Files visible to `user_id`: the owner sees every tracked file.
    pub async fn visible_files(&self, user_id: i64) -> Vec<ScriptName> {
        let ledger = self.ledger.lock().await;
        if self.gate.is_owner(user_id) {
            ledger.all_files()
        } else {
            ledger.files_of(user_id)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{path::Path, time::Duration};

    use super::*;

    pub(crate) const OWNER: i64 = 1;

    pub(crate) async fn test_app(root: &Path) -> (App, tokio::sync::mpsc::UnboundedReceiver<crate::notify::Notice>) {
        let mut config = Config::new("token", OWNER, root.to_path_buf());
        config.supervisor.monitor_interval = Duration::from_millis(50);
        config.supervisor.log_ship_interval = Duration::from_secs(3600);
        config.supervisor.stop_timeout = Duration::from_secs(3);
        config.supervisor.install_requirements = false;
        let (outbox, rx) = Outbox::channel();
        (App::open(config, outbox).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn upload_then_delete_clears_disk_and_ledgers() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, _rx) = test_app(dir.path()).await;
        let name = ScriptName::parse("bot.sh").unwrap();

        assert!(!app.store_upload(5, 50, &name, b"sleep 30\n").await.unwrap());
        assert!(app.store_upload(5, 50, &name, b"sleep 31\n").await.unwrap());
        assert_eq!(app.visible_files(5).await, vec![name.clone()]);
        assert_eq!(app.visible_files(OWNER).await, vec![name.clone()]);
        assert!(app.visible_files(6).await.is_empty());

        let path = app.supervisor.script_path(&name);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sleep 31\n");

        let out = app.delete_file(&name).await.unwrap();
        assert!(out.removed_script);
        assert!(!path.exists());
        assert!(app.ledger.lock().await.owner_of(&name).is_none());
        assert!(app.ledger.lock().await.chat_of(&name).is_none());

        let err = app.delete_file(&name).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn open_creates_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_app, _rx) = test_app(dir.path()).await;
        assert!(dir.path().join("uploads").is_dir());
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("state").is_dir());
    }
}
