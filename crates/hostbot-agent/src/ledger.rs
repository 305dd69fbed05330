use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use hostbot_process::ScriptName;

use crate::store;

type FilesById = BTreeMap<i64, Vec<ScriptName>>;

/// Who uploaded which file, and from which chat.
///
/// A name has at most one uploader and one chat: uploads share one directory,
/// so re-uploading a name moves it to the new uploader.
#[derive(Debug)]
pub struct FileLedger {
    user_path: PathBuf,
    chat_path: PathBuf,
    by_user: FilesById,
    by_chat: FilesById,
}

fn detach(map: &mut FilesById, name: &ScriptName) -> bool {
    let mut removed = false;
    map.retain(|_, files| {
        let before = files.len();
        files.retain(|f| f != name);
        removed |= files.len() != before;
        !files.is_empty()
    });
    removed
}

fn find(map: &FilesById, name: &ScriptName) -> Option<i64> {
    map.iter()
        .find(|(_, files)| files.contains(name))
        .map(|(id, _)| *id)
}

impl FileLedger {
    pub async fn load(state_dir: &Path) -> io::Result<Self> {
        let user_path = state_dir.join("user_files.json");
        let chat_path = state_dir.join("chat_files.json");
        Ok(Self {
            by_user: store::load_json(&user_path).await?,
            by_chat: store::load_json(&chat_path).await?,
            user_path,
            chat_path,
        })
    }

    async fn persist(&self) -> io::Result<()> {
        store::save_json(&self.user_path, &self.by_user).await?;
        store::save_json(&self.chat_path, &self.by_chat).await
    }

    pub async fn record_upload(
        &mut self,
        user_id: i64,
        chat_id: i64,
        name: &ScriptName,
    ) -> io::Result<()> {
        detach(&mut self.by_user, name);
        detach(&mut self.by_chat, name);
        self.by_user.entry(user_id).or_default().push(name.clone());
        self.by_chat.entry(chat_id).or_default().push(name.clone());
        self.persist().await
    }

    /// Drops the name from every ledger. Returns whether it was tracked.
    pub async fn remove(&mut self, name: &ScriptName) -> io::Result<bool> {
        let a = detach(&mut self.by_user, name);
        let b = detach(&mut self.by_chat, name);
        if a || b {
            self.persist().await?;
        }
        Ok(a || b)
    }

    pub fn owner_of(&self, name: &ScriptName) -> Option<i64> {
        find(&self.by_user, name)
    }

    #[cfg(test)]
    pub fn chat_of(&self, name: &ScriptName) -> Option<i64> {
        find(&self.by_chat, name)
    }

    pub fn files_of(&self, user_id: i64) -> Vec<ScriptName> {
        let mut out = self.by_user.get(&user_id).cloned().unwrap_or_default();
        out.sort();
        out
    }

    pub fn all_files(&self) -> Vec<ScriptName> {
        let mut out: Vec<ScriptName> = self.by_user.values().flatten().cloned().collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ScriptName {
        ScriptName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn upload_is_tracked_per_user_and_chat() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut ledger = FileLedger::load(dir.path()).await.unwrap();
        ledger.record_upload(1, 10, &name("a.py")).await.unwrap();
        ledger.record_upload(1, 10, &name("a.py")).await.unwrap();
        ledger.record_upload(2, 20, &name("b.py")).await.unwrap();

        assert_eq!(ledger.files_of(1), vec![name("a.py")]);
        assert_eq!(ledger.owner_of(&name("b.py")), Some(2));
        assert_eq!(ledger.chat_of(&name("a.py")), Some(10));
        assert_eq!(ledger.all_files(), vec![name("a.py"), name("b.py")]);
    }

    #[tokio::test]
    async fn reupload_moves_ownership() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut ledger = FileLedger::load(dir.path()).await.unwrap();
        ledger.record_upload(1, 10, &name("a.py")).await.unwrap();
        ledger.record_upload(2, 20, &name("a.py")).await.unwrap();

        assert!(ledger.files_of(1).is_empty());
        assert_eq!(ledger.owner_of(&name("a.py")), Some(2));
        assert_eq!(ledger.chat_of(&name("a.py")), Some(20));
    }

    #[tokio::test]
    async fn remove_clears_every_ledger_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut ledger = FileLedger::load(dir.path()).await.unwrap();
            ledger.record_upload(1, 10, &name("a.py")).await.unwrap();
            ledger.record_upload(1, 10, &name("b.py")).await.unwrap();
            assert!(ledger.remove(&name("a.py")).await.unwrap());
            assert!(!ledger.remove(&name("a.py")).await.unwrap());
        }

        let ledger = FileLedger::load(dir.path()).await.unwrap();
        assert_eq!(ledger.owner_of(&name("a.py")), None);
        assert_eq!(ledger.chat_of(&name("a.py")), None);
        assert_eq!(ledger.files_of(1), vec![name("b.py")]);
    }
}
