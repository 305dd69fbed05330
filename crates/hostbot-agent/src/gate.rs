use hostbot_process::ScriptName;

use crate::{error::AccessError, keys::KeyRegistry, ledger::FileLedger};

/// Owner identity plus "holds a live key" checks. Stateless; callers pass the
/// registry/ledger they already have locked.
#[derive(Debug, Clone, Copy)]
pub struct AccessGate {
    owner_id: i64,
}

impl AccessGate {
    pub fn new(owner_id: i64) -> Self {
        Self { owner_id }
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        user_id == self.owner_id
    }

    pub fn require_owner(&self, user_id: i64) -> Result<(), AccessError> {
        if self.is_owner(user_id) {
            Ok(())
        } else {
            Err(AccessError::NotOwner)
        }
    }

    pub fn require_authorized(&self, user_id: i64, keys: &KeyRegistry) -> Result<(), AccessError> {
        if self.is_owner(user_id) || keys.is_active_consumer(user_id) {
            Ok(())
        } else {
            Err(AccessError::NotAuthorized)
        }
    }

    /// Non-owners may only touch files they uploaded; untracked files are
    /// owner-only.
    pub fn require_file_access(
        &self,
        user_id: i64,
        name: &ScriptName,
        ledger: &FileLedger,
    ) -> Result<(), AccessError> {
        if self.is_owner(user_id) || ledger.owner_of(name) == Some(user_id) {
            Ok(())
        } else {
            Err(AccessError::NotYourFile(name.clone()))
        }
    }
}
