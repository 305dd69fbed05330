//! Access keys: time-limited, capacity-bounded shared secrets issued by the
//! owner. The registry is rewritten to disk on every mutation.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::store;

const KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    pub expires_at: DateTime<Utc>,
    pub capacity: u32,
    #[serde(default)]
    pub consumers: Vec<i64>,
    #[serde(default)]
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl AccessKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.consumers.len() as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub remaining: u32,
    /// False when the consumer had already redeemed this key.
    pub newly_added: bool,
}

#[derive(Debug, Clone)]
pub struct KeySummary {
    pub key: String,
    pub label: String,
    pub expires_at: DateTime<Utc>,
    pub used: u32,
    pub capacity: u32,
    pub expired: bool,
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn generate_key(len: usize) -> String {
    let mut rng = rand::rngs::OsRng;
    (0..len)
        .map(|_| KEY_CHARSET[rng.gen_range(0..KEY_CHARSET.len())] as char)
        .collect()
}

#[derive(Debug)]
pub struct KeyRegistry {
    path: PathBuf,
    key_length: usize,
    keys: BTreeMap<String, AccessKey>,
}

impl KeyRegistry {
    pub async fn load(path: &Path, key_length: usize) -> std::io::Result<Self> {
        let keys: BTreeMap<String, AccessKey> = store::load_json(path).await?;
        tracing::debug!(path = %path.display(), keys = keys.len(), "loaded key registry");
        Ok(Self {
            path: path.to_path_buf(),
            key_length,
            keys,
        })
    }

    async fn persist(&self) -> Result<(), KeyError> {
        store::save_json(&self.path, &self.keys).await?;
        Ok(())
    }

    pub async fn issue(
        &mut self,
        duration: Duration,
        capacity: u32,
        label: impl Into<String>,
    ) -> Result<(String, AccessKey), KeyError> {
        self.issue_at(Utc::now(), duration, capacity, label).await
    }

    pub async fn issue_at(
        &mut self,
        now: DateTime<Utc>,
        duration: Duration,
        capacity: u32,
        label: impl Into<String>,
    ) -> Result<(String, AccessKey), KeyError> {
        let mut key = generate_key(self.key_length);
        while self.keys.contains_key(&key) {
            key = generate_key(self.key_length);
        }

        let entry = AccessKey {
            expires_at: now + duration,
            capacity: capacity.max(1),
            consumers: Vec::new(),
            label: label.into(),
            created_at: now,
        };
        self.keys.insert(key.clone(), entry.clone());
        if let Err(e) = self.persist().await {
            self.keys.remove(&key);
            return Err(e);
        }

        tracing::info!(key = %key, expires_at = %entry.expires_at, capacity = entry.capacity, "issued access key");
        Ok((key, entry))
    }

    pub async fn validate(&mut self, consumer: i64, key: &str) -> Result<Validation, KeyError> {
        self.validate_at(Utc::now(), consumer, key).await
    }

    /// Checks and consumes in one step; callers hold the registry lock, so two
    /// concurrent validations cannot both take the last slot. A consumer is
    /// only admitted once the registry is on disk.
    pub async fn validate_at(
        &mut self,
        now: DateTime<Utc>,
        consumer: i64,
        key: &str,
    ) -> Result<Validation, KeyError> {
        let key = normalize_key(key);
        let entry = self.keys.get_mut(&key).ok_or(KeyError::Unknown)?;
        if entry.is_expired_at(now) {
            return Err(KeyError::Expired(entry.expires_at));
        }

        let newly_added = !entry.consumers.contains(&consumer);
        if newly_added {
            if entry.consumers.len() as u32 >= entry.capacity {
                return Err(KeyError::CapacityReached {
                    capacity: entry.capacity,
                });
            }
            entry.consumers.push(consumer);
        }

        let out = Validation {
            key: key.clone(),
            expires_at: entry.expires_at,
            remaining: entry.remaining(),
            newly_added,
        };
        if newly_added {
            if let Err(e) = self.persist().await {
                if let Some(entry) = self.keys.get_mut(&key) {
                    entry.consumers.retain(|c| *c != consumer);
                }
                return Err(e);
            }
            tracing::info!(key = %key, consumer, remaining = out.remaining, "access key redeemed");
        }
        Ok(out)
    }

    /// Validity without consuming a slot.
    pub fn check_at(&self, now: DateTime<Utc>, key: &str) -> Result<&AccessKey, KeyError> {
        let entry = self.keys.get(&normalize_key(key)).ok_or(KeyError::Unknown)?;
        if entry.is_expired_at(now) {
            return Err(KeyError::Expired(entry.expires_at));
        }
        Ok(entry)
    }

    pub fn check(&self, key: &str) -> Result<&AccessKey, KeyError> {
        self.check_at(Utc::now(), key)
    }

    pub fn most_recent_valid(&self) -> Option<String> {
        self.most_recent_valid_at(Utc::now())
    }

    pub fn most_recent_valid_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.keys
            .iter()
            .filter(|(_, k)| k.expires_at >= now)
            .max_by_key(|(_, k)| k.expires_at)
            .map(|(key, _)| key.clone())
    }

    pub fn is_active_consumer(&self, consumer: i64) -> bool {
        self.is_active_consumer_at(Utc::now(), consumer)
    }

    pub fn is_active_consumer_at(&self, now: DateTime<Utc>, consumer: i64) -> bool {
        self.keys
            .values()
            .any(|k| !k.is_expired_at(now) && k.consumers.contains(&consumer))
    }

    pub fn list(&self) -> Vec<KeySummary> {
        let now = Utc::now();
        let mut out: Vec<KeySummary> = self
            .keys
            .iter()
            .map(|(key, k)| KeySummary {
                key: key.clone(),
                label: k.label.clone(),
                expires_at: k.expires_at,
                used: k.consumers.len() as u32,
                capacity: k.capacity,
                expired: k.is_expired_at(now),
            })
            .collect();
        out.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        out
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&AccessKey> {
        self.keys.get(&normalize_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry(dir: &tempfile::TempDir) -> KeyRegistry {
        KeyRegistry::load(&dir.path().join("keys.json"), 16)
            .await
            .unwrap()
    }

    #[test]
    fn generated_keys_are_uppercase_alphanumeric() {
        let key = generate_key(16);
        assert_eq!(key.len(), 16);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn capacity_one_admits_a_single_consumer_idempotently() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reg = registry(&dir).await;
        let now = Utc::now();
        let (key, _) = reg.issue_at(now, Duration::days(1), 1, "demo").await.unwrap();

        let a = reg.validate_at(now, 100, &key).await.unwrap();
        assert!(a.newly_added);
        assert_eq!(a.remaining, 0);

        let b = reg.validate_at(now, 200, &key).await.unwrap_err();
        assert!(matches!(b, KeyError::CapacityReached { capacity: 1 }));

        let again = reg.validate_at(now, 100, &key.to_lowercase()).await.unwrap();
        assert!(!again.newly_added);
        assert_eq!(again.remaining, 0);
        assert_eq!(reg.get(&key).unwrap().consumers, vec![100]);
    }

    #[tokio::test]
    async fn expired_key_fails_even_with_capacity_left() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reg = registry(&dir).await;
        let now = Utc::now();
        let (key, _) = reg.issue_at(now, Duration::days(1), 5, "").await.unwrap();

        let later = now + Duration::days(1) + Duration::seconds(1);
        let err = reg.validate_at(later, 1, &key).await.unwrap_err();
        assert!(matches!(err, KeyError::Expired(_)));
        assert!(reg.get(&key).unwrap().consumers.is_empty());

        // Exactly at expiry is still valid.
        assert!(reg.validate_at(now + Duration::days(1), 1, &key).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reg = registry(&dir).await;
        assert!(matches!(
            reg.validate(1, "NOPE").await.unwrap_err(),
            KeyError::Unknown
        ));
        assert!(matches!(reg.check("NOPE").unwrap_err(), KeyError::Unknown));
    }

    #[tokio::test]
    async fn most_recent_valid_prefers_latest_expiry() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut reg = registry(&dir).await;
        let now = Utc::now();
        let (short, _) = reg.issue_at(now, Duration::days(1), 1, "").await.unwrap();
        let (long, _) = reg.issue_at(now, Duration::days(7), 1, "").await.unwrap();
        let (_old, _) = reg
            .issue_at(now - Duration::days(30), Duration::days(2), 1, "")
            .await
            .unwrap();

        assert_eq!(reg.most_recent_valid_at(now), Some(long.clone()));
        assert_ne!(reg.most_recent_valid_at(now), Some(short));
        assert_eq!(reg.most_recent_valid_at(now + Duration::days(2)), Some(long));
        assert_eq!(reg.most_recent_valid_at(now + Duration::days(8)), None);
    }

    #[tokio::test]
    async fn failed_save_leaves_registry_unchanged() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys.json");
        let mut reg = registry(&dir).await;
        let now = Utc::now();
        let (key, _) = reg.issue_at(now, Duration::days(1), 1, "").await.unwrap();

        // A directory in place of the store makes the final rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = reg.validate_at(now, 42, &key).await.unwrap_err();
        assert!(matches!(err, KeyError::Persist(_)));
        assert!(!reg.is_active_consumer_at(now, 42));
        assert!(reg.get(&key).unwrap().consumers.is_empty());
        assert!(reg.validate_at(now, 42, &key).await.is_err());

        assert!(reg.issue_at(now, Duration::days(1), 1, "").await.is_err());
        assert_eq!(reg.list().len(), 1);

        std::fs::remove_dir(&path).unwrap();
        let ok = reg.validate_at(now, 43, &key).await.unwrap();
        assert!(ok.newly_added);
        let reloaded = registry(&dir).await;
        assert_eq!(reloaded.get(&key).unwrap().consumers, vec![43]);
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = Utc::now();
        let key = {
            let mut reg = registry(&dir).await;
            let (key, _) = reg.issue_at(now, Duration::days(3), 2, "team").await.unwrap();
            reg.validate_at(now, 7, &key).await.unwrap();
            key
        };

        let reg = registry(&dir).await;
        let k = reg.get(&key).unwrap();
        assert_eq!(k.label, "team");
        assert_eq!(k.consumers, vec![7]);
        assert!(reg.is_active_consumer_at(now, 7));
        assert!(!reg.is_active_consumer_at(now, 8));
        assert!(!reg.is_active_consumer_at(now + Duration::days(4), 7));
        assert_eq!(reg.list().len(), 1);
    }
}
