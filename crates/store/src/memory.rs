//! In-memory credential store.
//!
//! Mirrors the Redis backend's semantics closely enough for unit tests
//! and single-process deployments: per-key TTLs, atomic get-and-delete,
//! atomic set removal. All operations run under one mutex, so the
//! atomicity guarantees of [`CredentialStore`](super::CredentialStore)
//! hold trivially.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use vigil_common::{AppError, AppResult};

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Stored {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Stored {
    fn live(entry: Entry) -> Self {
        Self {
            entry,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process [`CredentialStore`](super::CredentialStore) implementation.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Stored>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, HashMap<String, Stored>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("store mutex poisoned".to_string()))
    }
}

/// Drop the entry if its TTL has lapsed.
fn purge_expired(entries: &mut HashMap<String, Stored>, key: &str) {
    let now = Instant::now();
    if entries.get(key).is_some_and(|s| s.is_expired(now)) {
        entries.remove(key);
    }
}

/// Remove the entry if its TTL has lapsed, then return it.
fn live<'a>(
    entries: &'a mut HashMap<String, Stored>,
    key: &str,
) -> Option<&'a mut Stored> {
    purge_expired(entries, key);
    entries.get_mut(key)
}

/// Fetch the live entry for `key`, inserting a fresh one when absent.
fn live_or_insert<'a>(
    entries: &'a mut HashMap<String, Stored>,
    key: &str,
    default: fn() -> Entry,
) -> &'a mut Stored {
    purge_expired(entries, key);
    entries
        .entry(key.to_string())
        .or_insert_with(|| Stored::live(default()))
}

fn wrong_type(key: &str) -> AppError {
    AppError::Internal(format!("Wrong entry type for key {key}"))
}

fn normalize(len: usize, index: i64) -> i64 {
    if index < 0 {
        len as i64 + index
    } else {
        index
    }
}

#[async_trait]
impl super::CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), Stored::live(Entry::Str(value.to_string())));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> AppResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Stored {
                entry: Entry::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64)),
            },
        );
        Ok(())
    }

    async fn take(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.lock()?;
        if live(&mut entries, key).is_none() {
            return Ok(None);
        }
        match entries.remove(key) {
            Some(Stored {
                entry: Entry::Str(v),
                ..
            }) => Ok(Some(v)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> AppResult<()> {
        let mut entries = self.lock()?;
        let stored = live_or_insert(&mut entries, key, || Entry::Hash(HashMap::new()));
        match &mut stored.entry {
            Entry::Hash(map) => {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> AppResult<()> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Hash(map),
                ..
            }) => {
                map.remove(field);
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> AppResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut entries = self.lock()?;
        let stored = live_or_insert(&mut entries, key, || Entry::Set(HashSet::new()));
        match &mut stored.entry {
            Entry::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Set(set),
                ..
            }) => Ok(set.remove(member)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> AppResult<bool> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> AppResult<Vec<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn set_len(&self, key: &str) -> AppResult<u64> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::Set(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn list_push(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entries = self.lock()?;
        let stored = live_or_insert(&mut entries, key, || Entry::List(Vec::new()));
        match &mut stored.entry {
            Entry::List(list) => {
                list.insert(0, value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> AppResult<()> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::List(list),
                ..
            }) => {
                let len = list.len();
                let start = normalize(len, start).max(0) as usize;
                let stop = normalize(len, stop);
                if stop < 0 || start >= len || start as i64 > stop {
                    list.clear();
                } else {
                    let stop = (stop as usize).min(len - 1);
                    *list = list[start..=stop].to_vec();
                }
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            Some(Stored {
                entry: Entry::List(list),
                ..
            }) => {
                let len = list.len();
                let start = normalize(len, start).max(0) as usize;
                let stop = normalize(len, stop);
                if stop < 0 || start >= len || start as i64 > stop {
                    return Ok(Vec::new());
                }
                let stop = (stop as usize).min(len - 1);
                Ok(list[start..=stop].to_vec())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        let mut entries = self.lock()?;
        let stored = live_or_insert(&mut entries, key, || Entry::Str("0".to_string()));
        match &mut stored.entry {
            Entry::Str(value) => {
                let current: i64 = value
                    .parse()
                    .map_err(|_| AppError::Internal(format!("Non-numeric counter at {key}")))?;
                let next = current + 1;
                *value = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> AppResult<()> {
        let mut entries = self.lock()?;
        if let Some(stored) = live(&mut entries, key) {
            stored.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::CredentialStore;

    #[tokio::test]
    async fn test_string_round_trip() {
        let store = MemoryCredentialStore::new();

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryCredentialStore::new();

        store.set_with_ttl("k", "v", 0).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set_with_ttl("k", "v", 300).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_take_consumes_exactly_once() {
        let store = MemoryCredentialStore::new();

        store.set("challenge", "state").await.unwrap();
        assert_eq!(
            store.take("challenge").await.unwrap(),
            Some("state".to_string())
        );
        assert_eq!(store.take("challenge").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_remove_single_winner() {
        let store = MemoryCredentialStore::new();

        store
            .set_add("codes", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert!(store.set_remove("codes", "a").await.unwrap());
        assert!(!store.set_remove("codes", "a").await.unwrap());
        assert_eq!(store.set_len("codes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hash_fields() {
        let store = MemoryCredentialStore::new();

        store
            .hash_set(
                "h",
                &[
                    ("secret".to_string(), "s".to_string()),
                    ("enabled".to_string(), "false".to_string()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            store.hash_get("h", "enabled").await.unwrap(),
            Some("false".to_string())
        );
        assert_eq!(store.hash_get_all("h").await.unwrap().len(), 2);

        store.hash_delete_field("h", "secret").await.unwrap();
        assert_eq!(store.hash_get("h", "secret").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_push_trim_range() {
        let store = MemoryCredentialStore::new();

        for value in ["a", "b", "c", "d"] {
            store.list_push("l", value).await.unwrap();
        }

        // Newest first, as with LPUSH.
        assert_eq!(
            store.list_range("l", 0, -1).await.unwrap(),
            vec!["d", "c", "b", "a"]
        );

        store.list_trim("l", 0, 1).await.unwrap();
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["d", "c"]);
    }

    #[tokio::test]
    async fn test_incr_counts_from_one() {
        let store = MemoryCredentialStore::new();

        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.incr("c").await.unwrap(), 3);
    }
}
