use std::{io::ErrorKind, path::PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, Mutex},
};
use tracing::{debug, warn};

use super::schema::StorageMap;

/// A change to a single key. Both values absent never occurs; removal has only
/// `old_value`, a fresh insert only `new_value`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Diff delivered to subscribers after every write, keyed by the changed key.
pub type StorageChanges = std::collections::BTreeMap<String, KeyChange>;

/// Interface for abstracting the key-value store the tracker works against.
///
/// Writes are combined payloads, not transactions: a `set` with several
/// entries lands as one update and produces one change notification, but
/// concurrent writers still race with last-write-wins semantics.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Snapshot of every key.
    async fn get_all(&self) -> Result<StorageMap>;

    /// Values for the requested keys. Missing keys are absent from the result.
    async fn get(&self, keys: &[&str]) -> Result<StorageMap>;

    /// Stores all entries as one combined update.
    async fn set(&self, entries: StorageMap) -> Result<()>;

    async fn remove(&self, keys: &[String]) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// Change stream. Every `set` delivers a diff, including writes that store
    /// a value equal to the previous one.
    fn subscribe(&self) -> broadcast::Receiver<StorageChanges>;
}

/// The main realization of [KeyValueStore]. Keeps the whole map in memory and
/// mirrors it into a single json file when a backing path is configured.
pub struct LocalStore {
    entries: Mutex<StorageMap>,
    backing: Option<PathBuf>,
    changes: broadcast::Sender<StorageChanges>,
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

impl LocalStore {
    /// Store without persistence, used in tests and for dry runs.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(StorageMap::new()),
            backing: None,
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        }
    }

    /// Opens or creates the store backed by a json file. A file that can't be
    /// parsed is treated as empty rather than unrecoverable.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match Self::load(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read storage file {path:?}, starting empty: {e}");
                StorageMap::new()
            }
        };

        Ok(Self {
            entries: Mutex::new(entries),
            backing: Some(path),
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        })
    }

    async fn load(path: &PathBuf) -> Result<StorageMap> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StorageMap::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        let mut file = file;
        let read = file.read_to_string(&mut contents).await;
        file.unlock_async().await?;
        read?;

        if contents.trim().is_empty() {
            return Ok(StorageMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    async fn persist(&self, entries: &StorageMap) -> Result<()> {
        let Some(path) = &self.backing else {
            return Ok(());
        };
        debug!("Persisting {} keys to {path:?}", entries.len());

        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        // Semi-safe acquire-release for the file, same discipline for every
        // writer of the storage file.
        file.lock_exclusive()?;
        let result = Self::write_contents(file, entries).await;
        result
    }

    async fn write_contents(mut file: File, entries: &StorageMap) -> Result<()> {
        let buffer = serde_json::to_vec(entries)?;
        let write = async {
            file.write_all(&buffer).await?;
            file.flush().await
        }
        .await;
        file.unlock_async().await?;
        write?;
        Ok(())
    }

    fn publish(&self, diff: StorageChanges) {
        if diff.is_empty() {
            return;
        }
        // An error only means nobody is listening right now.
        let _ = self.changes.send(diff);
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    async fn get_all(&self) -> Result<StorageMap> {
        Ok(self.entries.lock().await.clone())
    }

    async fn get(&self, keys: &[&str]) -> Result<StorageMap> {
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| {
                entries
                    .get(*key)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, new_entries: StorageMap) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut diff = StorageChanges::new();
        for (key, value) in new_entries {
            let old_value = entries.insert(key.clone(), value.clone());
            diff.insert(
                key,
                KeyChange {
                    old_value,
                    new_value: Some(value),
                },
            );
        }
        self.persist(&entries).await?;
        drop(entries);
        self.publish(diff);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut diff = StorageChanges::new();
        for key in keys {
            if let Some(old_value) = entries.remove(key) {
                diff.insert(
                    key.clone(),
                    KeyChange {
                        old_value: Some(old_value),
                        new_value: None,
                    },
                );
            }
        }
        self.persist(&entries).await?;
        drop(entries);
        self.publish(diff);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let diff = entries
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    KeyChange {
                        old_value: Some(value.clone()),
                        new_value: None,
                    },
                )
            })
            .collect();
        entries.clear();
        self.persist(&entries).await?;
        drop(entries);
        self.publish(diff);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChanges> {
        self.changes.subscribe()
    }
}
