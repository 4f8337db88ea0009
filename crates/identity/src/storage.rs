//! Two-tier key/value storage shared by the session manager and the provider
//!
//! `MemoryStore` backs the ephemeral tier (lost when the process exits).
//! `FileStore` backs the durable tier: a JSON object persisted with an atomic
//! temp-file + rename on every write. A tokio Mutex serializes concurrent
//! writers (renewal task, request handlers) on the same file.
//!
//! Keys are namespaced by owner (`session.` for the session token cache,
//! `oidc.` for the OAuth provider) so a full reset can sweep one owner's keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::error::StorageError;
use crate::types::CacheTier;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// A string-keyed, string-valued store.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>>;

    /// Returns whether the key existed.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>>;

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>>;
}

/// In-memory store for the ephemeral tier.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.lock().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move { Ok(self.entries.lock().await.remove(key).is_some()) })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move { Ok(self.entries.lock().await.keys().cloned().collect()) })
    }
}

/// File-backed store for the durable tier.
///
/// The file is the single source of truth on startup; afterwards the
/// in-memory map is authoritative and every mutation is persisted.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Load entries from `path`, creating an empty `{}` file on cold start.
    pub async fn load(path: PathBuf) -> StorageResult<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StorageError::Io(format!("reading store file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| StorageError::Parse(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded durable store");
            entries
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_string(), value);
            debug!(key, "stored durable entry");
            write_atomic(&self.path, &entries).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if entries.remove(key).is_none() {
                return Ok(false);
            }
            debug!(key, "removed durable entry");
            write_atomic(&self.path, &entries).await?;
            Ok(true)
        })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move { Ok(self.entries.lock().await.keys().cloned().collect()) })
    }
}

/// Write the store atomically: temp file in the same directory, 0600
/// permissions (entries include refresh tokens), then rename over the target.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> StorageResult<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StorageError::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StorageError::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StorageError::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StorageError::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted durable store");
    Ok(())
}

/// The ephemeral and durable tiers, shared between the session manager and
/// the provider.
#[derive(Clone)]
pub struct StorageTiers {
    pub ephemeral: Arc<dyn KeyValueStore>,
    pub durable: Arc<dyn KeyValueStore>,
}

impl StorageTiers {
    pub fn new(ephemeral: Arc<dyn KeyValueStore>, durable: Arc<dyn KeyValueStore>) -> Self {
        Self { ephemeral, durable }
    }

    /// Both tiers in memory. Used by tests and hosts without a durable tier.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn tier(&self, tier: CacheTier) -> &Arc<dyn KeyValueStore> {
        match tier {
            CacheTier::Ephemeral => &self.ephemeral,
            CacheTier::Durable => &self.durable,
        }
    }

    /// Remove every key starting with `prefix` from both tiers.
    /// Returns the number of entries removed.
    pub async fn sweep(&self, prefix: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for store in [&self.ephemeral, &self.durable] {
            for key in store.keys().await? {
                if key.starts_with(prefix) && store.remove(&key).await? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(prefix, removed, "swept storage namespace");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrip_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store
            .set("oidc.account.a", r#"{"id":"a"}"#.into())
            .await
            .unwrap();

        let reloaded = FileStore::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("oidc.account.a").await.unwrap().as_deref(),
            Some(r#"{"id":"a"}"#)
        );
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        assert!(!path.exists());
        let store = FileStore::load(path.clone()).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = FileStore::load(path).await;
        assert!(matches!(result, Err(StorageError::Parse(_))));
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = MemoryStore::new();
        store.set("k", "v".into()).await.unwrap();
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::load(path.clone()).await.unwrap();
        store.set("session.token", "{}".into()).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "store file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn sweep_removes_prefix_from_both_tiers_only() {
        let tiers = StorageTiers::in_memory();
        tiers.ephemeral.set("oidc.interaction", "1".into()).await.unwrap();
        tiers.durable.set("oidc.account.a", "{}".into()).await.unwrap();
        tiers.durable.set("app.theme", "dark".into()).await.unwrap();

        let removed = tiers.sweep("oidc.").await.unwrap();
        assert_eq!(removed, 2);
        assert!(tiers.ephemeral.keys().await.unwrap().is_empty());
        assert_eq!(tiers.durable.keys().await.unwrap(), vec!["app.theme"]);

        assert_eq!(tiers.sweep("oidc.").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Arc::new(FileStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(&format!("k{i}"), i.to_string()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
