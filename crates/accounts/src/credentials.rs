//! Persisted per-account login material.
//!
//! Records are written first-write-wins: once an account has a stored record
//! it is never overwritten, so a racing reconnect cannot replace a working
//! cookie with a stale one.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::{fs, io::AsyncWriteExt},
    tracing::{debug, info},
};

use crate::error::{AccountError, Result};

const FILE_PREFIX: &str = "cred_";
const FILE_SUFFIX: &str = ".json";

/// Login material needed to resume a session without a QR scan.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Device identifier the platform bound the session to.
    #[serde(rename = "imei")]
    pub device_id: String,
    /// Opaque serialized cookie jar.
    pub cookie: serde_json::Value,
    pub user_agent: String,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("device_id", &self.device_id)
            .field("cookie", &"[REDACTED]")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Storage for credential records keyed by account id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn has(&self, own_id: &str) -> Result<bool>;

    /// Read the stored record, or [`AccountError::NoCredential`].
    async fn read(&self, own_id: &str) -> Result<CredentialRecord>;

    /// Store `record` unless one already exists. Returns `true` if written.
    async fn write(&self, own_id: &str, record: &CredentialRecord) -> Result<bool>;

    /// Delete the stored record. Returns `true` if one existed.
    async fn remove(&self, own_id: &str) -> Result<bool>;

    /// Ids of every account with a stored record, sorted.
    async fn list_known_accounts(&self) -> Result<Vec<String>>;
}

fn validate_account_id(own_id: &str) -> Result<()> {
    let bad = own_id.is_empty()
        || own_id == "."
        || own_id.contains("..")
        || own_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(AccountError::InvalidAccountId(own_id.to_string()));
    }
    Ok(())
}

/// One JSON file per account, named `cred_<ownId>.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, own_id: &str) -> Result<PathBuf> {
        validate_account_id(own_id)?;
        Ok(self.dir.join(format!("{FILE_PREFIX}{own_id}{FILE_SUFFIX}")))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn has(&self, own_id: &str) -> Result<bool> {
        let path = self.path_for(own_id)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read(&self, own_id: &str) -> Result<CredentialRecord> {
        let path = self.path_for(own_id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AccountError::NoCredential(own_id.to_string()));
            },
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write(&self, own_id: &str, record: &CredentialRecord) -> Result<bool> {
        let path = self.path_for(own_id)?;
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)?;

        // `create_new` makes the existence check and the create one step.
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(own_id, "credential already stored, not overwriting");
                return Ok(false);
            },
            Err(e) => return Err(e.into()),
        };
        file.write_all(&json).await?;
        file.flush().await?;
        info!(own_id, path = %path.display(), "credential saved");
        Ok(true)
    }

    async fn remove(&self, own_id: &str) -> Result<bool> {
        let path = self.path_for(own_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(own_id, "credential deleted");
                Ok(true)
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_known_accounts(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                && validate_account_id(id).is_ok()
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory credential store for tests and embedding.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn has(&self, own_id: &str) -> Result<bool> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records.contains_key(own_id))
    }

    async fn read(&self, own_id: &str) -> Result<CredentialRecord> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records
            .get(own_id)
            .cloned()
            .ok_or_else(|| AccountError::NoCredential(own_id.to_string()))
    }

    async fn write(&self, own_id: &str, record: &CredentialRecord) -> Result<bool> {
        validate_account_id(own_id)?;
        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if records.contains_key(own_id) {
            return Ok(false);
        }
        records.insert(own_id.to_string(), record.clone());
        Ok(true)
    }

    async fn remove(&self, own_id: &str) -> Result<bool> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records.remove(own_id).is_some())
    }

    async fn list_known_accounts(&self) -> Result<Vec<String>> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json, std::sync::Arc};

    fn record(cookie: &str) -> CredentialRecord {
        CredentialRecord {
            device_id: "imei-1".into(),
            cookie: json!([{ "key": "zpw_sek", "value": cookie }]),
            user_agent: "Mozilla/5.0".into(),
        }
    }

    #[tokio::test]
    async fn file_store_first_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("cookies"));

        assert!(!store.has("u1").await.unwrap());
        assert!(store.write("u1", &record("original")).await.unwrap());
        assert!(!store.write("u1", &record("stale")).await.unwrap());

        assert!(store.has("u1").await.unwrap());
        assert_eq!(store.read("u1").await.unwrap(), record("original"));
    }

    #[tokio::test]
    async fn file_store_uses_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.write("42", &record("c")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("cred_42.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["imei"], "imei-1");
        assert_eq!(value["userAgent"], "Mozilla/5.0");
        assert!(value["cookie"].is_array());
    }

    #[tokio::test]
    async fn file_store_missing_record_is_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        assert!(matches!(
            store.read("ghost").await,
            Err(AccountError::NoCredential(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn file_store_lists_only_credential_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.write("200", &record("a")).await.unwrap();
        store.write("100", &record("b")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("cred_.json"), "{}").unwrap();

        assert_eq!(store.list_known_accounts().await.unwrap(), vec!["100", "200"]);
    }

    #[tokio::test]
    async fn file_store_remove_allows_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.write("u1", &record("old")).await.unwrap();
        assert!(store.remove("u1").await.unwrap());
        assert!(!store.remove("u1").await.unwrap());
        assert!(store.write("u1", &record("new")).await.unwrap());
        assert_eq!(store.read("u1").await.unwrap(), record("new"));
    }

    #[tokio::test]
    async fn file_store_missing_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("absent"));
        assert!(store.list_known_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        for bad in ["../x", "a/b", "", ".."] {
            assert!(matches!(
                store.write(bad, &record("c")).await,
                Err(AccountError::InvalidAccountId(_))
            ));
        }
    }

    #[tokio::test]
    async fn concurrent_writers_keep_a_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.write("u1", &record(&format!("c{i}"))).await.unwrap()
            }));
        }
        let mut written = 0;
        for handle in handles {
            if handle.await.unwrap() {
                written += 1;
            }
        }
        assert_eq!(written, 1);
        assert!(store.read("u1").await.is_ok());
    }

    #[tokio::test]
    async fn memory_store_first_write_wins() {
        let store = MemoryCredentialStore::new();
        assert!(store.write("u1", &record("original")).await.unwrap());
        assert!(!store.write("u1", &record("stale")).await.unwrap());
        assert_eq!(store.read("u1").await.unwrap(), record("original"));
        assert_eq!(store.list_known_accounts().await.unwrap(), vec!["u1"]);
    }

    #[test]
    fn debug_redacts_cookie() {
        let printed = format!("{:?}", record("secret-cookie"));
        assert!(!printed.contains("secret-cookie"));
        assert!(printed.contains("REDACTED"));
    }
}
