//! Identity storage
//!
//! One opaque encrypted blob per identity, keyed by email. The store never
//! sees plaintext.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── admin_40example.com.json     # { "email", "data", "updated" }
//! └── ops_40example.org.json
//! ```

use std::fs::Permissions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace};

use super::error::StorageError;

/// Backing store for encrypted identities
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create the backing table or directory if it is missing.
    async fn ensure(&self) -> Result<(), StorageError>;

    /// The stored blob for `email`, or `None` when there is no record.
    async fn load(&self, email: &str) -> Result<Option<String>, StorageError>;

    /// Create or overwrite the record for `email`.
    async fn save(&self, email: &str, blob: &str) -> Result<(), StorageError>;
}

/// On-disk record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub email: String,
    /// Encrypted identity
    pub data: String,
    pub updated: DateTime<Utc>,
}

/// Filesystem-backed store with restrictive permissions
/// (0700 directory, 0600 records on Unix).
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    base_path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, email: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", record_file_stem(email)))
    }
}

/// Filesystem-safe, injective name for an email address.
///
/// Lowercase ASCII letters, digits, `.` and `-` are kept; every other byte
/// becomes `_` plus two hex digits, so distinct emails never share a file
/// even on case-insensitive filesystems.
fn record_file_stem(email: &str) -> String {
    let mut stem = String::with_capacity(email.len());
    for byte in email.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => stem.push(byte as char),
            _ => stem.push_str(&format!("_{:02x}", byte)),
        }
    }
    stem
}

#[cfg(unix)]
fn mode(bits: u32) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode(bits)
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn ensure(&self) -> Result<(), StorageError> {
        if fs::try_exists(&self.base_path).await? {
            trace!(storage_path = %self.base_path.display(), "Identity store exists");
            return Ok(());
        }

        fs::create_dir_all(&self.base_path).await?;

        #[cfg(unix)]
        fs::set_permissions(&self.base_path, mode(0o700)).await?;

        info!(
            storage_path = %self.base_path.display(),
            "Created identity store"
        );
        Ok(())
    }

    async fn load(&self, email: &str) -> Result<Option<String>, StorageError> {
        let path = self.record_path(email);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(email = %email, "No stored identity");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: StoredIdentity = serde_json::from_str(&content)?;
        if record.email != email {
            return Err(StorageError::KeyMismatch {
                expected: email.to_string(),
                found: record.email,
            });
        }
        debug!(email = %email, updated = %record.updated, "Loaded stored identity");
        Ok(Some(record.data))
    }

    async fn save(&self, email: &str, blob: &str) -> Result<(), StorageError> {
        let path = self.record_path(email);
        let tmp_path = path.with_extension("json.tmp");

        let record = StoredIdentity {
            email: email.to_string(),
            data: blob.to_string(),
            updated: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record)?;

        // A leftover from an interrupted save may carry looser permissions.
        match fs::remove_file(&tmp_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        info!(email = %email, "Saved identity");
        Ok(())
    }
}

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: DashMap<String, String>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn ensure(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load(&self, email: &str) -> Result<Option<String>, StorageError> {
        Ok(self.records.get(email).map(|r| r.value().clone()))
    }

    async fn save(&self, email: &str, blob: &str) -> Result<(), StorageError> {
        self.records.insert(email.to_string(), blob.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, FileIdentityStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(temp_dir.path().join("identities"));
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_ensure_creates_directory() {
        let (_temp_dir, store) = setup_storage();
        assert!(!store.base_path().exists());

        store.ensure().await.unwrap();
        assert!(store.base_path().is_dir());

        // Idempotent
        store.ensure().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing() {
        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();

        assert!(store.load("admin@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_overwrite() {
        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();

        store.save("admin@example.com", "blob-1").await.unwrap();
        assert_eq!(
            store.load("admin@example.com").await.unwrap().as_deref(),
            Some("blob-1")
        );

        store.save("admin@example.com", "blob-2").await.unwrap();
        assert_eq!(
            store.load("admin@example.com").await.unwrap().as_deref(),
            Some("blob-2")
        );
        assert!(store.load("other@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_layout() {
        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();
        store.save("Admin@Example.com", "opaque").await.unwrap();

        let path = store.base_path().join("_41dmin_40_45xample.com.json");
        let record: StoredIdentity =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(record.email, "Admin@Example.com");
        assert_eq!(record.data, "opaque");

        // Case variants are distinct identities.
        assert!(store.load("admin@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similar_emails_do_not_collide() {
        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();

        store.save("a+b@example.com", "blob-plus").await.unwrap();
        store.save("a_b@example.com", "blob-underscore").await.unwrap();

        assert_eq!(
            store.load("a+b@example.com").await.unwrap().as_deref(),
            Some("blob-plus")
        );
        assert_eq!(
            store.load("a_b@example.com").await.unwrap().as_deref(),
            Some("blob-underscore")
        );
    }

    #[tokio::test]
    async fn test_load_rejects_record_of_another_email() {
        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();
        store.save("other@example.com", "opaque").await.unwrap();

        std::fs::rename(
            store.record_path("other@example.com"),
            store.record_path("admin@example.com"),
        )
        .unwrap();

        let err = store.load("admin@example.com").await.unwrap_err();
        assert!(matches!(err, StorageError::KeyMismatch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();
        store.save("admin@example.com", "opaque").await.unwrap();

        let dir_mode = std::fs::metadata(store.base_path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = std::fs::metadata(store.record_path("admin@example.com"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_temporary_file_is_replaced() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, store) = setup_storage();
        store.ensure().await.unwrap();

        let path = store.record_path("admin@example.com");
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, "partial").unwrap();
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644)).unwrap();

        store.save("admin@example.com", "opaque").await.unwrap();

        assert!(!tmp_path.exists());
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(
            store.load("admin@example.com").await.unwrap().as_deref(),
            Some("opaque")
        );
    }

    #[test]
    fn test_record_file_stem() {
        assert_eq!(record_file_stem("admin@example.com"), "admin_40example.com");
        assert_eq!(record_file_stem("a/b@c"), "a_2fb_40c");
        assert_eq!(record_file_stem("a+b@example.com"), "a_2bb_40example.com");
        assert_eq!(record_file_stem("a_b@example.com"), "a_5fb_40example.com");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryIdentityStore::new();
        store.ensure().await.unwrap();
        assert!(store.is_empty());

        store.save("admin@example.com", "blob").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("admin@example.com").await.unwrap().as_deref(),
            Some("blob")
        );
    }
}
