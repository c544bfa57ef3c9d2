use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// Cached profile of the signed-in user. Display data only; the backend is
/// authoritative and this may be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(alias = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserSummary {
    /// Best human-readable label for the user.
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// What a successful `read` hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub user: Option<UserSummary>,
}

/// A single persisted value with its own retention horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: String,
    /// Unix timestamp after which the entry is ignored.
    pub expires_at: i64,
}

pub type EntryMap = HashMap<String, StoredEntry>;

/// Where the entries physically live.
pub trait StorageMedium: Send + Sync {
    fn load(&self) -> Result<EntryMap, StoreError>;
    fn save(&self, entries: &EntryMap) -> Result<(), StoreError>;
}

/// JSON file on disk, shared by every process that points at the same path.
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageMedium for FileMedium {
    fn load(&self) -> Result<EntryMap, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(EntryMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntryMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &EntryMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so a crash never leaves a torn file behind
        let tmp = self.path.with_extension("tmp");
        let mut file = owner_only_file(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(entries)?)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Tokens are bearer credentials: only the owning user may read the file.
#[cfg(unix)]
fn owner_only_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its old bits
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn owner_only_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

#[derive(Default)]
pub struct MemoryMedium {
    entries: Mutex<EntryMap>,
}

impl StorageMedium for MemoryMedium {
    fn load(&self) -> Result<EntryMap, StoreError> {
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, entries: &EntryMap) -> Result<(), StoreError> {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries.clone();
        Ok(())
    }
}

/// Persists the access token, refresh token and cached user across restarts.
///
/// Every write stamps each entry with a fixed retention horizon. That
/// horizon only bounds how long an idle session can be resumed; token
/// expiry is still checked separately by `TokenCodec`.
pub struct CredentialStore {
    medium: Box<dyn StorageMedium>,
    retention_secs: i64,
}

impl CredentialStore {
    pub fn new(medium: Box<dyn StorageMedium>, retention_days: u32) -> Self {
        Self {
            medium,
            retention_secs: i64::from(retention_days) * 24 * 60 * 60,
        }
    }

    pub fn file(path: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self::new(Box::new(FileMedium::new(path)), retention_days)
    }

    pub fn in_memory(retention_days: u32) -> Self {
        Self::new(Box::<MemoryMedium>::default(), retention_days)
    }

    pub fn write(
        &self,
        access_token: &str,
        refresh_token: &str,
        user: Option<&UserSummary>,
    ) -> Result<(), StoreError> {
        self.write_at(access_token, refresh_token, user, chrono::Utc::now().timestamp())
    }

    pub fn read(&self) -> Result<Option<StoredCredential>, StoreError> {
        self.read_at(chrono::Utc::now().timestamp())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.load_for_update();
        entries.remove(ACCESS_TOKEN_KEY);
        entries.remove(REFRESH_TOKEN_KEY);
        entries.remove(USER_KEY);
        self.medium.save(&entries)
    }

    fn write_at(
        &self,
        access_token: &str,
        refresh_token: &str,
        user: Option<&UserSummary>,
        now: i64,
    ) -> Result<(), StoreError> {
        let expires_at = now + self.retention_secs;
        let mut entries = self.load_for_update();

        entries.insert(
            ACCESS_TOKEN_KEY.to_string(),
            StoredEntry { value: access_token.to_string(), expires_at },
        );
        entries.insert(
            REFRESH_TOKEN_KEY.to_string(),
            StoredEntry { value: refresh_token.to_string(), expires_at },
        );
        match user {
            Some(user) => {
                let encoded = urlencoding::encode(&serde_json::to_string(user)?).into_owned();
                entries.insert(USER_KEY.to_string(), StoredEntry { value: encoded, expires_at });
            }
            None => {
                entries.remove(USER_KEY);
            }
        }

        self.medium.save(&entries)
    }

    /// Current entries for a read-modify-write. An unreadable store is
    /// replaced rather than blocking the write.
    fn load_for_update(&self) -> EntryMap {
        self.medium.load().unwrap_or_else(|e| {
            tracing::warn!("Credential store unreadable, other entries will be dropped: {}", e);
            EntryMap::new()
        })
    }

    fn read_at(&self, now: i64) -> Result<Option<StoredCredential>, StoreError> {
        let entries = self.medium.load()?;
        let live = |key: &str| {
            entries
                .get(key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.value.clone())
        };

        let (access_token, refresh_token) = match (live(ACCESS_TOKEN_KEY), live(REFRESH_TOKEN_KEY)) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                (access, refresh)
            }
            _ => return Ok(None),
        };

        let user = live(USER_KEY).and_then(|raw| decode_user(&raw));

        Ok(Some(StoredCredential {
            access_token,
            refresh_token,
            user,
        }))
    }
}

/// A bad user entry only costs us the cached profile, never the tokens.
fn decode_user(raw: &str) -> Option<UserSummary> {
    let json = match urlencoding::decode(raw) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Stored user entry is not valid percent-encoding: {}", e);
            return None;
        }
    };
    match serde_json::from_str(&json) {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!("Stored user entry is not a valid profile: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserSummary {
        UserSummary {
            id: "u1".to_string(),
            username: Some("ada".to_string()),
            email: Some("ada@example.com".to_string()),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("envoice-store-{}", uuid::Uuid::new_v4()))
            .join("credentials.json")
    }

    #[test]
    fn test_write_then_read() {
        let store = CredentialStore::in_memory(7);
        store.write("T1", "R1", Some(&user())).unwrap();

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "T1");
        assert_eq!(stored.refresh_token, "R1");
        assert_eq!(stored.user, Some(user()));
    }

    #[test]
    fn test_clear_empties_store() {
        let store = CredentialStore::in_memory(7);
        store.write("T1", "R1", Some(&user())).unwrap();
        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_write_without_user_drops_cached_user() {
        let store = CredentialStore::in_memory(7);
        store.write("T1", "R1", Some(&user())).unwrap();
        store.write("T2", "R2", None).unwrap();

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "T2");
        assert_eq!(stored.user, None);
    }

    #[test]
    fn test_entries_expire_after_retention() {
        let store = CredentialStore::in_memory(7);
        store.write_at("T1", "R1", None, 0).unwrap();

        let seven_days = 7 * 24 * 60 * 60;
        assert!(store.read_at(seven_days - 1).unwrap().is_some());
        assert!(store.read_at(seven_days).unwrap().is_none());
    }

    #[test]
    fn test_half_session_reads_as_empty() {
        let medium = MemoryMedium::default();
        let mut entries = EntryMap::new();
        entries.insert(
            ACCESS_TOKEN_KEY.to_string(),
            StoredEntry { value: "T1".to_string(), expires_at: i64::MAX },
        );
        medium.save(&entries).unwrap();

        let store = CredentialStore::new(Box::new(medium), 7);
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_user_keeps_tokens() {
        let medium = MemoryMedium::default();
        let mut entries = EntryMap::new();
        for (key, value) in [
            (ACCESS_TOKEN_KEY, "T1"),
            (REFRESH_TOKEN_KEY, "R1"),
            (USER_KEY, "%7Bnot-json"),
        ] {
            entries.insert(
                key.to_string(),
                StoredEntry { value: value.to_string(), expires_at: i64::MAX },
            );
        }
        medium.save(&entries).unwrap();

        let stored = CredentialStore::new(Box::new(medium), 7).read().unwrap().unwrap();
        assert_eq!(stored.access_token, "T1");
        assert_eq!(stored.refresh_token, "R1");
        assert_eq!(stored.user, None);
    }

    #[test]
    fn test_user_is_url_encoded_json() {
        let store = CredentialStore::in_memory(7);
        store.write("T1", "R1", Some(&user())).unwrap();

        let raw = store.medium.load().unwrap().remove(USER_KEY).unwrap().value;
        assert!(!raw.contains('{'));
        assert_eq!(decode_user(&raw), Some(user()));
    }

    #[test]
    fn test_user_id_accepts_number_and_mongo_alias() {
        let numeric: UserSummary = serde_json::from_str(r#"{"id": 42, "email": "a@b.com"}"#).unwrap();
        assert_eq!(numeric.id, "42");
        assert_eq!(numeric.display_name(), "a@b.com");

        let aliased: UserSummary =
            serde_json::from_str(r#"{"_id": "abc", "username": "ada", "plan": "pro"}"#).unwrap();
        assert_eq!(aliased.id, "abc");
        assert_eq!(aliased.display_name(), "ada");
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let path = temp_path();
        CredentialStore::file(&path, 7)
            .write("T1", "R1", Some(&user()))
            .unwrap();

        let reopened = CredentialStore::file(&path, 7);
        let stored = reopened.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "T1");
        assert_eq!(stored.user, Some(user()));

        reopened.clear().unwrap();
        assert!(CredentialStore::file(&path, 7).read().unwrap().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_reads_empty_and_corrupt_file_errors() {
        let path = temp_path();
        assert!(CredentialStore::file(&path, 7).read().unwrap().is_none());

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(
            CredentialStore::file(&path, 7).read(),
            Err(StoreError::Corrupt(_))
        ));

        // Clearing a corrupt file starts over instead of failing
        CredentialStore::file(&path, 7).clear().unwrap();
        assert!(CredentialStore::file(&path, 7).read().unwrap().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A stale world-readable temp file must not leak its mode
        std::fs::write(path.with_extension("tmp"), "").unwrap();
        std::fs::set_permissions(
            path.with_extension("tmp"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        CredentialStore::file(&path, 7).write("T1", "R1", None).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("tmp").exists());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
