// Panel user accounts, persisted as a single JSON object keyed by username.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::auth::{hash_password, verify_password, Permission};

/// The owner account. It can be neither deleted nor have its permissions changed.
pub const PROTECTED_USER: &str = "E.Crafters";

pub fn is_protected(username: &str) -> bool {
    username == PROTECTED_USER
}

#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("user not found")]
    NotFound,
    #[error("user exists")]
    AlreadyExists,
    #[error("user {0} is protected")]
    Protected(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("failed to write user store: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode user store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("user store is unreadable, refusing to overwrite it: {0}")]
    Unreadable(String),
}

/// A stored account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Plaintext password from older stores. Replaced by a hash on first login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(default, deserialize_with = "lenient_permissions")]
    pub permissions: BTreeSet<Permission>,
}

/// Account data safe to hand out: no password material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub role: String,
    pub permissions: BTreeSet<Permission>,
    pub protected: bool,
}

impl UserSummary {
    fn from_record(username: &str, record: &UserRecord) -> Self {
        Self {
            username: username.to_string(),
            role: record.role.clone(),
            permissions: record.permissions.clone(),
            protected: is_protected(username),
        }
    }
}

/// Older stores write `null` for fields the panel never filled in.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Unknown permission names are dropped instead of failing the whole file.
fn lenient_permissions<'de, D>(deserializer: D) -> Result<BTreeSet<Permission>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(names
        .iter()
        .filter_map(|name| match name.parse::<Permission>() {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!("{e}; ignoring");
                None
            }
        })
        .collect())
}

type Users = BTreeMap<String, UserRecord>;

/// JSON-file user store. Reads fail open to an empty set; writes replace the
/// file atomically and are serialized through a lock.
#[derive(Debug, Clone)]
pub struct UserStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// All accounts, without password material.
    pub fn list(&self) -> Vec<UserSummary> {
        self.load()
            .iter()
            .map(|(name, record)| UserSummary::from_record(name, record))
            .collect()
    }

    pub fn get(&self, username: &str) -> Option<UserSummary> {
        self.load()
            .get(username)
            .map(|record| UserSummary::from_record(username, record))
    }

    pub fn create(
        &self,
        username: &str,
        password: &str,
        role: &str,
        permissions: BTreeSet<Permission>,
    ) -> Result<UserSummary, UserStoreError> {
        let password_hash = hash_password(password).map_err(UserStoreError::Hash)?;
        self.update(|users| {
            if users.contains_key(username) {
                return Err(UserStoreError::AlreadyExists);
            }
            let record = UserRecord {
                password_hash: Some(password_hash),
                password: None,
                role: role.to_string(),
                permissions,
            };
            let summary = UserSummary::from_record(username, &record);
            users.insert(username.to_string(), record);
            Ok(summary)
        })
    }

    pub fn delete(&self, username: &str) -> Result<(), UserStoreError> {
        if is_protected(username) {
            return Err(UserStoreError::Protected(username.to_string()));
        }
        self.update(|users| {
            users
                .remove(username)
                .map(|_| ())
                .ok_or(UserStoreError::NotFound)
        })
    }

    /// Grant (`value = true`) or revoke a permission. Returns the resulting set.
    pub fn set_permission(
        &self,
        username: &str,
        permission: Permission,
        value: bool,
    ) -> Result<BTreeSet<Permission>, UserStoreError> {
        if is_protected(username) {
            return Err(UserStoreError::Protected(username.to_string()));
        }
        self.update(|users| {
            let record = users.get_mut(username).ok_or(UserStoreError::NotFound)?;
            if value {
                record.permissions.insert(permission);
            } else {
                record.permissions.remove(&permission);
            }
            Ok(record.permissions.clone())
        })
    }

    /// Check a username/password pair. Legacy plaintext passwords are upgraded
    /// to a hash on success.
    pub fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserSummary>, UserStoreError> {
        let users = self.load();
        let Some(record) = users.get(username) else {
            return Ok(None);
        };

        let matches = match (&record.password_hash, &record.password) {
            (Some(hash), _) => verify_password(password, hash).map_err(UserStoreError::Hash)?,
            (None, Some(plain)) => plain == password,
            (None, None) => false,
        };
        if !matches {
            return Ok(None);
        }

        if record.password_hash.is_none() {
            if let Err(e) = self.upgrade_password(username, password) {
                tracing::warn!(%username, "Failed to upgrade legacy password: {e}");
            }
        }
        Ok(Some(UserSummary::from_record(username, record)))
    }

    /// Create the protected owner account with every permission if the store
    /// is empty. Returns whether it was created.
    pub fn seed_admin(&self, password: &str) -> Result<bool, UserStoreError> {
        if !self.try_load()?.is_empty() {
            return Ok(false);
        }
        let password_hash = hash_password(password).map_err(UserStoreError::Hash)?;
        self.update(|users| {
            if !users.is_empty() {
                return Ok(false);
            }
            users.insert(
                PROTECTED_USER.to_string(),
                UserRecord {
                    password_hash: Some(password_hash),
                    password: None,
                    role: "owner".to_string(),
                    permissions: Permission::ALL.into_iter().collect(),
                },
            );
            Ok(true)
        })
    }

    fn upgrade_password(&self, username: &str, password: &str) -> Result<(), UserStoreError> {
        let hash = hash_password(password).map_err(UserStoreError::Hash)?;
        self.update(|users| {
            if let Some(record) = users.get_mut(username) {
                record.password_hash = Some(hash);
                record.password = None;
            }
            Ok(())
        })
    }

    /// Read the whole store for display or login. Unreadable files count as empty.
    fn load(&self) -> Users {
        self.try_load().unwrap_or_else(|e| {
            tracing::warn!(path = %self.inner.path.display(), "{e}");
            Users::new()
        })
    }

    /// Read the whole store for a write. Only a missing file counts as empty;
    /// anything else is an error so the write cannot clobber the file.
    fn try_load(&self) -> Result<Users, UserStoreError> {
        let contents = match std::fs::read_to_string(&self.inner.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Users::new()),
            Err(e) => return Err(UserStoreError::Unreadable(e.to_string())),
        };
        serde_json::from_str(&contents).map_err(|e| UserStoreError::Unreadable(e.to_string()))
    }

    /// Read-modify-write under the store lock.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Users) -> Result<T, UserStoreError>,
    ) -> Result<T, UserStoreError> {
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut users = self.try_load()?;
        let out = f(&mut users)?;
        self.save(&users)?;
        Ok(out)
    }

    fn save(&self, users: &Users) -> Result<(), UserStoreError> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(users)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> UserStore {
        let dir = std::env::temp_dir().join(format!("botpanel-users-{}", uuid::Uuid::new_v4()));
        UserStore::open(dir.join("users.json"))
    }

    fn perms(list: &[Permission]) -> BTreeSet<Permission> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let store = temp_store();
        assert!(store.list().is_empty());
        assert!(store.get("nobody").is_none());
        assert!(store.verify_credentials("nobody", "pw").unwrap().is_none());
    }

    #[test]
    fn test_create_and_verify() {
        let store = temp_store();
        let created = store
            .create("alice", "s3cret!", "moderator", perms(&[Permission::ViewConsole]))
            .unwrap();
        assert_eq!(created.role, "moderator");
        assert!(!created.protected);

        let user = store.verify_credentials("alice", "s3cret!").unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.permissions.contains(&Permission::ViewConsole));
        assert!(store.verify_credentials("alice", "wrong").unwrap().is_none());

        // No plaintext ever hits the disk.
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("s3cret!"));
        assert!(raw.contains("password_hash"));
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let store = temp_store();
        store.create("alice", "pw", "user", BTreeSet::new()).unwrap();
        assert!(matches!(
            store.create("alice", "other", "user", BTreeSet::new()),
            Err(UserStoreError::AlreadyExists)
        ));
    }

    #[test]
    fn test_delete() {
        let store = temp_store();
        store.create("bob", "pw", "user", BTreeSet::new()).unwrap();
        store.delete("bob").unwrap();
        assert!(store.get("bob").is_none());
        assert!(matches!(store.delete("bob"), Err(UserStoreError::NotFound)));
    }

    #[test]
    fn test_protected_user_is_immutable() {
        let store = temp_store();
        assert!(store.seed_admin("owner-pw").unwrap());
        let owner = store.get(PROTECTED_USER).unwrap();
        assert!(owner.protected);
        assert_eq!(owner.permissions.len(), Permission::ALL.len());

        assert!(matches!(
            store.delete(PROTECTED_USER),
            Err(UserStoreError::Protected(_))
        ));
        assert!(matches!(
            store.set_permission(PROTECTED_USER, Permission::ManageUsers, false),
            Err(UserStoreError::Protected(_))
        ));
        // Seeding only happens on an empty store.
        assert!(!store.seed_admin("again").unwrap());
    }

    #[test]
    fn test_set_permission() {
        let store = temp_store();
        store.create("carol", "pw", "user", BTreeSet::new()).unwrap();

        let after = store.set_permission("carol", Permission::StartStop, true).unwrap();
        assert_eq!(after, perms(&[Permission::StartStop]));
        // Granting twice is idempotent.
        let after = store.set_permission("carol", Permission::StartStop, true).unwrap();
        assert_eq!(after.len(), 1);

        let after = store.set_permission("carol", Permission::StartStop, false).unwrap();
        assert!(after.is_empty());
        assert!(matches!(
            store.set_permission("nobody", Permission::StartStop, true),
            Err(UserStoreError::NotFound)
        ));
    }

    #[test]
    fn test_legacy_plaintext_upgraded_on_login() {
        let store = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"dave": {"password": "old-pw", "role": "admin", "permissions": ["view_console", "teleport"]}}"#,
        )
        .unwrap();

        let user = store.verify_credentials("dave", "old-pw").unwrap().unwrap();
        assert_eq!(user.permissions, perms(&[Permission::ViewConsole]));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("old-pw"));
        assert!(store.verify_credentials("dave", "old-pw").unwrap().is_some());
        assert!(store.verify_credentials("dave", "nope").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_fails_open() {
        let store = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{{{").unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_not_overwritten() {
        let store = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{\"E.Crafters\": {").unwrap();

        assert!(matches!(
            store.create("bob", "pw", "user", BTreeSet::new()),
            Err(UserStoreError::Unreadable(_))
        ));
        assert!(matches!(
            store.seed_admin("owner-pw"),
            Err(UserStoreError::Unreadable(_))
        ));
        assert!(store.delete("bob").is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{\"E.Crafters\": {");
    }

    #[test]
    fn test_null_fields_from_older_panel() {
        let store = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{
                "E.Crafters": {"password": "owner-pw", "role": "owner", "permissions": ["manage_users"]},
                "alice": {"password": "pw", "role": null, "permissions": null}
            }"#,
        )
        .unwrap();

        let alice = store.get("alice").unwrap();
        assert_eq!(alice.role, "");
        assert!(alice.permissions.is_empty());

        store.create("bob", "pw", "user", BTreeSet::new()).unwrap();
        let names: Vec<String> = store.list().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["E.Crafters", "alice", "bob"]);
        assert!(!store.seed_admin("other").unwrap());
    }
}
