//! Reelbot Access Control List
//!
//! Allowed and revoked users plus the single owner, persisted to a JSON file
//! that is rewritten in full on every mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl UserIdentity {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            username: None,
            first_name: None,
            last_name: None,
        }
    }

    /// `@username`, else first and last name, else the numeric id.
    pub fn display_name(&self) -> String {
        if let Some(username) = self
            .username
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return format!("@{}", username);
        }

        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if full.is_empty() {
            self.id.to_string()
        } else {
            full
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    #[serde(flatten)]
    pub user: UserIdentity,
    /// RFC 3339 time the user entered its current set.
    #[serde(default)]
    pub since: Option<String>,
}

impl AccessEntry {
    fn now(user: UserIdentity) -> Self {
        Self {
            user,
            since: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("user is already authorized")]
    AlreadyAuthorized,
    #[error("user has been revoked")]
    Banned,
    #[error("wrong password")]
    WrongPassword,
    #[error("user {0} not found")]
    NotFound(i64),
    #[error("failed to persist access list to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load access list from {}: {message}", path.display())]
    Load { path: PathBuf, message: String },
}

impl AclError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AclError::Persistence { .. } | AclError::Load { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AclFile {
    #[serde(default)]
    owner: Option<i64>,
    #[serde(default)]
    allowed: Vec<AccessEntry>,
    #[serde(default)]
    revoked: Vec<AccessEntry>,
}

impl AclFile {
    fn position(list: &[AccessEntry], user_id: i64) -> Option<usize> {
        list.iter().position(|entry| entry.user.id == user_id)
    }

    /// Drops duplicates and enforces that an id lives in at most one set.
    /// Revoked wins over allowed.
    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.revoked.retain(|entry| seen.insert(entry.user.id));
        let revoked_ids = seen;
        let mut seen = HashSet::new();
        self.allowed
            .retain(|entry| !revoked_ids.contains(&entry.user.id) && seen.insert(entry.user.id));
    }
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub entry: AccessEntry,
    /// First successful authorization with no owner: the user is now owner.
    pub claimed_ownership: bool,
}

pub struct AclStore {
    path: PathBuf,
    password: String,
    configured_owner: Option<i64>,
    state: Mutex<AclFile>,
}

impl AclStore {
    /// Loads the store from `path`. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(
        path: P,
        password: &str,
        configured_owner: Option<i64>,
    ) -> Result<Self, AclError> {
        let path = path.as_ref().to_path_buf();
        let mut file = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<AclFile>(&raw).map_err(|e| AclError::Load {
                path: path.clone(),
                message: e.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AclFile::default(),
            Err(err) => {
                return Err(AclError::Load {
                    path,
                    message: err.to_string(),
                })
            }
        };
        file.normalize();

        info!(
            path = %path.display(),
            allowed = file.allowed.len(),
            revoked = file.revoked.len(),
            "Access list loaded"
        );

        Ok(Self {
            path,
            password: password.trim().to_string(),
            configured_owner,
            state: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, AclFile> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_allowed(&self, user_id: i64) -> bool {
        AclFile::position(&self.lock().allowed, user_id).is_some()
    }

    pub fn is_revoked(&self, user_id: i64) -> bool {
        AclFile::position(&self.lock().revoked, user_id).is_some()
    }

    /// The configured owner wins over one claimed through `/auth`.
    pub fn owner(&self) -> Option<i64> {
        self.configured_owner.or(self.lock().owner)
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner() == Some(user_id)
    }

    pub fn allowed(&self) -> Vec<AccessEntry> {
        Self::sorted(self.lock().allowed.clone())
    }

    pub fn revoked(&self) -> Vec<AccessEntry> {
        Self::sorted(self.lock().revoked.clone())
    }

    fn sorted(mut entries: Vec<AccessEntry>) -> Vec<AccessEntry> {
        entries.sort_by_key(|entry| entry.user.display_name().to_lowercase());
        entries
    }

    pub fn authorize(
        &self,
        user: UserIdentity,
        supplied_password: &str,
    ) -> Result<AuthOutcome, AclError> {
        let mut state = self.lock();
        if AclFile::position(&state.allowed, user.id).is_some() {
            return Err(AclError::AlreadyAuthorized);
        }
        if AclFile::position(&state.revoked, user.id).is_some() {
            return Err(AclError::Banned);
        }
        if supplied_password.trim() != self.password {
            warn!(user_id = user.id, "Authorization attempt with wrong password");
            return Err(AclError::WrongPassword);
        }

        let claimed_ownership = self.configured_owner.is_none() && state.owner.is_none();
        let entry = AccessEntry::now(user);

        let mut next = state.clone();
        next.allowed.push(entry.clone());
        if claimed_ownership {
            next.owner = Some(entry.user.id);
        }
        self.commit(&mut state, next)?;

        info!(
            user_id = entry.user.id,
            claimed_ownership, "User authorized"
        );
        Ok(AuthOutcome {
            entry,
            claimed_ownership,
        })
    }

    pub fn revoke(&self, target_id: i64) -> Result<UserIdentity, AclError> {
        let mut state = self.lock();
        let index =
            AclFile::position(&state.allowed, target_id).ok_or(AclError::NotFound(target_id))?;

        let mut next = state.clone();
        let entry = next.allowed.remove(index);
        let user = entry.user.clone();
        next.revoked.push(AccessEntry::now(entry.user));
        self.commit(&mut state, next)?;

        info!(user_id = target_id, "User revoked");
        Ok(user)
    }

    pub fn unrevoke(&self, target_id: i64) -> Result<UserIdentity, AclError> {
        let mut state = self.lock();
        let index =
            AclFile::position(&state.revoked, target_id).ok_or(AclError::NotFound(target_id))?;

        let mut next = state.clone();
        let entry = next.revoked.remove(index);
        let user = entry.user.clone();
        next.allowed.push(AccessEntry::now(entry.user));
        self.commit(&mut state, next)?;

        info!(user_id = target_id, "User unrevoked");
        Ok(user)
    }

    /// Writes `next` to disk and only then swaps it into memory.
    fn commit(&self, state: &mut AclFile, next: AclFile) -> Result<(), AclError> {
        self.persist(&next).map_err(|source| AclError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        *state = next;
        Ok(())
    }

    fn persist(&self, file: &AclFile) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(file).map_err(std::io::Error::other)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
