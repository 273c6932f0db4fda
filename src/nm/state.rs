//! Persisted Naming-Manager State
//!
//! The directory, ACLs, access requests, folders, trash and user table
//! all live in one structure, persisted as a single JSON document. Every
//! mutation is followed by an atomic save: write to a temp file, fsync,
//! rename over the final path.
//!
//! Loading accepts the older on-disk format where `directory[file]` is a
//! bare integer ss-id and `requests[file]` is an array of bare usernames.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::directory::DirectoryStore;
use super::types::{AccessRequest, AclEntry, Perm, TrashEntry, ANONYMOUS};

#[derive(Debug)]
pub struct NmState {
    path: PathBuf,
    pub users: Vec<String>,
    pub active: HashSet<String>,
    pub directory: DirectoryStore,
    pub acls: HashMap<String, AclEntry>,
    pub requests: HashMap<String, Vec<AccessRequest>>,
    pub folders: Vec<String>,
    pub trash: Vec<TrashEntry>,
}

// --- On-disk shape ---

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    active: Vec<String>,
    #[serde(default)]
    directory: BTreeMap<String, PersistedDirEntry>,
    #[serde(default)]
    acls: BTreeMap<String, PersistedAcl>,
    #[serde(default)]
    replicas: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    requests: BTreeMap<String, Vec<PersistedRequest>>,
    #[serde(default)]
    folders: Vec<String>,
    #[serde(default)]
    trash: Vec<TrashEntry>,
}

/// Current format is an object with placement metadata; the legacy format
/// was a bare ss-id integer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedDirEntry {
    Full {
        ss_id: u32,
        last_modified_user: Option<String>,
        #[serde(default)]
        last_modified_time: i64,
        last_accessed_user: Option<String>,
        #[serde(default)]
        last_accessed_time: i64,
    },
    Legacy(u32),
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedAcl {
    #[serde(default)]
    owner: String,
    #[serde(default)]
    grants: BTreeMap<String, Perm>,
}

/// Current format is `{user, mode}`; the legacy format was a bare
/// username (mode R).
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedRequest {
    Entry { user: String, mode: String },
    Legacy(String),
}

impl NmState {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            users: Vec::new(),
            active: HashSet::new(),
            directory: DirectoryStore::new(),
            acls: HashMap::new(),
            requests: HashMap::new(),
            folders: Vec::new(),
            trash: Vec::new(),
        }
    }

    /// Load the state document; a missing file is a first run and writes
    /// the skeleton.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut state = Self::new(path);
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.save().await?;
                return Ok(state);
            }
            Err(e) => return Err(e).context("read state document"),
        };
        let persisted: PersistedState =
            serde_json::from_slice(&raw).context("parse state document")?;

        state.users = persisted.users;
        for user in persisted.active {
            state.active.insert(user.clone());
            if !state.users.contains(&user) {
                state.users.push(user);
            }
        }
        for (file, entry) in persisted.directory {
            match entry {
                PersistedDirEntry::Full {
                    ss_id,
                    last_modified_user,
                    last_modified_time,
                    last_accessed_user,
                    last_accessed_time,
                } => {
                    state.directory.set_primary(&file, ss_id);
                    let e = state.directory.get_mut(&file).unwrap();
                    e.last_modified_user = last_modified_user;
                    e.last_modified_time = last_modified_time;
                    e.last_accessed_user = last_accessed_user;
                    e.last_accessed_time = last_accessed_time;
                }
                PersistedDirEntry::Legacy(ss_id) => {
                    state.directory.set_primary(&file, ss_id);
                }
            }
        }
        for (file, replicas) in persisted.replicas {
            state.directory.set_replicas(&file, replicas);
        }
        for (file, acl) in persisted.acls {
            state.acls.insert(
                file,
                AclEntry {
                    owner: if acl.owner.is_empty() {
                        None
                    } else {
                        Some(acl.owner)
                    },
                    grants: acl.grants,
                },
            );
        }
        for (file, reqs) in persisted.requests {
            let list = reqs
                .into_iter()
                .map(|r| match r {
                    PersistedRequest::Entry { user, mode } => AccessRequest {
                        user,
                        mode: Perm::parse(&mode),
                    },
                    PersistedRequest::Legacy(user) => AccessRequest {
                        user,
                        mode: Perm::R,
                    },
                })
                .collect();
            state.requests.insert(file, list);
        }
        state.folders = persisted.folders;
        state.trash = persisted.trash;
        Ok(state)
    }

    /// Atomic save: temp file beside the target, fsync, rename.
    pub async fn save(&self) -> Result<()> {
        let persisted = PersistedState {
            users: self.users.clone(),
            active: {
                let mut v: Vec<String> = self.active.iter().cloned().collect();
                v.sort();
                v
            },
            directory: self
                .directory
                .iter()
                .map(|(file, e)| {
                    (
                        file.clone(),
                        PersistedDirEntry::Full {
                            ss_id: e.primary,
                            last_modified_user: e.last_modified_user.clone(),
                            last_modified_time: e.last_modified_time,
                            last_accessed_user: e.last_accessed_user.clone(),
                            last_accessed_time: e.last_accessed_time,
                        },
                    )
                })
                .collect(),
            acls: self
                .acls
                .iter()
                .map(|(file, acl)| {
                    (
                        file.clone(),
                        PersistedAcl {
                            owner: acl.owner.clone().unwrap_or_default(),
                            grants: acl.grants.clone(),
                        },
                    )
                })
                .collect(),
            replicas: self
                .directory
                .iter()
                .map(|(file, e)| (file.clone(), e.replicas.clone()))
                .collect(),
            requests: self
                .requests
                .iter()
                .map(|(file, reqs)| {
                    (
                        file.clone(),
                        reqs.iter()
                            .map(|r| PersistedRequest::Entry {
                                user: r.user.clone(),
                                mode: r.mode.as_str().to_string(),
                            })
                            .collect(),
                    )
                })
                .collect(),
            folders: self.folders.clone(),
            trash: self.trash.clone(),
        };

        let body = serde_json::to_vec_pretty(&persisted)?;
        let tmp = PathBuf::from(format!("{}.tmp.{}", self.path.display(), std::process::id()));
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&body).await?;
        f.sync_all().await?;
        drop(f);
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("rename state document");
        }
        Ok(())
    }

    // --- Users ---

    pub fn add_user(&mut self, user: &str) {
        if !user.is_empty() && !self.users.iter().any(|u| u == user) {
            self.users.push(user.to_string());
        }
    }

    pub fn user_is_active(&self, user: &str) -> bool {
        self.active.contains(user)
    }

    pub fn set_user_active(&mut self, user: &str, active: bool) {
        if user.is_empty() {
            return;
        }
        if active {
            self.add_user(user);
            self.active.insert(user.to_string());
        } else {
            self.active.remove(user);
        }
    }

    pub fn inactive_users(&self) -> Vec<String> {
        self.users
            .iter()
            .filter(|u| !self.active.contains(*u))
            .cloned()
            .collect()
    }

    // --- ACLs ---

    pub fn acl_set_owner(&mut self, file: &str, owner: &str) {
        let entry = self.acls.entry(file.to_string()).or_default();
        entry.owner = if owner.is_empty() {
            None
        } else {
            Some(owner.to_string())
        };
    }

    pub fn acl_grant(&mut self, file: &str, user: &str, perm: Perm) {
        if user.is_empty() {
            return;
        }
        self.acls
            .entry(file.to_string())
            .or_default()
            .grants
            .insert(user.to_string(), perm);
    }

    pub fn acl_revoke(&mut self, file: &str, user: &str) {
        if let Some(entry) = self.acls.get_mut(file) {
            entry.grants.remove(user);
        }
    }

    pub fn acl_delete(&mut self, file: &str) {
        self.acls.remove(file);
    }

    pub fn acl_owner(&self, file: &str) -> Option<&str> {
        self.acls.get(file)?.owner.as_deref()
    }

    /// Authorization check. The owner always passes. An exact grant for
    /// the user decides; only users without any grant fall back to the
    /// reserved [`ANONYMOUS`] grant.
    pub fn acl_check(&self, file: &str, user: &str, need_write: bool) -> bool {
        let Some(entry) = self.acls.get(file) else {
            return false;
        };
        if entry.owner.as_deref() == Some(user) {
            return true;
        }
        let allows = |p: Perm| {
            if need_write {
                p.allows_write()
            } else {
                p.allows_read()
            }
        };
        if let Some(&perm) = entry.grants.get(user) {
            return allows(perm);
        }
        entry
            .grants
            .get(ANONYMOUS)
            .map(|&p| allows(p))
            .unwrap_or(false)
    }

    pub fn acl_rename(&mut self, old_file: &str, new_file: &str) {
        if self.acls.contains_key(new_file) {
            return;
        }
        if let Some(entry) = self.acls.remove(old_file) {
            self.acls.insert(new_file.to_string(), entry);
        }
    }

    /// Access summary of the form `"owner (RW), user2 (R), …"`.
    pub fn acl_format_access(&self, file: &str) -> String {
        let Some(entry) = self.acls.get(file) else {
            return String::new();
        };
        let mut parts = Vec::new();
        if let Some(owner) = &entry.owner {
            parts.push(format!("{} (RW)", owner));
        }
        for (user, perm) in &entry.grants {
            if entry.owner.as_deref() == Some(user.as_str()) {
                continue;
            }
            parts.push(format!("{} ({})", user, perm.as_str()));
        }
        parts.join(", ")
    }

    // --- Access requests ---

    /// `false` when an identical (file, user) request is already pending.
    pub fn add_request(&mut self, file: &str, user: &str, mode: Perm) -> bool {
        let list = self.requests.entry(file.to_string()).or_default();
        if list.iter().any(|r| r.user == user) {
            return false;
        }
        list.push(AccessRequest {
            user: user.to_string(),
            mode,
        });
        true
    }

    pub fn list_requests(&self, file: &str) -> Vec<AccessRequest> {
        self.requests.get(file).cloned().unwrap_or_default()
    }

    pub fn remove_request(&mut self, file: &str, user: &str) {
        if let Some(list) = self.requests.get_mut(file) {
            list.retain(|r| r.user != user);
            if list.is_empty() {
                self.requests.remove(file);
            }
        }
    }

    pub fn clear_requests_for(&mut self, file: &str) {
        self.requests.remove(file);
    }

    // --- Folders ---

    pub fn add_folder(&mut self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        if path.is_empty() || self.folders.iter().any(|f| f == path) {
            return false;
        }
        self.folders.push(path.to_string());
        true
    }

    pub fn folder_exists(&self, path: &str) -> bool {
        self.folders.iter().any(|f| f == path)
    }

    /// Rename a folder prefix in the folder list and every file mapping
    /// under it. Returns `(old_name, new_name, primary)` per moved file;
    /// the caller drives the physical renames.
    pub fn move_folder_prefix(
        &mut self,
        old_path: &str,
        new_path: &str,
    ) -> Vec<(String, String, u32)> {
        for folder in self.folders.iter_mut() {
            if folder == old_path {
                *folder = new_path.to_string();
            } else if folder.starts_with(old_path)
                && folder.as_bytes().get(old_path.len()) == Some(&b'/')
            {
                let rest = folder[old_path.len()..].to_string();
                *folder = format!("{}{}", new_path, rest);
            }
        }
        let moved = self.directory.rename_prefix(old_path, new_path);
        for (old_name, new_name, _) in &moved {
            self.acl_rename(old_name, new_name);
            if let Some(reqs) = self.requests.remove(old_name) {
                self.requests.insert(new_name.clone(), reqs);
            }
        }
        moved
    }

    // --- Trash ---

    pub fn trash_add(&mut self, entry: TrashEntry) {
        self.trash.push(entry);
    }

    pub fn trash_find(&self, file: &str) -> Option<&TrashEntry> {
        self.trash.iter().find(|t| t.file == file)
    }

    pub fn trash_remove(&mut self, file: &str) -> bool {
        let before = self.trash.len();
        self.trash.retain(|t| t.file != file);
        self.trash.len() != before
    }
}
