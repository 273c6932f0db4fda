//! On-Disk Store
//!
//! Each storage server owns a data root `ss_data/ss<id>/` with:
//! - `files/<path>`: raw document bytes
//! - `undo/<path>.undo`: zero-or-one single-step undo snapshot per file
//! - `checkpoints/<path>/<name>.chk`: named checkpoint copies
//! - `meta/`: scratch for temp files
//!
//! Parent directories are created on demand. Every content replacement is
//! write-to-temp, fsync, rename.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncWriteExt;

/// Read cap; a corrupt or runaway file must not exhaust memory.
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SsStore {
    root: PathBuf,
}

/// File metadata returned by the `INFO` operation.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub words: u64,
    pub chars: u64,
}

fn epoch_secs(t: std::io::Result<std::time::SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SsStore {
    /// Open (creating on demand) the per-server store under
    /// `<base>/ss<id>`.
    pub async fn open(base: &str, ss_id: u32) -> Result<Self> {
        let root = PathBuf::from(base).join(format!("ss{}", ss_id));
        for sub in ["files", "meta", "undo", "checkpoints"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    pub fn file_path(&self, file: &str) -> PathBuf {
        self.root.join("files").join(file)
    }

    pub fn undo_path(&self, file: &str) -> PathBuf {
        self.root.join("undo").join(format!("{}.undo", file))
    }

    pub fn checkpoints_dir(&self, file: &str) -> PathBuf {
        self.root.join("checkpoints").join(file)
    }

    pub fn checkpoint_path(&self, file: &str, name: &str) -> PathBuf {
        self.checkpoints_dir(file).join(format!("{}.chk", name))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Read a file under `files/`, `None` if absent. The path may reach
    /// sibling trees through relative segments; the undo replication
    /// fetch relies on `../undo/<file>.undo` resolving here.
    pub async fn read_file(&self, file: &str) -> Result<Option<Vec<u8>>> {
        self.read_at(&self.file_path(file)).await
    }

    async fn read_at(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(None);
        }
        if meta.len() > MAX_FILE_BYTES {
            bail!("{} exceeds the {} byte read cap", path.display(), MAX_FILE_BYTES);
        }
        Ok(Some(tokio::fs::read(path).await?))
    }

    /// Replace `path` atomically: sibling temp file, fsync, rename. Falls
    /// back to a scratch file under `meta/` when the sibling temp cannot
    /// be created.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        Self::ensure_parent(path).await?;
        let sibling = PathBuf::from(format!("{}.tmp", path.display()));
        let (tmp_path, mut f) = match tokio::fs::File::create(&sibling).await {
            Ok(f) => (sibling, f),
            Err(_) => {
                let scratch = self
                    .root
                    .join("meta")
                    .join(format!("{}.tmp", uuid::Uuid::new_v4()));
                let f = tokio::fs::File::create(&scratch).await?;
                (scratch, f)
            }
        };
        f.write_all(bytes).await?;
        f.sync_all().await?;
        drop(f);
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).context("rename over final path");
        }
        Ok(())
    }

    /// Atomically replace the document body.
    pub async fn put_file(&self, file: &str, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&self.file_path(file), bytes).await
    }

    /// Create an empty file. `Ok(false)` means it already existed.
    pub async fn create_file(&self, file: &str) -> Result<bool> {
        let path = self.file_path(file);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(false);
        }
        Self::ensure_parent(&path).await?;
        tokio::fs::File::create(&path).await?;
        Ok(true)
    }

    /// Remove the file plus its undo snapshot and checkpoint directory.
    /// `Ok(false)` when the file itself was absent.
    pub async fn delete_file(&self, file: &str) -> Result<bool> {
        let existed = tokio::fs::remove_file(self.file_path(file)).await.is_ok();
        let _ = tokio::fs::remove_file(self.undo_path(file)).await;
        let _ = tokio::fs::remove_dir_all(self.checkpoints_dir(file)).await;
        Ok(existed)
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("files").join(path)).await?;
        Ok(())
    }

    /// Outcome of a physical rename attempt.
    pub async fn rename_file(&self, file: &str, new_file: &str) -> Result<RenameOutcome> {
        let old_path = self.file_path(file);
        let new_path = self.file_path(new_file);
        if tokio::fs::metadata(&old_path).await.is_err() {
            return Ok(RenameOutcome::NotFound);
        }
        if tokio::fs::metadata(&new_path).await.is_ok() {
            return Ok(RenameOutcome::Conflict);
        }

        // Undo snapshot and checkpoints follow the file, best-effort.
        let old_undo = self.undo_path(file);
        if tokio::fs::metadata(&old_undo).await.is_ok() {
            let new_undo = self.undo_path(new_file);
            let _ = Self::ensure_parent(&new_undo).await;
            let _ = tokio::fs::rename(&old_undo, &new_undo).await;
        }
        let old_chk = self.checkpoints_dir(file);
        if tokio::fs::metadata(&old_chk).await.is_ok() {
            let new_chk = self.checkpoints_dir(new_file);
            let _ = Self::ensure_parent(&new_chk).await;
            let _ = tokio::fs::rename(&old_chk, &new_chk).await;
        }

        Self::ensure_parent(&new_path).await?;
        tokio::fs::rename(&old_path, &new_path).await?;
        Ok(RenameOutcome::Renamed)
    }

    // --- Undo snapshots (single step) ---

    pub async fn read_undo(&self, file: &str) -> Result<Option<Vec<u8>>> {
        self.read_at(&self.undo_path(file)).await
    }

    pub async fn write_undo(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let path = self.undo_path(file);
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Restore the file from its undo snapshot and consume the snapshot.
    /// `Ok(false)` when no snapshot exists.
    pub async fn restore_undo(&self, file: &str) -> Result<bool> {
        let Some(snapshot) = self.read_undo(file).await? else {
            return Ok(false);
        };
        self.put_file(file, &snapshot).await?;
        let _ = tokio::fs::remove_file(self.undo_path(file)).await;
        Ok(true)
    }

    // --- Checkpoints ---

    pub async fn write_checkpoint(&self, file: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.checkpoint_path(file, name);
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    pub async fn read_checkpoint(&self, file: &str, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_at(&self.checkpoint_path(file, name)).await
    }

    pub async fn list_checkpoints(&self, file: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.checkpoints_dir(file)).await {
            Ok(d) => d,
            Err(_) => return Ok(names),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".chk") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // --- Metadata ---

    pub async fn info(&self, file: &str) -> Result<Option<FileInfo>> {
        let path = self.file_path(file);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let words = match self.read_at(&path).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .split_whitespace()
                .count() as u64,
            None => 0,
        };
        Ok(Some(FileInfo {
            size: meta.len(),
            mtime: epoch_secs(meta.modified()),
            atime: epoch_secs(meta.accessed()),
            words,
            chars: meta.len(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    NotFound,
    Conflict,
}
