//! Directory lifecycle: create, clone, delete.

use maestro_core::{Compression, SessionId};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::archive::{self, ArchiveOutput};
use crate::error::{WorkdirError, WorkdirResult};

/// Owns the `active/` and archive roots and the lifecycle of everything
/// beneath them.
#[derive(Debug, Clone)]
pub struct WorkdirManager {
    active_root: PathBuf,
    archive_root: PathBuf,
}

impl WorkdirManager {
    /// Create a manager; both roots are created eagerly.
    pub fn new(
        active_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
    ) -> WorkdirResult<Self> {
        let active_root = active_root.into();
        let archive_root = archive_root.into();
        std::fs::create_dir_all(&active_root)
            .map_err(|e| WorkdirError::io(&active_root, e))?;
        std::fs::create_dir_all(&archive_root)
            .map_err(|e| WorkdirError::io(&archive_root, e))?;
        Ok(Self {
            active_root,
            archive_root,
        })
    }

    /// Path a session's workdir lives at.
    #[must_use]
    pub fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.active_root.join(session_id.to_string())
    }

    /// Path a session's archive blob lives at.
    #[must_use]
    pub fn archive_path_for(&self, session_id: SessionId, compression: Compression) -> PathBuf {
        self.archive_root
            .join(format!("{session_id}.{}", compression.extension()))
    }

    /// Create a session's workdir. Idempotent on an existing directory.
    pub fn create(&self, session_id: SessionId) -> WorkdirResult<PathBuf> {
        let path = self.path_for(session_id);
        std::fs::create_dir_all(&path).map_err(|e| WorkdirError::io(&path, e))?;
        debug!(session_id = %session_id, path = %path.display(), "workdir created");
        Ok(path)
    }

    /// Deep-copy `src` into the workdir of `dst_session_id` (fork support).
    ///
    /// Runs on the blocking pool.
    pub async fn clone_into(
        &self,
        src: &Path,
        dst_session_id: SessionId,
    ) -> WorkdirResult<PathBuf> {
        let src = src.to_path_buf();
        if !src.is_dir() {
            return Err(WorkdirError::NotFound(src));
        }
        let dst = self.path_for(dst_session_id);
        let dst_clone = dst.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst_clone))
            .await
            .map_err(|e| WorkdirError::Join(e.to_string()))??;
        info!(dst = %dst.display(), "workdir cloned");
        Ok(dst)
    }

    /// Produce the archive blob and manifest for a session's workdir.
    ///
    /// Files are streamed in sorted relpath order so the manifest is
    /// deterministic. Runs on the blocking pool.
    pub async fn archive(
        &self,
        session_id: SessionId,
        compression: Compression,
    ) -> WorkdirResult<ArchiveOutput> {
        let workdir = self.path_for(session_id);
        if !workdir.is_dir() {
            return Err(WorkdirError::NotFound(workdir));
        }
        let blob = self.archive_path_for(session_id, compression);
        let blob_clone = blob.clone();
        let output = tokio::task::spawn_blocking(move || {
            archive::write_archive(&workdir, &blob_clone, compression)
        })
        .await
        .map_err(|e| WorkdirError::Join(e.to_string()))??;
        info!(
            session_id = %session_id,
            blob = %blob.display(),
            files = output.manifest.len(),
            size_bytes = output.size_bytes,
            "workdir archived"
        );
        Ok(output)
    }

    /// Extract an archive blob into `dst`.
    ///
    /// Runs on the blocking pool.
    pub async fn extract(
        &self,
        archive_path: &Path,
        compression: Compression,
        dst: &Path,
    ) -> WorkdirResult<PathBuf> {
        let archive_path = archive_path.to_path_buf();
        if !archive_path.is_file() {
            return Err(WorkdirError::NotFound(archive_path));
        }
        let dst = dst.to_path_buf();
        let dst_clone = dst.clone();
        tokio::task::spawn_blocking(move || {
            archive::extract_archive(&archive_path, compression, &dst_clone)
        })
        .await
        .map_err(|e| WorkdirError::Join(e.to_string()))??;
        Ok(dst)
    }

    /// Remove a directory tree. Missing paths are fine.
    pub fn delete(&self, path: &Path) -> WorkdirResult<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkdirError::io(path, e)),
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> WorkdirResult<()> {
    std::fs::create_dir_all(dst).map_err(|e| WorkdirError::io(dst, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| WorkdirError::io(src, e))? {
        let entry = entry.map_err(|e| WorkdirError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| WorkdirError::io(&from, e))?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to).map_err(|e| WorkdirError::io(&from, e))?;
        }
        // Symlinks and special files are not part of a session workdir.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> WorkdirManager {
        WorkdirManager::new(tmp.path().join("active"), tmp.path().join("archives"))
            .expect("manager")
    }

    #[test]
    fn create_is_idempotent() {
        let tmp = TempDir::new().expect("tmp");
        let m = manager(&tmp);
        let session_id = SessionId::new();
        let first = m.create(session_id).expect("first");
        let second = m.create(session_id).expect("second");
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn clone_copies_nested_tree() {
        let tmp = TempDir::new().expect("tmp");
        let m = manager(&tmp);
        let src_id = SessionId::new();
        let src = m.create(src_id).expect("src");
        std::fs::write(src.join("a.txt"), b"alpha").expect("write");
        std::fs::create_dir_all(src.join("sub")).expect("mkdir");
        std::fs::write(src.join("sub/b.txt"), b"beta").expect("write");

        let dst_id = SessionId::new();
        let dst = m.clone_into(&src, dst_id).await.expect("clone");

        assert_eq!(std::fs::read(dst.join("a.txt")).expect("read"), b"alpha");
        assert_eq!(std::fs::read(dst.join("sub/b.txt")).expect("read"), b"beta");
        // The source is untouched.
        assert!(src.join("a.txt").is_file());
    }

    #[tokio::test]
    async fn clone_of_missing_source_fails() {
        let tmp = TempDir::new().expect("tmp");
        let m = manager(&tmp);
        let err = m
            .clone_into(Path::new("/nonexistent/src"), SessionId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkdirError::NotFound(_)));
    }

    #[test]
    fn delete_tolerates_missing() {
        let tmp = TempDir::new().expect("tmp");
        let m = manager(&tmp);
        m.delete(Path::new("/nonexistent/workdir")).expect("noop");
    }
}
