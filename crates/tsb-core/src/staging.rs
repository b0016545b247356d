//! Per-attachment staging directories.
//!
//! A `StagingArea` is a guard: `teardown()` removes it and reports failures,
//! and dropping it without `teardown()` still removes it (best-effort, logged).
//! Runs that fail or get cancelled therefore never leak disk.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use crate::{archive::ArchiveKind, domain::AttachmentId, errors::Error, Result};

/// Name of the subtree the downloaded archive is unpacked into.
pub const EXTRACTED_DIR: &str = "downloaded_template";

#[derive(Clone, Debug)]
pub struct StagingManager {
    root: PathBuf,
}

impl StagingManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of the staging area for `id`.
    pub fn path_for(&self, id: &AttachmentId) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(absolutize(&self.root)?.join(&id.0))
    }

    /// Allocate the staging area for `id`.
    ///
    /// A leftover directory with the same name (crashed earlier run) is wiped first.
    pub fn create_for(&self, id: &AttachmentId) -> Result<StagingArea> {
        let path = self.path_for(id)?;
        fs::create_dir_all(&self.root)?;

        if path.exists() {
            tracing::warn!(
                attachment = %id,
                path = %path.display(),
                "removing stale staging area"
            );
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir(&path)?;

        tracing::debug!(attachment = %id, path = %path.display(), "staging area created");
        Ok(StagingArea {
            root: path,
            id: id.clone(),
            armed: true,
        })
    }
}

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    id: AttachmentId,
    armed: bool,
}

impl StagingArea {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &AttachmentId {
        &self.id
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join(EXTRACTED_DIR)
    }

    pub fn result_path(&self, kind: ArchiveKind) -> PathBuf {
        self.root.join(kind.result_file_name())
    }

    /// Recursively delete `path`, which must be strictly inside this area.
    /// Relative paths are resolved against the area root.
    pub fn remove_subtree(&self, path: &Path) -> Result<()> {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let inside = target.starts_with(&self.root)
            && target != self.root
            && !target.components().any(|c| c == Component::ParentDir);
        if !inside {
            return Err(Error::InvalidPath {
                path: target,
                reason: format!("not inside staging area {}", self.root.display()),
            });
        }

        remove_dir_if_exists(&target)?;
        Ok(())
    }

    /// Remove the whole area. Consumes the guard.
    pub fn teardown(mut self) -> Result<()> {
        self.armed = false;
        remove_dir_if_exists(&self.root)?;
        tracing::debug!(attachment = %self.id, "staging area removed");
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = remove_dir_if_exists(&self.root) {
            tracing::warn!(
                attachment = %self.id,
                path = %self.root.display(),
                "failed to remove staging area: {e}"
            );
        }
    }
}

/// Resolve `path` against the current directory, folding `.` and `..` lexically.
///
/// Paths handed to the transform must not depend on its working directory.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn validate_id(id: &AttachmentId) -> Result<()> {
    let s = id.0.as_str();
    let ok = !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        return Ok(());
    }
    Err(Error::InvalidPath {
        path: PathBuf::from(s),
        reason: "attachment id is not a safe path component".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> AttachmentId {
        AttachmentId(s.to_string())
    }

    #[test]
    fn create_for_derives_path_from_id() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path().join("staging"));

        let area = mgr.create_for(&id("F1")).unwrap();
        assert_eq!(area.root(), tmp.path().join("staging").join("F1"));
        assert!(area.root().is_dir());
        assert_eq!(area.extracted_dir(), area.root().join("downloaded_template"));
        assert_eq!(
            area.result_path(ArchiveKind::Zip),
            area.root().join("result.zip")
        );
        area.teardown().unwrap();
    }

    #[test]
    fn rejects_ids_that_escape_the_root() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path());
        for bad in ["", ".", "..", "../F1", "a/b", "a\\b"] {
            let err = mgr.create_for(&id(bad)).unwrap_err();
            assert!(matches!(err, Error::InvalidPath { .. }), "{bad}");
        }
    }

    #[test]
    fn teardown_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path());
        let area = mgr.create_for(&id("F2")).unwrap();
        fs::create_dir_all(area.extracted_dir().join("nested")).unwrap();
        fs::write(area.extracted_dir().join("nested/x.txt"), b"x").unwrap();

        let root = area.root().to_path_buf();
        area.teardown().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn drop_without_teardown_still_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path());
        let root = {
            let area = mgr.create_for(&id("F3")).unwrap();
            fs::write(area.root().join("partial.txt"), b"x").unwrap();
            area.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn stale_area_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path());
        let stale = tmp.path().join("F4");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("old.txt"), b"old").unwrap();

        let area = mgr.create_for(&id("F4")).unwrap();
        assert!(!area.root().join("old.txt").exists());
    }

    #[test]
    fn absolutize_resolves_relative_paths() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            absolutize(Path::new("staging/./F1")).unwrap(),
            cwd.join("staging").join("F1")
        );
        assert_eq!(
            absolutize(Path::new("/var/tmp/../tmp/tsb")).unwrap(),
            PathBuf::from("/var/tmp/tsb")
        );
    }

    #[test]
    fn relative_root_yields_absolute_areas() {
        let rel = PathBuf::from(format!("target-staging-{}", std::process::id()));
        let mgr = StagingManager::new(&rel);

        let area = mgr.create_for(&id("F7")).unwrap();
        assert!(area.root().is_absolute());
        assert!(area.extracted_dir().is_absolute());
        assert_eq!(area.root(), std::env::current_dir().unwrap().join(&rel).join("F7"));
        area.teardown().unwrap();

        fs::remove_dir_all(&rel).unwrap();
    }

    #[test]
    fn remove_subtree_stays_inside_the_area() {
        let tmp = TempDir::new().unwrap();
        let mgr = StagingManager::new(tmp.path().join("staging"));
        let area = mgr.create_for(&id("F5")).unwrap();
        fs::create_dir_all(area.extracted_dir()).unwrap();
        fs::create_dir_all(area.root().join("preview")).unwrap();

        area.remove_subtree(&area.extracted_dir()).unwrap();
        assert!(!area.extracted_dir().exists());
        assert!(area.root().join("preview").exists());

        // Missing subtrees are fine.
        area.remove_subtree(Path::new(EXTRACTED_DIR)).unwrap();

        let outside = tmp.path().join("other");
        fs::create_dir_all(&outside).unwrap();
        assert!(area.remove_subtree(&outside).is_err());
        assert!(area.remove_subtree(Path::new("../F6")).is_err());
        assert!(area.remove_subtree(area.root()).is_err());
        assert!(outside.exists());
    }
}
