//! Named sets of installed packages composed via overlay mounts.
//!
//! A runtime pins the dependency view of an application: an unordered set
//! of installed package ids, persisted under
//! `<software_root>/runtimes/<uuid>/control`. Runtimes are immutable after
//! creation and garbage-collected when the last application referencing
//! them is removed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigBlocks, ConfigError};

/// Errors raised while handling runtimes.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime descriptor could not be parsed.
    #[error("control data error: {0}")]
    Config(#[from] ConfigError),

    /// The descriptor lacks its member list.
    #[error("runtime at {0} has no member list")]
    NoMembers(PathBuf),
}

/// A persisted runtime: uuid plus member package ids.
#[derive(Debug, Clone)]
pub struct Runtime {
    uuid: String,
    members: BTreeSet<String>,
    path: PathBuf,
}

impl Runtime {
    /// Create and persist a new runtime containing `members`.
    pub fn create_with_members(
        runtimes_dir: &Path,
        members: &[String],
    ) -> Result<Self, RuntimeError> {
        let uuid = Uuid::new_v4().to_string();
        let path = runtimes_dir.join(&uuid);
        std::fs::create_dir_all(&path)?;
        set_mode(&path, 0o755)?;

        let members: BTreeSet<String> = members.iter().cloned().collect();
        let ids: Vec<&str> = members.iter().map(String::as_str).collect();

        let mut cfg = ConfigBlocks::new();
        cfg.set_value("Format-Version", "1.0");
        cfg.set_value("Requires", &ids.join(", "));
        let control = path.join("control");
        cfg.save_to_file(&control)?;
        set_mode(&control, 0o644)?;

        tracing::debug!("created runtime {uuid} with members [{}]", ids.join(", "));
        Ok(Self { uuid, members, path })
    }

    /// Load a runtime from its directory.
    pub fn load_directory(path: &Path) -> Result<Self, RuntimeError> {
        let cfg = ConfigBlocks::load_file(&path.join("control"))?;
        let Some(requires) = cfg.get_value("Requires") else {
            return Err(RuntimeError::NoMembers(path.to_path_buf()));
        };
        let members = requires
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let uuid = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            uuid,
            members,
            path: path.to_path_buf(),
        })
    }

    /// Load a runtime by uuid below `software_root`.
    pub fn load_by_uuid(software_root: &Path, uuid: &str) -> Result<Self, RuntimeError> {
        Self::load_directory(&software_root.join("runtimes").join(uuid))
    }

    /// The runtime's uuid.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Member package ids.
    #[must_use]
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// Directory the runtime is persisted in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether every id in `ids` is a member.
    #[must_use]
    pub fn contains_all(&self, ids: &[String]) -> bool {
        ids.iter().all(|id| self.members.contains(id))
    }

    /// Delete the runtime from disk.
    pub fn remove(self) -> Result<(), RuntimeError> {
        std::fs::remove_dir_all(&self.path)?;
        tracing::debug!("removed runtime {}", self.uuid);
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let members = vec!["libgreet/1.0".to_string(), "libmisc/2.1".to_string()];
        let rt = Runtime::create_with_members(dir.path(), &members).unwrap();
        assert!(!rt.uuid().is_empty());

        let loaded = Runtime::load_directory(rt.path()).unwrap();
        assert_eq!(loaded.uuid(), rt.uuid());
        assert_eq!(loaded.members().len(), 2);
        assert!(loaded.contains_all(&members));
        assert!(!loaded.contains_all(&["libother/1.0".to_string()]));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let rt =
            Runtime::create_with_members(dir.path(), &["libgreet/1.0".to_string()]).unwrap();
        let path = rt.path().to_path_buf();
        rt.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_member_set_is_unordered() {
        let dir = tempdir().unwrap();
        let rt = Runtime::create_with_members(
            dir.path(),
            &["b/2".to_string(), "a/1".to_string(), "b/2".to_string()],
        )
        .unwrap();
        let loaded = Runtime::load_directory(rt.path()).unwrap();
        assert_eq!(loaded.members().len(), 2);
        assert!(loaded.contains_all(&["a/1".to_string(), "b/2".to_string()]));
    }
}
