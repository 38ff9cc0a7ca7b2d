//! Installed software and runtime enumeration, removal.
//!
//! The manager owns the view of the software root: which packages and
//! runtimes are installed. Scans are lazy and cached until
//! [`Manager::invalidate`] is called after an install or removal.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::paths;
use crate::pkginfo::{PackageFlags, PkgInfo};
use crate::runtime::Runtime;

/// Errors raised by manager operations.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// No installed package matches the id.
    #[error("could not find software: {0}")]
    NotFound(String),

    /// Files could not be deleted.
    #[error("removal failed: {0}")]
    RemoveFailed(String),

    /// Removing the package would break an installed application.
    #[error("removing '{pkgid}' would break at least '{dependent}' as well")]
    Dependency {
        /// The package whose removal was requested.
        pkgid: String,
        /// An installed application depending on it.
        dependent: String,
    },

    /// Underlying I/O failure while scanning.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumerates and removes installed software.
#[derive(Debug)]
pub struct Manager {
    software_root: PathBuf,
    installed: Option<Vec<PkgInfo>>,
    runtimes: Option<Vec<Runtime>>,
}

impl Manager {
    /// Manager over the default software root.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(paths::software_root())
    }

    /// Manager over an explicit software root.
    #[must_use]
    pub fn with_root(software_root: PathBuf) -> Self {
        Self {
            software_root,
            installed: None,
            runtimes: None,
        }
    }

    /// The software root this manager operates on.
    #[must_use]
    pub fn software_root(&self) -> &Path {
        &self.software_root
    }

    /// Directory holding the runtimes.
    #[must_use]
    pub fn runtimes_dir(&self) -> PathBuf {
        self.software_root.join("runtimes")
    }

    /// Drop cached scan results; the next query rescans the disk.
    pub fn invalidate(&mut self) {
        self.installed = None;
        self.runtimes = None;
    }

    /// All installed packages, with the INSTALLED flag applied.
    pub fn installed_software(&mut self) -> Result<Vec<PkgInfo>, ManagerError> {
        if self.installed.is_none() {
            self.installed = Some(self.scan_installed()?);
        }
        Ok(self.installed.clone().unwrap_or_default())
    }

    /// All installed runtimes.
    pub fn installed_runtimes(&mut self) -> Result<Vec<Runtime>, ManagerError> {
        if self.runtimes.is_none() {
            self.runtimes = Some(self.scan_runtimes()?);
        }
        Ok(self.runtimes.clone().unwrap_or_default())
    }

    /// Look up one installed package by id.
    pub fn installed_package(&mut self, pkgid: &str) -> Result<PkgInfo, ManagerError> {
        self.installed_software()?
            .into_iter()
            .find(|p| p.id() == pkgid)
            .ok_or_else(|| ManagerError::NotFound(pkgid.to_string()))
    }

    /// Find an installed runtime whose member set contains every id in
    /// `member_ids`. The first hit in scan order wins.
    pub fn find_runtime_with_members(
        &mut self,
        member_ids: &[String],
    ) -> Result<Option<Runtime>, ManagerError> {
        Ok(self
            .installed_runtimes()?
            .into_iter()
            .find(|rt| rt.contains_all(member_ids)))
    }

    /// Remove an installed package.
    ///
    /// Fails with [`ManagerError::Dependency`] if an installed application
    /// references a runtime the package is a member of; otherwise runtimes
    /// that contained only this package are garbage-collected, exported
    /// files are unlinked and the package directory is deleted.
    pub fn remove_software(&mut self, pkgid: &str) -> Result<(), ManagerError> {
        let swpath = self.software_root.join(pkgid);
        if !swpath.join("control").is_file() {
            return Err(ManagerError::NotFound(pkgid.to_string()));
        }

        // A runtime using this package keeps it alive as long as some
        // application references that runtime.
        let member_query = vec![pkgid.to_string()];
        let installed = self.installed_software()?;
        let mut stale_runtimes = Vec::new();
        for rt in self.installed_runtimes()? {
            if !rt.contains_all(&member_query) {
                continue;
            }
            if let Some(dependent) = installed
                .iter()
                .find(|p| p.runtime_uuid == rt.uuid())
            {
                return Err(ManagerError::Dependency {
                    pkgid: pkgid.to_string(),
                    dependent: dependent.name.clone(),
                });
            }
            stale_runtimes.push(rt);
        }
        for rt in stale_runtimes {
            rt.remove()
                .map_err(|e| ManagerError::RemoveFailed(e.to_string()))?;
        }

        self.remove_exported_files(&swpath)?;

        std::fs::remove_dir_all(&swpath)
            .map_err(|e| ManagerError::RemoveFailed(format!("{}: {e}", swpath.display())))?;
        // Prune the now possibly empty <name> directory.
        if let Some(parent) = swpath.parent() {
            let _ = std::fs::remove_dir(parent);
        }

        tracing::debug!("removed package {pkgid}");
        self.invalidate();
        Ok(())
    }

    fn remove_exported_files(&self, swpath: &Path) -> Result<(), ManagerError> {
        let index = swpath.join("exported");
        if !index.is_file() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&index)?;
        for line in content.lines() {
            let Some((_, target)) = line.split_once('\t') else {
                continue;
            };
            if !target.starts_with('/') {
                continue;
            }
            if Path::new(target).symlink_metadata().is_ok() {
                std::fs::remove_file(target).map_err(|e| {
                    ManagerError::RemoveFailed(format!("could not delete file '{target}': {e}"))
                })?;
            }
        }
        Ok(())
    }

    fn scan_installed(&self) -> Result<Vec<PkgInfo>, ManagerError> {
        let mut found = Vec::new();
        if !self.software_root.is_dir() {
            return Ok(found);
        }

        for name_entry in std::fs::read_dir(&self.software_root)? {
            let name_entry = name_entry?;
            let name = name_entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == "runtimes" || !name_entry.path().is_dir() {
                continue;
            }
            for ver_entry in std::fs::read_dir(name_entry.path())? {
                let ver_entry = ver_entry?;
                let control = ver_entry.path().join("control");
                if !control.is_file() {
                    continue;
                }
                match PkgInfo::load_file(&control) {
                    Ok(mut info) => {
                        info.add_flag(PackageFlags::INSTALLED);
                        found.push(info);
                    }
                    Err(err) => {
                        tracing::warn!(
                            "skipping unreadable control file {}: {err}",
                            control.display()
                        );
                    }
                }
            }
        }
        Ok(found)
    }

    fn scan_runtimes(&self) -> Result<Vec<Runtime>, ManagerError> {
        let mut found = Vec::new();
        let rt_root = self.runtimes_dir();
        if !rt_root.is_dir() {
            return Ok(found);
        }

        for entry in std::fs::read_dir(&rt_root)? {
            let entry = entry?;
            if !entry.path().join("control").is_file() {
                continue;
            }
            match Runtime::load_directory(&entry.path()) {
                Ok(rt) => found.push(rt),
                Err(err) => {
                    tracing::warn!(
                        "skipping unreadable runtime {}: {err}",
                        entry.path().display()
                    );
                }
            }
        }
        Ok(found)
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
