//! Export of selected payload files into the host prefix.
//!
//! Packages can mark files (launchers, desktop entries, icons) for export.
//! Exported files become symlinks under the export root pointing into the
//! installed payload, and every link is recorded in the package's
//! `exported` index so removal can clean up after it.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::paths;

/// Errors raised while exporting files.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The export target already exists and overriding is not allowed.
    #[error("export target already exists: {0}")]
    TargetExists(PathBuf),
}

/// Creates export symlinks for one package and records them.
#[derive(Debug)]
pub struct Exporter {
    pkgid: String,
    export_root: PathBuf,
    override_allowed: bool,
    entries: Vec<(String, PathBuf)>,
}

impl Exporter {
    /// Exporter for `pkgid` targeting the default export root.
    #[must_use]
    pub fn new(pkgid: &str) -> Self {
        Self::with_root(pkgid, paths::export_root())
    }

    /// Exporter targeting an explicit export root.
    #[must_use]
    pub fn with_root(pkgid: &str, export_root: PathBuf) -> Self {
        Self {
            pkgid: pkgid.to_string(),
            export_root,
            override_allowed: false,
            entries: Vec::new(),
        }
    }

    /// Package id the exporter is working for.
    #[must_use]
    pub fn pkgid(&self) -> &str {
        &self.pkgid
    }

    /// Allow replacing files another package already exported.
    pub fn set_override_allowed(&mut self, allowed: bool) {
        self.override_allowed = allowed;
    }

    /// Export one payload file.
    ///
    /// `relative` is the path inside the payload tree, `disk_location` the
    /// installed file. Files in unknown categories are silently kept
    /// private to the package.
    pub fn process_file(
        &mut self,
        relative: &str,
        disk_location: &Path,
    ) -> Result<(), ExporterError> {
        let Some(target) = self.target_for(relative) else {
            tracing::debug!(pkgid = %self.pkgid, "not exporting {relative}");
            return Ok(());
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.symlink_metadata().is_ok() {
            if !self.override_allowed {
                return Err(ExporterError::TargetExists(target));
            }
            fs::remove_file(&target)?;
        }
        std::os::unix::fs::symlink(disk_location, &target)?;

        self.entries.push((relative.to_string(), target));
        Ok(())
    }

    /// The tab-separated `source\ttarget` index of everything exported.
    #[must_use]
    pub fn exported_index(&self) -> String {
        let mut out = String::new();
        for (source, target) in &self.entries {
            out.push_str(source);
            out.push('\t');
            out.push_str(&target.to_string_lossy());
            out.push('\n');
        }
        out
    }

    fn target_for(&self, relative: &str) -> Option<PathBuf> {
        let rel = Path::new(relative);
        let file_name = rel.file_name()?;

        if relative.starts_with("bin/") {
            return Some(self.export_root.join("bin").join(file_name));
        }
        if relative.starts_with("share/applications/") {
            return Some(self.export_root.join("share/applications").join(file_name));
        }
        if let Some(rest) = relative.strip_prefix("share/icons/") {
            return Some(self.export_root.join("share/icons").join(rest));
        }
        None
    }
}
