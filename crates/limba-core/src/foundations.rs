//! Host-provided ("foundation") component catalog.
//!
//! Dependencies whose name carries the `foundation:` prefix are satisfied
//! by the host operating system, not by bundles. The catalog is a static
//! control-block file listing each known foundation with its detected
//! version; it is loaded once when the dependency graph is initialized.

use std::path::Path;

use crate::config::{ConfigBlocks, ConfigError};
use crate::pkginfo::PkgInfo;

/// Name prefix marking a dependency as host-provided.
pub const FOUNDATION_PREFIX: &str = "foundation:";

/// Catalog of host components and their detected versions.
#[derive(Debug, Default)]
pub struct Foundations {
    components: Vec<PkgInfo>,
}

impl Foundations {
    /// Load the catalog from a file. A missing file yields an empty
    /// catalog: hosts without one simply satisfy no foundation deps.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Ok(Self::default());
        }

        let mut cfg = ConfigBlocks::load_file(path)?;
        let mut components = Vec::new();
        cfg.reset();
        loop {
            if let Some(name) = cfg.get_value("Name") {
                if name.starts_with(FOUNDATION_PREFIX) {
                    let mut info = PkgInfo::new();
                    info.name = name.to_string();
                    info.version = cfg.get_value("Version").unwrap_or("").to_string();
                    components.push(info);
                }
            }
            if !cfg.next_block() {
                break;
            }
        }
        Ok(Self { components })
    }

    /// Build a catalog from explicit entries (tests).
    #[must_use]
    pub fn from_components(components: Vec<PkgInfo>) -> Self {
        Self { components }
    }

    /// Whether a dependency name refers to a foundation.
    #[must_use]
    pub fn is_foundation_dep(dep: &PkgInfo) -> bool {
        dep.name.starts_with(FOUNDATION_PREFIX)
    }

    /// Find a host component satisfying the requirement.
    #[must_use]
    pub fn find_satisfying(&self, dep: &PkgInfo) -> Option<&PkgInfo> {
        self.components.iter().find(|c| c.satisfies_requirement(dep))
    }
}
