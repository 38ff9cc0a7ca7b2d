//! Package metadata records and dependency expressions.
//!
//! [`PkgInfo`] is the value object passed between every component: it
//! describes an installed package, an available package in a repository
//! index, or (with only name/version/relation set) a dependency
//! requirement being queried.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use thiserror::Error;

use crate::config::{ConfigBlocks, ConfigError};
use crate::version;

/// Errors raised while loading or storing package metadata.
#[derive(Error, Debug)]
pub enum PkgInfoError {
    /// Control data could not be read or written.
    #[error("control data error: {0}")]
    Config(#[from] ConfigError),

    /// The control block lacks a mandatory field.
    #[error("missing mandatory field: {0}")]
    MissingField(&'static str),
}

bitflags! {
    /// State and behavior flags of a package.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PackageFlags: u32 {
        /// The package is an application and needs a runtime.
        const APPLICATION = 1 << 0;
        /// The package was installed automatically as a dependency.
        const AUTOMATIC = 1 << 1;
        /// Remove this package automatically once nothing uses it.
        const FADED = 1 << 2;
        /// The package is available in a remote repository.
        const AVAILABLE = 1 << 3;
        /// The package is installed on this system.
        const INSTALLED = 1 << 4;
    }
}

bitflags! {
    /// Version relation of a dependency requirement.
    ///
    /// `>=` and `<=` are expressed as combinations with [`VersionRelation::EQUAL`];
    /// an empty set means the relation is unknown and any version matches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VersionRelation: u8 {
        /// Versions must compare equal.
        const EQUAL = 1 << 0;
        /// The candidate version must be lower.
        const LOWER = 1 << 1;
        /// The candidate version must be higher.
        const HIGHER = 1 << 2;
    }
}

impl VersionRelation {
    /// Parse a relation operator as written in dependency clauses.
    #[must_use]
    pub fn from_operator(op: &str) -> Self {
        match op {
            "==" => Self::EQUAL,
            ">=" => Self::HIGHER | Self::EQUAL,
            "<=" => Self::LOWER | Self::EQUAL,
            ">>" => Self::HIGHER,
            "<<" => Self::LOWER,
            _ => Self::empty(),
        }
    }

    /// The operator string, or `None` when the relation is unknown.
    #[must_use]
    pub fn as_operator(&self) -> Option<&'static str> {
        if *self == Self::EQUAL {
            Some("==")
        } else if *self == (Self::HIGHER | Self::EQUAL) {
            Some(">=")
        } else if *self == (Self::LOWER | Self::EQUAL) {
            Some("<=")
        } else if *self == Self::HIGHER {
            Some(">>")
        } else if *self == Self::LOWER {
            Some("<<")
        } else {
            None
        }
    }

    /// Whether a comparison result satisfies this relation.
    #[must_use]
    pub fn matches(&self, ord: std::cmp::Ordering) -> bool {
        match ord {
            std::cmp::Ordering::Equal => self.contains(Self::EQUAL),
            std::cmp::Ordering::Greater => self.contains(Self::HIGHER),
            std::cmp::Ordering::Less => self.contains(Self::LOWER),
        }
    }
}

/// Metadata describing a package or a dependency requirement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PkgInfo {
    /// Machine name, e.g. `libgreet`.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Human-readable application name.
    pub appname: String,
    /// Architecture the payload was built for.
    pub architecture: String,
    /// Raw comma-separated dependency list.
    pub dependencies: String,
    /// Raw comma-separated build-dependency list.
    pub build_dependencies: String,
    /// Runtime uuid, the sentinel `"None"`, or empty before installation.
    pub runtime_uuid: String,
    /// SHA-256 checksum of the package file.
    pub checksum_sha256: String,
    /// Download location, absolute once resolved against a repository.
    pub repo_location: String,
    /// Identifier of the originating repository.
    pub repository: String,
    /// State and behavior flags.
    pub flags: PackageFlags,
    /// Version relation, used when this record is a requirement.
    pub version_relation: VersionRelation,
}

impl PkgInfo {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dependency requirement from a name, an optional version and
    /// a relation.
    #[must_use]
    pub fn requirement(name: &str, relation: VersionRelation, req_version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: req_version.to_string(),
            version_relation: relation,
            ..Self::default()
        }
    }

    /// Canonical identifier `<name>/<version>`.
    #[must_use]
    pub fn id(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.name, self.version)
        }
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: PackageFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Set `flag`.
    pub fn add_flag(&mut self, flag: PackageFlags) {
        self.flags.insert(flag);
    }

    /// Name plus relation, e.g. `libgreet (>= 1.0)`, for messages.
    #[must_use]
    pub fn name_relation_string(&self) -> String {
        match self.version_relation.as_operator() {
            Some(op) if !self.version.is_empty() => {
                format!("{} ({} {})", self.name, op, self.version)
            }
            _ => self.name.clone(),
        }
    }

    /// Whether this package satisfies the requirement `req`.
    ///
    /// Names must match exactly. When the requirement declares a relation
    /// and a version, the versions are compared with the shared
    /// [`version::compare`] and the result must agree with the relation.
    #[must_use]
    pub fn satisfies_requirement(&self, req: &PkgInfo) -> bool {
        if self.name != req.name {
            return false;
        }
        if req.version_relation.is_empty() || req.version.is_empty() {
            return true;
        }
        req.version_relation
            .matches(version::compare(&self.version, &req.version))
    }

    /// Populate this record from the current block of `cfg`.
    pub fn load_from_block(&mut self, cfg: &ConfigBlocks) -> Result<(), PkgInfoError> {
        let get = |field: &str| cfg.get_value(field).unwrap_or("").to_string();

        self.name = get("Name");
        if self.name.is_empty() {
            return Err(PkgInfoError::MissingField("Name"));
        }
        self.version = get("Version");
        self.appname = get("AppName");
        self.architecture = get("Architecture");
        self.dependencies = get("Requires");
        self.build_dependencies = get("BuildRequires");
        self.runtime_uuid = get("Runtime-UUID");
        self.checksum_sha256 = get("SHA256");
        self.repo_location = get("Location");
        self.repository = get("Origin");

        if cfg.get_value("Type").is_some_and(|t| t == "application") {
            self.flags.insert(PackageFlags::APPLICATION);
        }
        if cfg.get_value("Automatic").is_some_and(|v| v == "yes") {
            self.flags.insert(PackageFlags::AUTOMATIC);
        }
        if cfg.get_value("Faded").is_some_and(|v| v == "yes") {
            self.flags.insert(PackageFlags::FADED);
        }

        Ok(())
    }

    /// Parse the first block of `data` as package metadata.
    pub fn from_control_data(data: &str) -> Result<Self, PkgInfoError> {
        let cfg = ConfigBlocks::from_data(data)?;
        let mut info = Self::new();
        info.load_from_block(&cfg)?;
        Ok(info)
    }

    /// Load package metadata from a control file.
    pub fn load_file(path: &Path) -> Result<Self, PkgInfoError> {
        let cfg = ConfigBlocks::load_file(path)?;
        let mut info = Self::new();
        info.load_from_block(&cfg)?;
        Ok(info)
    }

    /// Write this record into the current block of `cfg`.
    ///
    /// The AVAILABLE and INSTALLED flags are runtime state and are not
    /// persisted; they are reapplied by the manager and the cache on load.
    pub fn store_in_block(&self, cfg: &mut ConfigBlocks) {
        let mut set = |field: &str, value: &str| {
            if value.is_empty() {
                cfg.remove_value(field);
            } else {
                cfg.set_value(field, value);
            }
        };

        set("Name", &self.name);
        set("Version", &self.version);
        set("AppName", &self.appname);
        set("Architecture", &self.architecture);
        set("Requires", &self.dependencies);
        set("BuildRequires", &self.build_dependencies);
        set("Runtime-UUID", &self.runtime_uuid);
        set("SHA256", &self.checksum_sha256);
        set("Location", &self.repo_location);
        set("Origin", &self.repository);
        set(
            "Type",
            if self.has_flag(PackageFlags::APPLICATION) {
                "application"
            } else {
                ""
            },
        );
        set(
            "Automatic",
            if self.has_flag(PackageFlags::AUTOMATIC) { "yes" } else { "" },
        );
        set("Faded", if self.has_flag(PackageFlags::FADED) { "yes" } else { "" });
    }

    /// Serialize this record as a standalone control document.
    #[must_use]
    pub fn to_control_data(&self) -> String {
        let mut cfg = ConfigBlocks::new();
        cfg.set_value("Format-Version", "1.0");
        self.store_in_block(&mut cfg);
        cfg.emit()
    }

    /// Write this record to a control file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PkgInfoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        std::fs::write(path, self.to_control_data()).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Path of this package's control file under `software_root`.
    #[must_use]
    pub fn control_path(&self, software_root: &Path) -> PathBuf {
        software_root
            .join(&self.name)
            .join(&self.version)
            .join("control")
    }

    /// Persist metadata changes of an installed package.
    pub fn save_changes(&self, software_root: &Path) -> Result<(), PkgInfoError> {
        self.save_to_file(&self.control_path(software_root))
    }
}

impl fmt::Display for PkgInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Parse a comma-separated dependency list into requirement records.
///
/// A clause is `name` or `name (relation version)`; whitespace around the
/// parenthesis is optional. An unparseable version clause is dropped and the
/// bare name kept, so a malformed relation never fails the whole list.
#[must_use]
pub fn parse_dependencies(raw: &str) -> Vec<PkgInfo> {
    let mut deps = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (name, clause) = match token.split_once('(') {
            Some((name, rest)) => (name.trim(), rest.trim().strip_suffix(')')),
            None => (token, None),
        };
        if name.is_empty() {
            continue;
        }

        let mut dep = PkgInfo::requirement(name, VersionRelation::empty(), "");
        if let Some(clause) = clause {
            let clause = clause.trim();
            if clause.len() >= 2 && clause.is_char_boundary(2) {
                let (op, ver) = clause.split_at(2);
                let relation = VersionRelation::from_operator(op);
                if !relation.is_empty() {
                    dep.version_relation = relation;
                    dep.version = ver.trim().to_string();
                }
            }
        }
        deps.push(dep);
    }
    deps
}

/// Find the first package in `pkgs` satisfying the requirement `req`.
#[must_use]
pub fn find_satisfying_pkg<'a>(pkgs: &'a [PkgInfo], req: &PkgInfo) -> Option<&'a PkgInfo> {
    pkgs.iter().find(|p| p.satisfies_requirement(req))
}
