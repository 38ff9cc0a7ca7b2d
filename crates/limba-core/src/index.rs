//! Package index files.
//!
//! A package index is a multi-block control document listing one package
//! per block. Repositories publish gzip'd indices per architecture; the
//! cache merges them into the plain-text `available.index`.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::config::{ConfigBlocks, ConfigError};
use crate::pkginfo::{PkgInfo, PkgInfoError};

/// Errors raised while reading or writing an index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The index text is not valid control data.
    #[error("control data error: {0}")]
    Config(#[from] ConfigError),

    /// A package block is incomplete.
    #[error("package metadata error: {0}")]
    PkgInfo(#[from] PkgInfoError),
}

/// An in-memory list of package records.
#[derive(Debug, Default)]
pub struct PackageIndex {
    packages: Vec<PkgInfo>,
}

impl PackageIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an index document, appending to this index.
    pub fn load_data(&mut self, data: &str) -> Result<(), IndexError> {
        let mut cfg = ConfigBlocks::from_data(data)?;
        cfg.reset();
        loop {
            if cfg.get_value("Name").is_some() {
                let mut info = PkgInfo::new();
                info.load_from_block(&cfg)?;
                self.add_package(info);
            }
            if !cfg.next_block() {
                break;
            }
        }
        Ok(())
    }

    /// Load an index file; `.gz` files are decompressed transparently.
    pub fn load_file(&mut self, path: &Path) -> Result<(), IndexError> {
        let raw = std::fs::read(path)?;
        let text = if path.extension().is_some_and(|e| e == "gz") {
            let mut out = String::new();
            GzDecoder::new(raw.as_slice()).read_to_string(&mut out)?;
            out
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        self.load_data(&text)
    }

    /// Add a package record. The first record for an id wins; later
    /// duplicates are dropped.
    pub fn add_package(&mut self, info: PkgInfo) {
        if self.get(&info.id()).is_none() {
            self.packages.push(info);
        }
    }

    /// All records, in insertion order.
    #[must_use]
    pub fn packages(&self) -> &[PkgInfo] {
        &self.packages
    }

    /// Look up a record by package id.
    #[must_use]
    pub fn get(&self, pkgid: &str) -> Option<&PkgInfo> {
        self.packages.iter().find(|p| p.id() == pkgid)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the index has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Serialize the index as a control document.
    #[must_use]
    pub fn emit(&self) -> String {
        let mut cfg = ConfigBlocks::new();
        cfg.set_value("Format-Version", "1.0");
        for info in &self.packages {
            cfg.new_block();
            info.store_in_block(&mut cfg);
        }
        cfg.emit()
    }

    /// Write the index as plain text.
    pub fn save_to_file(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.emit())?;
        Ok(())
    }
}
