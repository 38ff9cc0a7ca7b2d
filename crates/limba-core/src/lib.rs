//! Core engine for the Limba bundle manager.
//!
//! This crate provides the foundational logic for resolving, installing and
//! composing self-contained application bundles: package metadata, the
//! control-block text format, the repository cache, the dependency graph and
//! the installer driving it. It is designed to be consumed by the CLI, the
//! privileged helper daemon and the application launcher without coupling to
//! any specific front-end.

/// Bundle archive handling: open, verify, extract and install IPK files.
pub mod archive;
/// Repository cache: index updates, verification and package downloads.
pub mod cache;
/// Parser and writer for the `Field: value` control-block format.
pub mod config;
/// Exports shared library / executable artifacts into the overlay tree.
pub mod exporter;
/// Host-provided ("foundation") component catalog.
pub mod foundations;
/// Dependency graph arena used by the installer.
pub mod graph;
/// Package index files listing available packages.
pub mod index;
/// Installation transactions: resolution and execution.
pub mod installer;
/// Wire protocol and client for the privileged helper daemon.
pub mod ipc;
/// Signature verification against the trusted keyring.
pub mod keyring;
/// Installed software and runtime enumeration, removal.
pub mod manager;
/// Filesystem locations of the Limba directory layout.
pub mod paths;
/// Package metadata records and dependency expressions.
pub mod pkginfo;
/// Progress reporting trait for UI decoupling.
pub mod reporter;
/// Named sets of installed packages composed via overlay mounts.
pub mod runtime;
/// Version string comparison shared by all components.
pub mod version;

pub use reporter::{NullReporter, Reporter};

/// User Agent string for remote operations.
pub const USER_AGENT: &str = concat!("limba/", env!("CARGO_PKG_VERSION"));
