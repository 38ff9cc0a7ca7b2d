//! Bundle archive handling.
//!
//! An IPK bundle is a gzip'd tar container with a fixed member layout:
//!
//! ```text
//! control            package metadata (control-block format)
//! metainfo.xml       optional AppStream metadata, treated as opaque bytes
//! payload.tar.gz     the payload tree mounted at the prefix
//! repo/index         index of embedded dependency bundles (optional)
//! repo/<pkg>.ipk     embedded dependency bundles
//! _signature         signature over `<sha256>\t<member>` lines
//! ```
//!
//! [`PackageArchive`] opens a bundle, exposes its metadata and embedded
//! packages, verifies its signature and installs its payload.
//! [`IpkBuilder`] is the writing side used by the build tooling and the
//! test suite.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

use crate::cache::{CacheError, PackageCache};
use crate::config::{ConfigBlocks, ConfigError};
use crate::exporter::{Exporter, ExporterError};
use crate::keyring::{self, Keyring, KeyringError, TrustLevel};
use crate::pkginfo::{PkgInfo, PkgInfoError};

const MEMBER_CONTROL: &str = "control";
const MEMBER_PAYLOAD: &str = "payload.tar.gz";
const MEMBER_METAINFO: &str = "metainfo.xml";
const MEMBER_REPO_INDEX: &str = "repo/index";
const MEMBER_SIGNATURE: &str = "_signature";

/// Errors raised while handling bundle archives.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata inside the archive could not be parsed.
    #[error("control data error: {0}")]
    Config(#[from] ConfigError),

    /// Package metadata is incomplete.
    #[error("package metadata error: {0}")]
    PkgInfo(#[from] PkgInfoError),

    /// A required archive member is absent.
    #[error("archive member missing: {0}")]
    MissingMember(String),

    /// Signature or checksum verification failed.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The signing key is below the required trust level.
    #[error("package signed with untrusted key {fingerprint} (trust: {trust})")]
    Untrusted {
        /// Fingerprint of the signing key.
        fingerprint: String,
        /// Trust level the keyring assigned to it.
        trust: TrustLevel,
    },

    /// Signature processing failed structurally.
    #[error(transparent)]
    Keyring(#[from] KeyringError),

    /// Fetching a remote package failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Exporting payload files failed.
    #[error(transparent)]
    Exporter(#[from] ExporterError),

    /// The requested embedded package is not present.
    #[error("no embedded package with id {0}")]
    EmbeddedNotFound(String),
}

#[derive(Debug, Clone)]
struct EmbeddedEntry {
    info: PkgInfo,
    member: String,
}

/// An opened bundle archive on disk.
#[derive(Debug)]
pub struct PackageArchive {
    path: PathBuf,
    info: PkgInfo,
    control_data: String,
    embedded: OnceLock<Vec<EmbeddedEntry>>,
    auto_verify: AtomicBool,
    // Keeps downloaded or extracted archives alive for our own lifetime.
    _tmp: Option<tempfile::TempDir>,
}

impl PackageArchive {
    /// Open a local bundle file.
    pub fn open_file(path: &Path) -> Result<Self, ArchiveError> {
        Self::open_with_tmp(path.to_path_buf(), None)
    }

    /// Open a bundle from a repository by package id.
    ///
    /// The file is fetched through the cache; since the repository index
    /// and the download are already hash-verified, the archive's own
    /// signature check is disabled.
    pub async fn open_remote(cache: &PackageCache, pkgid: &str) -> Result<Self, ArchiveError> {
        let fname = cache.fetch(pkgid).await?;
        let archive = Self::open_with_tmp(fname, None)?;
        archive.set_auto_verify(false);
        Ok(archive)
    }

    fn open_with_tmp(
        path: PathBuf,
        tmp: Option<tempfile::TempDir>,
    ) -> Result<Self, ArchiveError> {
        let control_data = {
            let raw = read_member(&path, MEMBER_CONTROL)?
                .ok_or_else(|| ArchiveError::MissingMember(MEMBER_CONTROL.to_string()))?;
            String::from_utf8_lossy(&raw).into_owned()
        };
        let info = PkgInfo::from_control_data(&control_data)?;

        Ok(Self {
            path,
            info,
            control_data,
            embedded: OnceLock::new(),
            auto_verify: AtomicBool::new(true),
            _tmp: tmp,
        })
    }

    /// Metadata of the packaged software.
    #[must_use]
    pub fn info(&self) -> &PkgInfo {
        &self.info
    }

    /// Canonical id of the packaged software.
    #[must_use]
    pub fn id(&self) -> String {
        self.info.id()
    }

    /// Path of the archive file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `install` verifies the signature first.
    #[must_use]
    pub fn auto_verify(&self) -> bool {
        self.auto_verify.load(Ordering::Relaxed)
    }

    /// Enable or disable signature verification during install.
    pub fn set_auto_verify(&self, enabled: bool) {
        self.auto_verify.store(enabled, Ordering::Relaxed);
    }

    /// Metadata of the dependency bundles embedded in this archive.
    pub fn embedded_packages(&self) -> Result<Vec<PkgInfo>, ArchiveError> {
        Ok(self
            .embedded_entries()?
            .iter()
            .map(|e| e.info.clone())
            .collect())
    }

    fn embedded_entries(&self) -> Result<&[EmbeddedEntry], ArchiveError> {
        if let Some(entries) = self.embedded.get() {
            return Ok(entries);
        }

        let mut entries = Vec::new();
        if let Some(raw) = read_member(&self.path, MEMBER_REPO_INDEX)? {
            let mut cfg = ConfigBlocks::from_data(&String::from_utf8_lossy(&raw))?;
            cfg.reset();
            loop {
                if cfg.get_value("Name").is_some() {
                    let mut info = PkgInfo::new();
                    info.load_from_block(&cfg)?;
                    let member = cfg
                        .get_value("File")
                        .map_or_else(
                            || format!("repo/{}-{}.ipk", info.name, info.version),
                            str::to_string,
                        );
                    entries.push(EmbeddedEntry { info, member });
                }
                if !cfg.next_block() {
                    break;
                }
            }
        }
        Ok(self.embedded.get_or_init(|| entries))
    }

    /// Extract an embedded bundle to a private location and open it.
    pub fn extract_embedded_package(
        &self,
        epki: &PkgInfo,
    ) -> Result<PackageArchive, ArchiveError> {
        let wanted = epki.id();
        let member = self
            .embedded_entries()?
            .iter()
            .find(|e| e.info.id() == wanted)
            .map(|e| e.member.clone())
            .ok_or_else(|| ArchiveError::EmbeddedNotFound(wanted.clone()))?;

        let raw = read_member(&self.path, &member)?
            .ok_or_else(|| ArchiveError::MissingMember(member.clone()))?;

        let tmp = tempfile::Builder::new().prefix("limba-embedded-").tempdir()?;
        let fname = tmp
            .path()
            .join(Path::new(&member).file_name().unwrap_or_default());
        std::fs::write(&fname, raw)?;
        tracing::debug!("extracted embedded package {wanted} from {}", self.id());

        Self::open_with_tmp(fname, Some(tmp))
    }

    /// Verify the archive signature and per-member checksums.
    ///
    /// Returns the trust level of the signing key. Checksum mismatches and
    /// members missing from the signed manifest are verification errors.
    pub fn verify_signature(&self, keyring: &Keyring) -> Result<TrustLevel, ArchiveError> {
        let raw = read_member(&self.path, MEMBER_SIGNATURE)?
            .ok_or_else(|| ArchiveError::Verification("package is not signed".to_string()))?;
        let check = keyring.process_signature(&String::from_utf8_lossy(&raw))?;

        for (name, hash) in member_checksums(&self.path)? {
            if name == MEMBER_SIGNATURE {
                continue;
            }
            match check.expected_hash(&name) {
                Some(expected) if expected == hash => {}
                Some(_) => {
                    return Err(ArchiveError::Verification(format!(
                        "checksum mismatch on member {name}"
                    )));
                }
                None => {
                    return Err(ArchiveError::Verification(format!(
                        "member {name} is not covered by the signature"
                    )));
                }
            }
        }

        Ok(check.trust)
    }

    /// Install the bundle into `software_root`.
    ///
    /// `info` is the (possibly flag-amended) metadata to persist. Verifies
    /// the signature unless auto-verify was disabled, unpacks the payload
    /// into `data/`, writes `control` and the `exported` index.
    pub fn install(
        &self,
        info: &PkgInfo,
        software_root: &Path,
        keyring: &Keyring,
        export_root: &Path,
    ) -> Result<(), ArchiveError> {
        if self.auto_verify() {
            let trust = self.verify_signature(keyring)?;
            if trust < TrustLevel::Medium {
                let raw = read_member(&self.path, MEMBER_SIGNATURE)?.unwrap_or_default();
                let fingerprint = keyring
                    .process_signature(&String::from_utf8_lossy(&raw))
                    .map(|c| c.fingerprint)
                    .unwrap_or_default();
                return Err(ArchiveError::Untrusted { fingerprint, trust });
            }
        }

        let dest = software_root.join(&info.name).join(&info.version);
        std::fs::create_dir_all(&dest)?;
        set_dir_mode(&dest, 0o755)?;

        // Unpack the payload tree.
        let data_dir = dest.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let payload = read_member(&self.path, MEMBER_PAYLOAD)?
            .ok_or_else(|| ArchiveError::MissingMember(MEMBER_PAYLOAD.to_string()))?;
        let mut tar = tar::Archive::new(GzDecoder::new(Cursor::new(payload)));
        tar.set_preserve_permissions(true);
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.unpack_in(&data_dir)? {
                return Err(ArchiveError::Verification(format!(
                    "payload entry escapes the target directory: {}",
                    entry.path()?.display()
                )));
            }
        }

        // Export files the package marked for the host prefix.
        let cfg = ConfigBlocks::from_data(&self.control_data)?;
        let mut exporter = Exporter::with_root(&info.id(), export_root.to_path_buf());
        if let Some(exports) = cfg.get_value("Exports") {
            for rel in exports.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                exporter.process_file(rel, &data_dir.join(rel))?;
            }
        }
        std::fs::write(dest.join("exported"), exporter.exported_index())?;

        info.save_to_file(&dest.join(MEMBER_CONTROL))?;
        tracing::debug!("installed package {}", info.id());
        Ok(())
    }
}

fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn normalize_member(path: &Path) -> String {
    let s = path.to_string_lossy();
    s.strip_prefix("./").unwrap_or(&s).to_string()
}

fn read_member(archive: &Path, member: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if normalize_member(&entry.path()?) == member {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

fn member_checksums(archive: &Path) -> Result<Vec<(String, String)>, ArchiveError> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut sums = Vec::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = normalize_member(&entry.path()?);
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        sums.push((name, keyring::checksum_for_data(&buf)));
    }
    Ok(sums)
}

/// Writer side of the IPK format, used by the build tooling and tests.
#[derive(Debug)]
pub struct IpkBuilder {
    info: PkgInfo,
    exports: Vec<String>,
    payload: Vec<(String, Vec<u8>, u32)>,
    embedded: Vec<(PkgInfo, Vec<u8>)>,
    signing_key: Option<ed25519_dalek::SigningKey>,
}

impl IpkBuilder {
    /// Start a bundle for the given package metadata.
    #[must_use]
    pub fn new(info: PkgInfo) -> Self {
        Self {
            info,
            exports: Vec::new(),
            payload: Vec::new(),
            embedded: Vec::new(),
            signing_key: None,
        }
    }

    /// Add a file to the payload tree.
    #[must_use]
    pub fn payload_file(mut self, relative: &str, data: &[u8], mode: u32) -> Self {
        self.payload.push((relative.to_string(), data.to_vec(), mode));
        self
    }

    /// Mark a payload path for export into the host prefix.
    #[must_use]
    pub fn export(mut self, relative: &str) -> Self {
        self.exports.push(relative.to_string());
        self
    }

    /// Embed a dependency bundle (pre-built IPK bytes).
    #[must_use]
    pub fn embed(mut self, info: PkgInfo, ipk_bytes: Vec<u8>) -> Self {
        self.embedded.push((info, ipk_bytes));
        self
    }

    /// Sign the bundle with `key`.
    #[must_use]
    pub fn signed_with(mut self, key: ed25519_dalek::SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Serialize the bundle to bytes.
    pub fn build(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut members: Vec<(String, Vec<u8>)> = Vec::new();

        let mut cfg = ConfigBlocks::from_data(&self.info.to_control_data())?;
        if !self.exports.is_empty() {
            cfg.set_value("Exports", &self.exports.join(", "));
        }
        members.push((MEMBER_CONTROL.to_string(), cfg.emit().into_bytes()));
        members.push((MEMBER_PAYLOAD.to_string(), self.build_payload()?));

        if !self.embedded.is_empty() {
            let mut index = ConfigBlocks::new();
            index.set_value("Format-Version", "1.0");
            for (einfo, _) in &self.embedded {
                index.new_block();
                einfo.store_in_block(&mut index);
                index.set_value("File", &format!("repo/{}-{}.ipk", einfo.name, einfo.version));
            }
            members.push((MEMBER_REPO_INDEX.to_string(), index.emit().into_bytes()));
            for (einfo, bytes) in &self.embedded {
                members.push((
                    format!("repo/{}-{}.ipk", einfo.name, einfo.version),
                    bytes.clone(),
                ));
            }
        }

        if let Some(key) = &self.signing_key {
            let mut manifest = String::new();
            for (name, data) in &members {
                manifest.push_str(&keyring::checksum_for_data(data));
                manifest.push('\t');
                manifest.push_str(name);
                manifest.push('\n');
            }
            let doc = keyring::sign_document(key, &manifest);
            members.push((MEMBER_SIGNATURE.to_string(), doc.into_bytes()));
        }

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in &members {
            append_file(&mut builder, name, data, 0o644)?;
        }
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Write the bundle to a file.
    pub fn write_to(&self, path: &Path) -> Result<(), ArchiveError> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }

    fn build_payload(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (rel, data, mode) in &self.payload {
            append_file(&mut builder, rel, data, *mode)?;
        }
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkginfo::PackageFlags;
    use ed25519_dalek::SigningKey;
    use tempfile::tempdir;

    fn info(name: &str, version: &str) -> PkgInfo {
        let mut info = PkgInfo::new();
        info.name = name.to_string();
        info.version = version.to_string();
        info
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn keyring() -> Keyring {
        Keyring::from_keys(vec![(signing_key().verifying_key(), TrustLevel::High)])
    }

    fn simple_ipk(name: &str, version: &str) -> Vec<u8> {
        IpkBuilder::new(info(name, version))
            .payload_file(&format!("bin/{name}"), b"#!/bin/sh\n", 0o755)
            .signed_with(signing_key())
            .build()
            .unwrap()
    }

    #[test]
    fn test_open_and_metadata() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("hello-1.0.ipk");
        std::fs::write(&fname, simple_ipk("hello", "1.0")).unwrap();

        let pkg = PackageArchive::open_file(&fname).unwrap();
        assert_eq!(pkg.id(), "hello/1.0");
        assert!(pkg.embedded_packages().unwrap().is_empty());
    }

    #[test]
    fn test_verify_signature() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("hello-1.0.ipk");
        std::fs::write(&fname, simple_ipk("hello", "1.0")).unwrap();

        let pkg = PackageArchive::open_file(&fname).unwrap();
        assert_eq!(pkg.verify_signature(&keyring()).unwrap(), TrustLevel::High);

        // An unknown key is structurally fine but earns no trust.
        let strange = Keyring::from_keys(vec![]);
        assert_eq!(pkg.verify_signature(&strange).unwrap(), TrustLevel::None);
    }

    #[test]
    fn test_unsigned_archive_fails_verification() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("bare.ipk");
        IpkBuilder::new(info("bare", "0.1"))
            .payload_file("bin/bare", b"x", 0o755)
            .write_to(&fname)
            .unwrap();

        let pkg = PackageArchive::open_file(&fname).unwrap();
        assert!(matches!(
            pkg.verify_signature(&keyring()),
            Err(ArchiveError::Verification(_))
        ));
    }

    #[test]
    fn test_embedded_roundtrip() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("hello-1.0.ipk");
        let mut dep = info("libgreet", "1.0");
        dep.dependencies = String::new();
        IpkBuilder::new(info("hello", "1.0"))
            .payload_file("bin/hello", b"#!/bin/sh\n", 0o755)
            .embed(dep.clone(), simple_ipk("libgreet", "1.0"))
            .signed_with(signing_key())
            .write_to(&fname)
            .unwrap();

        let pkg = PackageArchive::open_file(&fname).unwrap();
        let embedded = pkg.embedded_packages().unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].id(), "libgreet/1.0");

        let extracted = pkg.extract_embedded_package(&embedded[0]).unwrap();
        assert_eq!(extracted.id(), "libgreet/1.0");
    }

    #[test]
    fn test_install_writes_layout() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("hello-1.0.ipk");
        let mut pki = info("hello", "1.0");
        pki.flags.insert(PackageFlags::APPLICATION);
        IpkBuilder::new(pki.clone())
            .payload_file("bin/hello", b"#!/bin/sh\necho hi\n", 0o755)
            .export("bin/hello")
            .signed_with(signing_key())
            .write_to(&fname)
            .unwrap();

        let root = dir.path().join("root");
        let export = dir.path().join("export");
        let pkg = PackageArchive::open_file(&fname).unwrap();
        pkg.install(&pki, &root, &keyring(), &export).unwrap();

        assert!(root.join("hello/1.0/control").is_file());
        assert!(root.join("hello/1.0/data/bin/hello").is_file());
        let exported = std::fs::read_to_string(root.join("hello/1.0/exported")).unwrap();
        assert!(exported.starts_with("bin/hello\t"));
        assert!(export.join("bin/hello").symlink_metadata().is_ok());
    }

    #[test]
    fn test_install_rejects_untrusted() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("evil.ipk");
        let pki = info("evil", "0.1");
        IpkBuilder::new(pki.clone())
            .payload_file("bin/evil", b"x", 0o755)
            .signed_with(SigningKey::from_bytes(&[9u8; 32]))
            .write_to(&fname)
            .unwrap();

        let pkg = PackageArchive::open_file(&fname).unwrap();
        let err = pkg
            .install(&pki, &dir.path().join("root"), &keyring(), &dir.path().join("export"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Untrusted { .. }));

        // Disabling auto-verify skips the gate entirely.
        pkg.set_auto_verify(false);
        pkg.install(&pki, &dir.path().join("root"), &keyring(), &dir.path().join("export"))
            .unwrap();
    }
}
