//! End-to-end installation scenarios against temporary roots.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use limba_core::Reporter;
use limba_core::archive::IpkBuilder;
use limba_core::cache::PackageCache;
use limba_core::graph::PackageStage;
use limba_core::installer::Installer;
use limba_core::keyring::{Keyring, TrustLevel};
use limba_core::pkginfo::{PackageFlags, PkgInfo};
use limba_core::runtime::Runtime;

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[1u8; 32])
}

fn keyring() -> Keyring {
    Keyring::from_keys(vec![(signing_key().verifying_key(), TrustLevel::High)])
}

fn pkg(name: &str, version: &str, requires: &str) -> PkgInfo {
    let mut info = PkgInfo::new();
    info.name = name.to_string();
    info.version = version.to_string();
    info.dependencies = requires.to_string();
    info
}

fn app(name: &str, version: &str, requires: &str) -> PkgInfo {
    let mut info = pkg(name, version, requires);
    info.flags.insert(PackageFlags::APPLICATION);
    info
}

fn library_ipk(info: &PkgInfo) -> Vec<u8> {
    IpkBuilder::new(info.clone())
        .payload_file(&format!("lib/{}.so", info.name), b"\x7fELF", 0o644)
        .signed_with(signing_key())
        .build()
        .unwrap()
}

/// Records stage-changed events for ordering assertions.
#[derive(Default)]
struct RecordingReporter {
    stages: Mutex<Vec<(String, PackageStage)>>,
}

impl Reporter for RecordingReporter {
    fn stage_changed(&self, id: &str, stage: PackageStage) {
        self.stages
            .lock()
            .unwrap()
            .push((id.to_string(), stage));
    }
}

struct Fixture {
    dir: TempDir,
    reporter: Arc<RecordingReporter>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            reporter: Arc::new(RecordingReporter::default()),
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    fn installer(&self) -> Installer {
        let cache = PackageCache::with_config(
            self.dir.path().join("cache"),
            self.dir.path().join("app-info"),
            Vec::new(),
            keyring(),
            self.reporter.clone(),
        )
        .unwrap();
        Installer::with_roots(
            self.root(),
            cache,
            keyring(),
            self.dir.path().join("export"),
            self.reporter.clone(),
        )
    }

    fn write_ipk(&self, fname: &str, builder: IpkBuilder) -> PathBuf {
        let path = self.dir.path().join(fname);
        builder.write_to(&path).unwrap();
        path
    }

    fn runtime_uuids(&self) -> Vec<String> {
        let rt_dir = self.root().join("runtimes");
        if !rt_dir.is_dir() {
            return Vec::new();
        }
        let mut uuids: Vec<String> = std::fs::read_dir(rt_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "ofs_work")
            .collect();
        uuids.sort();
        uuids
    }

    fn install_order(&self) -> Vec<String> {
        self.reporter
            .stages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, stage)| *stage == PackageStage::Installing)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn hello_with_embedded_libgreet(fixture: &Fixture) -> PathBuf {
    let libgreet = pkg("libgreet", "1.0", "");
    fixture.write_ipk(
        "hello-1.0.ipk",
        IpkBuilder::new(app("hello", "1.0", "libgreet (>= 1.0)"))
            .payload_file("bin/hello", b"#!/bin/sh\necho hello\n", 0o755)
            .embed(libgreet.clone(), library_ipk(&libgreet))
            .signed_with(signing_key()),
    )
}

#[tokio::test]
async fn test_install_from_file_with_embedded_dependency() {
    let fixture = Fixture::new();
    let ipk = hello_with_embedded_libgreet(&fixture);

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    let root = fixture.root();
    assert!(root.join("hello/1.0/control").is_file());
    assert!(root.join("hello/1.0/data/bin/hello").is_file());
    assert!(root.join("libgreet/1.0/control").is_file());
    assert!(root.join("libgreet/1.0/data/lib/libgreet.so").is_file());

    // Exactly one runtime, referenced from hello's control file.
    let uuids = fixture.runtime_uuids();
    assert_eq!(uuids.len(), 1);
    let hello = PkgInfo::load_file(&root.join("hello/1.0/control")).unwrap();
    assert_eq!(hello.runtime_uuid, uuids[0]);

    let rt = Runtime::load_by_uuid(&root, &uuids[0]).unwrap();
    assert!(rt.contains_all(&["libgreet/1.0".to_string()]));
    assert_eq!(rt.members().len(), 1);

    // The dependency was not requested by the user.
    let libgreet = PkgInfo::load_file(&root.join("libgreet/1.0/control")).unwrap();
    assert!(libgreet.has_flag(PackageFlags::AUTOMATIC));
    assert!(!hello.has_flag(PackageFlags::AUTOMATIC));
}

#[tokio::test]
async fn test_runtime_reuse() {
    let fixture = Fixture::new();
    let ipk = hello_with_embedded_libgreet(&fixture);

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    // Installing the same application again reuses the runtime.
    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();
    assert_eq!(fixture.runtime_uuids().len(), 1);

    // A second application with the same dependency set shares it too.
    let other = fixture.write_ipk(
        "hi-1.0.ipk",
        IpkBuilder::new(app("hi", "1.0", "libgreet (>= 1.0)"))
            .payload_file("bin/hi", b"#!/bin/sh\necho hi\n", 0o755)
            .signed_with(signing_key()),
    );
    let mut installer = fixture.installer();
    installer.open_file(&other).unwrap();
    installer.install().await.unwrap();

    let uuids = fixture.runtime_uuids();
    assert_eq!(uuids.len(), 1);
    let hi = PkgInfo::load_file(&fixture.root().join("hi/1.0/control")).unwrap();
    assert_eq!(hi.runtime_uuid, uuids[0]);
}

#[tokio::test]
async fn test_missing_dependency_leaves_no_trace() {
    let fixture = Fixture::new();
    let ipk = fixture.write_ipk(
        "broken-1.0.ipk",
        IpkBuilder::new(app("broken", "1.0", "nonesuch"))
            .payload_file("bin/broken", b"x", 0o755)
            .signed_with(signing_key()),
    );

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    let err = installer.install().await.unwrap_err();

    assert_eq!(err.tag(), "dependency-not-found");
    assert!(err.to_string().contains("nonesuch"));
    assert!(!fixture.root().join("broken").exists());
    assert!(fixture.runtime_uuids().is_empty());
}

#[tokio::test]
async fn test_installed_package_beats_embedded_copy() {
    let fixture = Fixture::new();

    // Pre-install libgreet 2.0 directly.
    let newer = pkg("libgreet", "2.0", "");
    let newer_ipk = fixture.write_ipk(
        "libgreet-2.0.ipk",
        IpkBuilder::new(newer.clone())
            .payload_file("lib/libgreet.so", b"\x7fELF", 0o644)
            .signed_with(signing_key()),
    );
    let mut installer = fixture.installer();
    installer.open_file(&newer_ipk).unwrap();
    installer.install().await.unwrap();

    // hello embeds 1.0, but the installed 2.0 satisfies the requirement.
    let ipk = hello_with_embedded_libgreet(&fixture);
    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    let root = fixture.root();
    assert!(!root.join("libgreet/1.0").exists());
    let hello = PkgInfo::load_file(&root.join("hello/1.0/control")).unwrap();
    let rt = Runtime::load_by_uuid(&root, &hello.runtime_uuid).unwrap();
    assert!(rt.contains_all(&["libgreet/2.0".to_string()]));
}

#[tokio::test]
async fn test_extra_packages_beat_remote() {
    let fixture = Fixture::new();

    // The merged index claims libgreet is available at an unreachable
    // location; choosing the remote source would fail the transaction.
    let cache_root = fixture.dir.path().join("cache");
    std::fs::create_dir_all(&cache_root).unwrap();
    std::fs::write(
        cache_root.join("available.index"),
        "Format-Version: 1.0\n\nName: libgreet\nVersion: 1.0\nLocation: http://127.0.0.1:9/pool/libgreet-1.0.ipk\n",
    )
    .unwrap();

    let libgreet = pkg("libgreet", "1.0", "");
    let extra = fixture.write_ipk(
        "libgreet-1.0.ipk",
        IpkBuilder::new(libgreet.clone())
            .payload_file("lib/libgreet.so", b"\x7fELF", 0o644)
            .signed_with(signing_key()),
    );
    let ipk = fixture.write_ipk(
        "hello-1.0.ipk",
        IpkBuilder::new(app("hello", "1.0", "libgreet"))
            .payload_file("bin/hello", b"x", 0o755)
            .signed_with(signing_key()),
    );

    let mut installer = fixture.installer();
    installer.open_extra_packages(&[extra]).unwrap();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    assert!(fixture.root().join("libgreet/1.0/control").is_file());
}

#[tokio::test]
async fn test_post_order_and_ancestor_embedded_lookup() {
    let fixture = Fixture::new();

    // hello -> liba -> libb; both libraries travel embedded in hello, so
    // libb must be found by walking up from liba to its parent bundle.
    let libb = pkg("libb", "1.0", "");
    let liba = pkg("liba", "1.0", "libb");
    let ipk = fixture.write_ipk(
        "hello-1.0.ipk",
        IpkBuilder::new(app("hello", "1.0", "liba"))
            .payload_file("bin/hello", b"x", 0o755)
            .embed(liba.clone(), library_ipk(&liba))
            .embed(libb.clone(), library_ipk(&libb))
            .signed_with(signing_key()),
    );

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    assert_eq!(
        fixture.install_order(),
        vec!["libb/1.0", "liba/1.0", "hello/1.0"]
    );

    let hello = PkgInfo::load_file(&fixture.root().join("hello/1.0/control")).unwrap();
    let rt = Runtime::load_by_uuid(&fixture.root(), &hello.runtime_uuid).unwrap();
    assert!(rt.contains_all(&["liba/1.0".to_string(), "libb/1.0".to_string()]));
}

#[tokio::test]
async fn test_non_application_gets_no_runtime() {
    let fixture = Fixture::new();
    let ipk = fixture.write_ipk(
        "libgreet-1.0.ipk",
        IpkBuilder::new(pkg("libgreet", "1.0", ""))
            .payload_file("lib/libgreet.so", b"\x7fELF", 0o644)
            .signed_with(signing_key()),
    );

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    assert!(fixture.runtime_uuids().is_empty());
    let info = PkgInfo::load_file(&fixture.root().join("libgreet/1.0/control")).unwrap();
    assert_eq!(info.runtime_uuid, "None");
}

#[tokio::test]
async fn test_untrusted_bundle_is_rejected() {
    let fixture = Fixture::new();
    let stranger = SigningKey::from_bytes(&[99u8; 32]);
    let ipk = fixture.write_ipk(
        "evil-1.0.ipk",
        IpkBuilder::new(app("evil", "1.0", ""))
            .payload_file("bin/evil", b"x", 0o755)
            .signed_with(stranger),
    );

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    assert_eq!(
        installer.package_trust_level().unwrap(),
        TrustLevel::None
    );
    let err = installer.install().await.unwrap_err();
    assert_eq!(err.tag(), "failed");
    assert!(!fixture.root().join("evil").exists());

    // The explicit escape hatch still works.
    let mut installer = fixture.installer();
    installer.set_allow_insecure(true);
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();
    assert!(fixture.root().join("evil/1.0/control").is_file());
}

#[tokio::test]
async fn test_install_from_remote_repository() {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use limba_core::index::PackageIndex;
    use limba_core::keyring::checksum_for_data;
    use std::io::Write as _;

    let fixture = Fixture::new();

    let hello_ipk = IpkBuilder::new(app("hello", "1.0", "libgreet (>= 1.0)"))
        .payload_file("bin/hello", b"#!/bin/sh\necho hello\n", 0o755)
        .signed_with(signing_key())
        .build()
        .unwrap();
    let libgreet_ipk = library_ipk(&pkg("libgreet", "1.0", ""));

    // Publish both packages through a repository index.
    let mut index = PackageIndex::new();
    let mut hello = app("hello", "1.0", "libgreet (>= 1.0)");
    hello.repo_location = "pool/hello-1.0.ipk".to_string();
    hello.checksum_sha256 = checksum_for_data(&hello_ipk);
    index.add_package(hello);
    let mut libgreet = pkg("libgreet", "1.0", "");
    libgreet.repo_location = "pool/libgreet-1.0.ipk".to_string();
    libgreet.checksum_sha256 = checksum_for_data(&libgreet_ipk);
    index.add_package(libgreet);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(index.emit().as_bytes()).unwrap();
    let index_gz = encoder.finish().unwrap();
    let manifest = format!("{}\tindices/all/Index.gz\n", checksum_for_data(&index_gz));
    let signature = limba_core::keyring::sign_document(&signing_key(), &manifest);

    let mut server = mockito::Server::new_async().await;
    let mut mocks = vec![
        server
            .mock("GET", "/indices/all/Index.gz")
            .with_body(index_gz)
            .create_async()
            .await,
        server
            .mock("GET", "/indices/Indices.gpg")
            .with_body(signature)
            .create_async()
            .await,
        server
            .mock("GET", "/pool/hello-1.0.ipk")
            .with_body(hello_ipk)
            .create_async()
            .await,
        server
            .mock("GET", "/pool/libgreet-1.0.ipk")
            .with_body(libgreet_ipk)
            .create_async()
            .await,
    ];
    for rel in [
        format!("/indices/{}/Index.gz", std::env::consts::ARCH),
        "/indices/all/Metadata.xml.gz".to_string(),
        format!("/indices/{}/Metadata.xml.gz", std::env::consts::ARCH),
        "/indices/icons_64x64.tar.gz".to_string(),
        "/indices/icons_128x128.tar.gz".to_string(),
    ] {
        mocks.push(
            server
                .mock("GET", rel.as_str())
                .with_status(404)
                .create_async()
                .await,
        );
    }

    let cache = PackageCache::with_config(
        fixture.dir.path().join("cache"),
        fixture.dir.path().join("app-info"),
        vec![server.url()],
        keyring(),
        fixture.reporter.clone(),
    )
    .unwrap();
    let mut installer = Installer::with_roots(
        fixture.root(),
        cache,
        keyring(),
        fixture.dir.path().join("export"),
        fixture.reporter.clone(),
    );

    installer.update_cache().await.unwrap();
    installer.open_remote("hello/1.0").await.unwrap();
    installer.install().await.unwrap();

    let root = fixture.root();
    assert!(root.join("hello/1.0/data/bin/hello").is_file());
    assert!(root.join("libgreet/1.0/data/lib/libgreet.so").is_file());

    let hello = PkgInfo::load_file(&root.join("hello/1.0/control")).unwrap();
    let rt = Runtime::load_by_uuid(&root, &hello.runtime_uuid).unwrap();
    assert!(rt.contains_all(&["libgreet/1.0".to_string()]));
    drop(mocks);
}

// Removal must clean up what installation exported.
#[tokio::test]
async fn test_exported_files_round_trip() {
    let fixture = Fixture::new();
    let ipk = fixture.write_ipk(
        "hello-1.0.ipk",
        IpkBuilder::new(app("hello", "1.0", ""))
            .payload_file("bin/hello", b"#!/bin/sh\n", 0o755)
            .export("bin/hello")
            .signed_with(signing_key()),
    );

    let mut installer = fixture.installer();
    installer.open_file(&ipk).unwrap();
    installer.install().await.unwrap();

    let link = fixture.dir.path().join("export/bin/hello");
    assert!(link.symlink_metadata().is_ok());

    let mut manager = limba_core::manager::Manager::with_root(fixture.root());
    manager.remove_software("hello/1.0").unwrap();
    assert!(link.symlink_metadata().is_err());
    assert!(!fixture.root().join("hello").exists());
}

