//! Repository cache.
//!
//! The cache maintains the list of configured repositories, refreshes
//! their indices, AppStream metadata and icon tarballs, verifies
//! everything against the repository signature, and fetches individual
//! packages on demand into a process-private temporary directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use md5::{Digest as _, Md5};
use tokio::io::AsyncWriteExt;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::index::PackageIndex;
use crate::keyring::{self, Keyring, TrustLevel};
use crate::paths;
use crate::pkginfo::{PackageFlags, PkgInfo};
use crate::reporter::{NullReporter, Reporter};

/// Errors raised by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Generic failure.
    #[error("{0}")]
    Failed(String),

    /// A file could not be downloaded.
    #[error("unable to download data from '{url}': {reason}")]
    DownloadFailed {
        /// The URL that failed.
        url: String,
        /// Transport-level reason.
        reason: String,
    },

    /// The remote server does not have the file (HTTP 404).
    #[error("could not find remote data '{0}'")]
    RemoteNotFound(String),

    /// No cache entry matches the requested id.
    #[error("could not find package matching id '{0}'")]
    NotFound(String),

    /// Writing to the cache failed.
    #[error("could not write to cache: {0}")]
    Write(#[from] std::io::Error),

    /// Signature or checksum validation of repository data failed.
    #[error("verification failed: {0}")]
    Verification(String),

    /// An icon tarball could not be unpacked.
    #[error("unable to unpack: {0}")]
    Unpack(String),
}

/// Downloads and indexes repository metadata and packages.
pub struct PackageCache {
    cache_root: PathBuf,
    appstream_root: PathBuf,
    repo_urls: Vec<String>,
    index: PackageIndex,
    keyring: Keyring,
    client: reqwest::Client,
    tmp_dir: tempfile::TempDir,
    arch: String,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for PackageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageCache")
            .field("cache_root", &self.cache_root)
            .field("repo_urls", &self.repo_urls)
            .field("indexed", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl PackageCache {
    /// Cache over the default roots and repository lists.
    pub fn new(reporter: Arc<dyn Reporter>) -> Result<Self, CacheError> {
        let mut repo_urls = load_repo_list(&paths::sources_list());
        repo_urls.extend(load_repo_list(&paths::auto_sources_list()));
        let keyring = Keyring::new()
            .map_err(|e| CacheError::Failed(format!("unable to load keyring: {e}")))?;
        Self::with_config(
            paths::cache_root(),
            paths::appstream_cache(),
            repo_urls,
            keyring,
            reporter,
        )
    }

    /// Cache with explicit roots and repositories (tests, tooling).
    pub fn with_config(
        cache_root: PathBuf,
        appstream_root: PathBuf,
        repo_urls: Vec<String>,
        keyring: Keyring,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, CacheError> {
        let tmp_dir = tempfile::Builder::new().prefix("limba-remote-").tempdir()?;
        Ok(Self {
            cache_root,
            appstream_root,
            repo_urls,
            index: PackageIndex::new(),
            keyring,
            client: reqwest::Client::new(),
            tmp_dir,
            arch: paths::current_arch().to_string(),
            reporter,
        })
    }

    /// Cache that reports nowhere (tooling convenience).
    pub fn silent() -> Result<Self, CacheError> {
        Self::new(Arc::new(NullReporter))
    }

    /// Configured repository URLs, in file order.
    #[must_use]
    pub fn repositories(&self) -> &[String] {
        &self.repo_urls
    }

    /// Load the merged index of available packages.
    pub fn open(&mut self) -> Result<(), CacheError> {
        self.index = PackageIndex::new();
        let fname = self.cache_root.join("available.index");
        if fname.is_file() {
            self.index
                .load_file(&fname)
                .map_err(|e| CacheError::Failed(format!("unable to load package cache: {e}")))?;
        }
        Ok(())
    }

    /// All packages known to be available.
    #[must_use]
    pub fn packages(&self) -> Vec<PkgInfo> {
        self.index
            .packages()
            .iter()
            .cloned()
            .map(|mut p| {
                p.add_flag(PackageFlags::AVAILABLE);
                p
            })
            .collect()
    }

    /// Look up one available package by id.
    #[must_use]
    pub fn pkg_info(&self, pkgid: &str) -> Option<PkgInfo> {
        self.index.get(pkgid).map(|p| {
            let mut p = p.clone();
            p.add_flag(PackageFlags::AVAILABLE);
            p
        })
    }

    /// Refresh all repository data.
    ///
    /// Walks the configured repositories in order, downloading indices,
    /// AppStream metadata and icons, verifying everything against the
    /// signed manifest. A failure aborts the whole update and leaves the
    /// previously merged index untouched.
    pub async fn update(&mut self) -> Result<(), CacheError> {
        std::fs::create_dir_all(self.appstream_root.join("xmls"))?;

        let mut global = PackageIndex::new();
        for url in self.repo_urls.clone() {
            self.update_repository(&mut global, &url).await?;
            tracing::debug!("updated cached data for repository: {url}");
        }

        global
            .save_to_file(&self.cache_root.join("available.index"))
            .map_err(|e| CacheError::Failed(format!("unable to save merged index: {e}")))?;
        Ok(())
    }

    async fn update_repository(
        &mut self,
        global: &mut PackageIndex,
        url: &str,
    ) -> Result<(), CacheError> {
        let md5sum = md5_hex(url);
        let dest = self.cache_root.join(&md5sum);
        std::fs::create_dir_all(&dest)?;

        let arch = self.arch.clone();
        let index_all_rel = "indices/all/Index.gz".to_string();
        let index_arch_rel = format!("indices/{arch}/Index.gz");
        let asdata_all_rel = "indices/all/Metadata.xml.gz".to_string();
        let asdata_arch_rel = format!("indices/{arch}/Metadata.xml.gz");

        let dest_index_all = dest.join("Index-all.gz");
        let dest_index_arch = dest.join(format!("Index-{arch}.gz"));
        let dest_asdata_all = dest.join("Metadata-all.xml.gz");
        let dest_asdata_arch = dest.join(format!("Metadata-{arch}.xml.gz"));
        let dest_signature = dest.join("Indices.gpg");

        // Indices and AppStream metadata are optional per arch; only the
        // signature must be present.
        for (rel, fname) in [
            (&index_all_rel, &dest_index_all),
            (&index_arch_rel, &dest_index_arch),
            (&asdata_all_rel, &dest_asdata_all),
            (&asdata_arch_rel, &dest_asdata_arch),
        ] {
            match self
                .download_file(&format!("{url}/{rel}"), fname, None)
                .await
            {
                Ok(()) => {}
                Err(CacheError::RemoteNotFound(_)) => {
                    tracing::debug!("skipping '{rel}' for repository: {url}");
                }
                Err(err) => return Err(err),
            }
        }
        self.download_file(&format!("{url}/indices/Indices.gpg"), &dest_signature, None)
            .await?;

        // Remember which URL this cache directory belongs to.
        std::fs::write(dest.join("repo"), url)?;

        // Check the repository signature.
        let sig_data = std::fs::read_to_string(&dest_signature)?;
        let check = self
            .keyring
            .process_signature(&sig_data)
            .map_err(|e| CacheError::Verification(e.to_string()))?;
        if check.trust < TrustLevel::Medium {
            return Err(CacheError::Verification(format!(
                "repository '{url}' (signed with key '{}') is untrusted",
                check.fingerprint
            )));
        }

        // Every downloaded file must match the signed manifest.
        for (rel, fname) in [
            (&index_all_rel, &dest_index_all),
            (&index_arch_rel, &dest_index_arch),
            (&asdata_all_rel, &dest_asdata_all),
            (&asdata_arch_rel, &dest_asdata_arch),
        ] {
            if !fname.is_file() {
                continue;
            }
            let actual = keyring::checksum_for_file(fname)?;
            if check.expected_hash(rel) != Some(actual.as_str()) {
                return Err(CacheError::Verification(format!(
                    "signature on '{url}' is invalid for {rel}"
                )));
            }
        }

        // Parse the indices into the per-repository set.
        let mut repo_index = PackageIndex::new();
        let mut index_read = false;
        for fname in [&dest_index_all, &dest_index_arch] {
            if !fname.is_file() {
                continue;
            }
            repo_index
                .load_file(fname)
                .map_err(|e| CacheError::Failed(format!("unable to load index for {url}: {e}")))?;
            index_read = true;
        }
        if !index_read {
            tracing::warn!("repository '{url}' does not seem to contain any index file");
        }

        // Publish the AppStream data for software centers.
        let as_source = if dest_asdata_arch.is_file() {
            Some(&dest_asdata_arch)
        } else if dest_asdata_all.is_file() {
            Some(&dest_asdata_all)
        } else {
            None
        };
        if let Some(source) = as_source {
            let target = self
                .appstream_root
                .join("xmls")
                .join(format!("limba_{md5sum}.xml.gz"));
            std::fs::copy(source, target)?;
        }

        self.update_icon_cache(url, &dest, &md5sum).await?;

        for pkg in repo_index.packages() {
            let mut pkg = pkg.clone();
            pkg.add_flag(PackageFlags::AVAILABLE);
            pkg.repo_location = format!("{url}/{}", pkg.repo_location);
            pkg.repository = url.to_string();
            global.add_package(pkg);
        }

        Ok(())
    }

    async fn update_icon_cache(
        &mut self,
        url: &str,
        repo_cache: &Path,
        origin: &str,
    ) -> Result<(), CacheError> {
        let tmp = repo_cache.join("icon-tmp");
        std::fs::create_dir_all(&tmp)?;

        for size in ["64x64", "128x128"] {
            let tar_dest = tmp.join(format!("icons_{size}.tar.gz"));
            match self
                .download_file(&format!("{url}/indices/icons_{size}.tar.gz"), &tar_dest, None)
                .await
            {
                Ok(()) => {}
                Err(CacheError::RemoteNotFound(_)) => {
                    tracing::debug!("skipping '{size}' icons for repository: {url}");
                    continue;
                }
                Err(err) => return Err(err),
            }

            let icons_dest = self.appstream_root.join("icons").join(origin).join(size);
            extract_icon_tarball(&tar_dest, &icons_dest)?;
        }

        std::fs::remove_dir_all(&tmp)?;
        Ok(())
    }

    /// Download a package from a repository.
    ///
    /// Emits `(percentage, pkgid)` progress events while downloading; the
    /// file lands in the cache's private temporary directory and is
    /// removed when the cache is dropped.
    pub async fn fetch(&self, pkgid: &str) -> Result<PathBuf, CacheError> {
        let Some(pki) = self.index.get(pkgid) else {
            return Err(CacheError::NotFound(pkgid.to_string()));
        };
        let location = pki.repo_location.clone();
        let dest = self
            .tmp_dir
            .path()
            .join(paths::filename_from_url(&location));

        tracing::debug!("fetching remote package from: {location}");
        self.download_file(&location, &dest, Some(pkgid)).await?;

        if !pki.checksum_sha256.is_empty() {
            let actual = keyring::checksum_for_file(&dest)?;
            if actual != pki.checksum_sha256 {
                return Err(CacheError::Verification(format!(
                    "checksum mismatch on downloaded package {pkgid}"
                )));
            }
        }

        tracing::debug!("package '{pkgid}' downloaded from remote");
        Ok(dest)
    }

    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        id: Option<&str>,
    ) -> Result<(), CacheError> {
        let result = self.download_file_inner(url, dest, id).await;
        if result.is_err() && dest.exists() {
            let _ = std::fs::remove_file(dest);
        }
        result
    }

    async fn download_file_inner(
        &self,
        url: &str,
        dest: &Path,
        id: Option<&str>,
    ) -> Result<(), CacheError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .map_err(|e| CacheError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CacheError::RemoteNotFound(url.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| CacheError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CacheError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            // Without a known total there is nothing meaningful to report.
            if total > 0 {
                let percentage = (100.0 * downloaded as f64 / total as f64).round() as u32;
                self.reporter.progress(id, percentage.min(100));
            }
        }
        file.flush().await?;
        Ok(())
    }
}

fn load_repo_list(fname: &Path) -> Vec<String> {
    // A missing list is not an error; it may simply not exist yet.
    let Ok(content) = std::fs::read_to_string(fname) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn extract_icon_tarball(tarball: &Path, dest_dir: &Path) -> Result<(), CacheError> {
    use std::io::Read;

    let file = std::fs::File::open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive
        .entries()
        .map_err(|e| CacheError::Unpack(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| CacheError::Unpack(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| CacheError::Unpack(e.to_string()))?
            .into_owned();
        if path.extension().is_none_or(|e| e != "png") {
            continue;
        }
        let Some(fname) = path.file_name() else {
            continue;
        };
        std::fs::create_dir_all(dest_dir)?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| CacheError::Unpack(e.to_string()))?;
        std::fs::write(dest_dir.join(fname), data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::sign_document;
    use ed25519_dalek::SigningKey;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    fn trusted_keyring() -> Keyring {
        Keyring::from_keys(vec![(signing_key().verifying_key(), TrustLevel::High)])
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn index_with_package(pool_file: &str, sha256: &str) -> String {
        let mut index = PackageIndex::new();
        let mut info = PkgInfo::new();
        info.name = "hello".to_string();
        info.version = "1.0".to_string();
        info.repo_location = format!("pool/{pool_file}");
        info.checksum_sha256 = sha256.to_string();
        index.add_package(info);
        index.emit()
    }

    struct RepoFixture {
        server: mockito::ServerGuard,
        _mocks: Vec<mockito::Mock>,
    }

    async fn serve_repository(index_gz: Vec<u8>, signature: String, pool: Option<Vec<u8>>) -> RepoFixture {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();

        mocks.push(
            server
                .mock("GET", "/indices/all/Index.gz")
                .with_body(index_gz)
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("GET", "/indices/Indices.gpg")
                .with_body(signature)
                .create_async()
                .await,
        );
        // Everything else is absent from this repository.
        for rel in [
            format!("/indices/{}/Index.gz", paths::current_arch()),
            "/indices/all/Metadata.xml.gz".to_string(),
            format!("/indices/{}/Metadata.xml.gz", paths::current_arch()),
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
        if let Some(body) = pool {
            mocks.push(
                server
                    .mock("GET", "/pool/hello-1.0.ipk")
                    .with_body(body)
                    .create_async()
                    .await,
            );
        }
        RepoFixture { server, _mocks: mocks }
    }

    fn cache_for(server_url: &str, dir: &Path) -> PackageCache {
        PackageCache::with_config(
            dir.join("cache"),
            dir.join("app-info"),
            vec![server_url.to_string()],
            trusted_keyring(),
            Arc::new(NullReporter),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_and_fetch() {
        let dir = tempdir().unwrap();
        let pool_bytes = b"fake package bytes".to_vec();
        let pool_sha = keyring::checksum_for_data(&pool_bytes);

        let index_gz = gzip(index_with_package("hello-1.0.ipk", &pool_sha).as_bytes());
        let manifest = format!(
            "{}\tindices/all/Index.gz\n",
            keyring::checksum_for_data(&index_gz)
        );
        let signature = sign_document(&signing_key(), &manifest);
        let fixture = serve_repository(index_gz, signature, Some(pool_bytes)).await;

        let mut cache = cache_for(&fixture.server.url(), dir.path());
        cache.update().await.unwrap();

        cache.open().unwrap();
        let pkg = cache.pkg_info("hello/1.0").unwrap();
        assert!(pkg.has_flag(PackageFlags::AVAILABLE));
        assert_eq!(
            pkg.repo_location,
            format!("{}/pool/hello-1.0.ipk", fixture.server.url())
        );

        let fetched = cache.fetch("hello/1.0").await.unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"fake package bytes");
    }

    #[tokio::test]
    async fn test_update_unknown_key_is_verification_error() {
        let dir = tempdir().unwrap();
        let index_gz = gzip(index_with_package("hello-1.0.ipk", "").as_bytes());
        let manifest = format!(
            "{}\tindices/all/Index.gz\n",
            keyring::checksum_for_data(&index_gz)
        );
        // Signed by a key the keyring does not know.
        let signature = sign_document(&SigningKey::from_bytes(&[9u8; 32]), &manifest);
        let fixture = serve_repository(index_gz, signature, None).await;

        let mut cache = cache_for(&fixture.server.url(), dir.path());

        // Pre-existing merged index must survive the failed update.
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(
            dir.path().join("cache/available.index"),
            "Format-Version: 1.0\n\nName: old\nVersion: 0.9\n",
        )
        .unwrap();

        let err = cache.update().await.unwrap_err();
        assert!(matches!(err, CacheError::Verification(_)));

        cache.open().unwrap();
        assert!(cache.pkg_info("old/0.9").is_some());
    }

    #[tokio::test]
    async fn test_update_tampered_index_is_verification_error() {
        let dir = tempdir().unwrap();
        let index_gz = gzip(index_with_package("hello-1.0.ipk", "").as_bytes());
        // Manifest signs a different index content.
        let manifest = "0000000000000000\tindices/all/Index.gz\n".to_string();
        let signature = sign_document(&signing_key(), &manifest);
        let fixture = serve_repository(index_gz, signature, None).await;

        let mut cache = cache_for(&fixture.server.url(), dir.path());
        let err = cache.update().await.unwrap_err();
        assert!(matches!(err, CacheError::Verification(_)));
    }

    #[tokio::test]
    async fn test_fetch_unknown_id() {
        let dir = tempdir().unwrap();
        let cache = cache_for("http://localhost:1", dir.path());
        assert!(matches!(
            cache.fetch("ghost/1.0").await,
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_repo_list() {
        let dir = tempdir().unwrap();
        let fname = dir.path().join("sources.list");
        std::fs::write(
            &fname,
            "# main repository\nhttps://r.example\n\n  https://other.example  \n",
        )
        .unwrap();
        assert_eq!(
            load_repo_list(&fname),
            vec!["https://r.example", "https://other.example"]
        );
        assert!(load_repo_list(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_md5_cache_dir_name() {
        // Stable well-known digest.
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
