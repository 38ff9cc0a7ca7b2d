//! Installation transactions.
//!
//! The installer drives one transaction at a time: it resolves the
//! dependency graph of a root package (local file or repository id) and
//! then executes the resulting plan in post-order, synthesizing or reusing
//! a runtime for applications. When the process lacks root privileges the
//! whole operation is forwarded to the helper daemon instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::archive::{ArchiveError, PackageArchive};
use crate::cache::{CacheError, PackageCache};
use crate::graph::{GraphError, PackageGraph, PackageStage};
use crate::ipc::{self, IpcError, Request};
use crate::keyring::{Keyring, TrustLevel};
use crate::manager::{Manager, ManagerError};
use crate::paths;
use crate::pkginfo::{self, PackageFlags, PkgInfo, PkgInfoError, parse_dependencies};
use crate::reporter::Reporter;
use crate::runtime::{Runtime, RuntimeError};

/// Errors raised by installation transactions.
#[derive(Error, Debug)]
pub enum InstallerError {
    /// Generic failure.
    #[error("{0}")]
    Failed(String),

    /// A declared dependency could not be satisfied by any source.
    #[error("could not find dependency: {0}")]
    DependencyNotFound(String),

    /// A dependency exists but is unusable.
    #[error("dependency is broken: {0}")]
    DependencyBroken(String),

    /// An internal inconsistency, e.g. the helper daemon crashed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl InstallerError {
    /// Stable tag for programmatic matching (also used on the wire).
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::DependencyNotFound(_) => "dependency-not-found",
            Self::DependencyBroken(_) => "dependency-broken",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<ArchiveError> for InstallerError {
    fn from(err: ArchiveError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<CacheError> for InstallerError {
    fn from(err: CacheError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<ManagerError> for InstallerError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Dependency { .. } => Self::DependencyBroken(err.to_string()),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<GraphError> for InstallerError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::FoundationNotFound(name) => Self::DependencyNotFound(name),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<RuntimeError> for InstallerError {
    fn from(err: RuntimeError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<PkgInfoError> for InstallerError {
    fn from(err: PkgInfoError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<IpcError> for InstallerError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::ConnectionLost => Self::Internal(err.to_string()),
            IpcError::Io(_) | IpcError::Protocol(_) => Self::Internal(err.to_string()),
            IpcError::Remote { code, message, .. } => match code.as_str() {
                "dependency-not-found" => Self::DependencyNotFound(message),
                "dependency-broken" => Self::DependencyBroken(message),
                "internal" => Self::Internal(message),
                _ => Self::Failed(message),
            },
        }
    }
}

/// Drives resolution and execution of installation transactions.
pub struct Installer {
    manager: Manager,
    graph: PackageGraph,
    cache: PackageCache,
    keyring: Keyring,
    package: Option<Arc<PackageArchive>>,
    fname: Option<PathBuf>,
    extra_pkgs: Vec<(PkgInfo, Arc<PackageArchive>)>,
    all_pkgs: Option<Vec<PkgInfo>>,
    allow_insecure: bool,
    use_helper: bool,
    export_root: PathBuf,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("package", &self.package.as_ref().map(|p| p.id()))
            .field("use_helper", &self.use_helper)
            .finish_non_exhaustive()
    }
}

impl Installer {
    /// Installer over the system roots.
    ///
    /// When the process is not root and the helper daemon's socket exists,
    /// transactions are forwarded to the daemon.
    pub fn new(reporter: Arc<dyn Reporter>) -> Result<Self, InstallerError> {
        let cache = PackageCache::new(reporter.clone())?;
        let keyring = Keyring::new()
            .map_err(|e| InstallerError::Failed(format!("unable to load keyring: {e}")))?;
        let euid = unsafe { libc::geteuid() };
        let use_helper = euid != 0 && paths::helper_socket().exists();

        Ok(Self {
            manager: Manager::new(),
            graph: PackageGraph::new(),
            cache,
            keyring,
            package: None,
            fname: None,
            extra_pkgs: Vec::new(),
            all_pkgs: None,
            allow_insecure: false,
            use_helper,
            export_root: paths::export_root(),
            reporter,
        })
    }

    /// Installer over explicit roots, always operating locally.
    #[must_use]
    pub fn with_roots(
        software_root: PathBuf,
        cache: PackageCache,
        keyring: Keyring,
        export_root: PathBuf,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            manager: Manager::with_root(software_root),
            graph: PackageGraph::new(),
            cache,
            keyring,
            package: None,
            fname: None,
            extra_pkgs: Vec::new(),
            all_pkgs: None,
            allow_insecure: false,
            use_helper: false,
            export_root,
            reporter,
        }
    }

    /// Open a local bundle file for installation.
    pub fn open_file(&mut self, filename: &Path) -> Result<(), InstallerError> {
        let pkg = PackageArchive::open_file(filename)?;
        self.package = Some(Arc::new(pkg));
        self.fname = Some(filename.to_path_buf());
        self.all_pkgs = None;
        Ok(())
    }

    /// Open a package from the configured repositories for installation.
    ///
    /// The repository index and the download are already hash-verified, so
    /// the bundle's own signature is not checked again.
    pub async fn open_remote(&mut self, pkgid: &str) -> Result<(), InstallerError> {
        self.cache.open()?;
        let pkg = PackageArchive::open_remote(&self.cache, pkgid).await?;
        self.package = Some(Arc::new(pkg));
        self.fname = None;
        self.all_pkgs = None;
        Ok(())
    }

    /// Load supplementary local bundles usable for resolving dependencies
    /// of the main package (the builder's mechanism).
    pub fn open_extra_packages(&mut self, files: &[PathBuf]) -> Result<(), InstallerError> {
        self.extra_pkgs.clear();
        for fname in files {
            let pkg = PackageArchive::open_file(fname)?;
            pkg.set_auto_verify(!self.allow_insecure);
            self.extra_pkgs.push((pkg.info().clone(), Arc::new(pkg)));
        }
        Ok(())
    }

    /// Allow packages with insecure trust levels. Off by default; only
    /// enable after warning the user.
    pub fn set_allow_insecure(&mut self, insecure: bool) {
        self.allow_insecure = insecure;
    }

    /// Treat unsatisfiable foundation dependencies as warnings.
    pub fn set_ignore_foundations(&mut self, ignore: bool) {
        self.graph.set_ignore_foundations(ignore);
    }

    /// Force local operation or helper forwarding.
    pub fn set_use_helper(&mut self, use_helper: bool) {
        self.use_helper = use_helper;
    }

    /// Metadata of the loaded root package.
    #[must_use]
    pub fn package_info(&self) -> Option<&PkgInfo> {
        self.package.as_deref().map(PackageArchive::info)
    }

    /// Trust level of the loaded root package's signature.
    pub fn package_trust_level(&self) -> Result<TrustLevel, InstallerError> {
        let pkg = self
            .package
            .as_deref()
            .ok_or_else(|| InstallerError::Failed("no package is loaded".to_string()))?;
        Ok(pkg.verify_signature(&self.keyring)?)
    }

    /// Run the installation transaction for the loaded package.
    pub async fn install(&mut self) -> Result<(), InstallerError> {
        if self.use_helper {
            return self.install_via_helper().await;
        }

        let result = self.install_locally().await;
        // Tear down the working graph either way; packages already
        // installed on disk stay installed and are reused next time.
        self.graph.reset();
        self.all_pkgs = None;
        result
    }

    async fn install_via_helper(&mut self) -> Result<(), InstallerError> {
        tracing::debug!("forwarding transaction to the helper daemon");
        let request = match (&self.fname, &self.package) {
            (Some(path), _) => Request::InstallLocal { path: path.clone() },
            (None, Some(pkg)) => Request::InstallRemote { id: pkg.id() },
            (None, None) => {
                return Err(InstallerError::Failed("no package is loaded".to_string()));
            }
        };
        ipc::request(&paths::helper_socket(), &request, self.reporter.as_ref()).await?;
        Ok(())
    }

    async fn install_locally(&mut self) -> Result<(), InstallerError> {
        self.graph.initialize()?;

        let Some(pkg) = self.package.clone() else {
            return Err(InstallerError::Failed("no package is loaded".to_string()));
        };
        self.cache.open()?;

        self.graph.reset();
        let root = self.graph.add_install_todo(None, pkg);
        self.check_dependencies(root).await?;
        self.install_node(root)
    }

    /// Expand the dependencies of one graph node, trying the sources in
    /// their fixed precedence order: foundations, extra packages, the
    /// installed/available union, embedded copies in the node itself, then
    /// embedded copies in its ancestors.
    fn check_dependencies(&mut self, node: usize) -> BoxFuture<'_, Result<(), InstallerError>> {
        async move {
            let info = self.graph.info(node).clone();
            if self.graph.install_candidate(node).is_some() {
                tracing::debug!("hit new package: {}", info.id());
            } else {
                tracing::debug!("hit installed package: {}", info.id());
            }

            let deps = parse_dependencies(&info.dependencies);
            if deps.is_empty() {
                return Ok(());
            }

            if self.all_pkgs.is_none() {
                let mut all = self.manager.installed_software()?;
                all.extend(self.cache.packages());
                self.all_pkgs = Some(all);
            }

            for dep in deps {
                // A package satisfying this is already part of the graph.
                if self.graph.find_satisfying(&dep).is_some() {
                    continue;
                }

                if self.graph.test_foundation_dependency(&dep)? {
                    continue;
                }

                if let Some(archive) = self.find_in_extra_packages(&dep) {
                    let idx = self.graph.add_install_todo(Some(node), archive);
                    self.check_dependencies(idx).await?;
                    continue;
                }

                let known = self
                    .all_pkgs
                    .as_deref()
                    .and_then(|all| pkginfo::find_satisfying_pkg(all, &dep))
                    .cloned();
                match known {
                    Some(ipki)
                        if ipki.has_flag(PackageFlags::AVAILABLE)
                            && !ipki.has_flag(PackageFlags::INSTALLED) =>
                    {
                        tracing::debug!("hit remote package: {}", ipki.id());
                        self.reporter
                            .stage_changed(&ipki.id(), PackageStage::Downloading);
                        let archive = PackageArchive::open_remote(&self.cache, &ipki.id()).await?;
                        let idx = self.graph.add_install_todo(Some(node), Arc::new(archive));
                        self.check_dependencies(idx).await?;
                    }
                    Some(mut ipki) => {
                        if !ipki.has_flag(PackageFlags::INSTALLED) {
                            tracing::warn!(
                                "found package '{}' which should be in INSTALLED state, but actually is not; assuming INSTALLED",
                                ipki.id()
                            );
                            ipki.add_flag(PackageFlags::INSTALLED);
                        }
                        // Satisfied, but still expanded: the runtime needs
                        // the full dependency tree.
                        let idx = self.graph.add_package(Some(node), ipki);
                        self.check_dependencies(idx).await?;
                    }
                    None => match self.find_dependency_embedded(node, &dep)? {
                        Some(idx) => self.check_dependencies(idx).await?,
                        None => {
                            return Err(InstallerError::DependencyNotFound(
                                dep.name_relation_string(),
                            ));
                        }
                    },
                }
            }

            Ok(())
        }
        .boxed()
    }

    fn find_in_extra_packages(&self, dep: &PkgInfo) -> Option<Arc<PackageArchive>> {
        self.extra_pkgs
            .iter()
            .find(|(info, _)| info.satisfies_requirement(dep))
            .map(|(_, archive)| archive.clone())
    }

    /// Look for an embedded copy satisfying `dep`, starting at `node` and
    /// walking up the parent chain. A top-level bundle can this way supply
    /// dependencies shared by several of its own dependencies.
    fn find_dependency_embedded(
        &mut self,
        node: usize,
        dep: &PkgInfo,
    ) -> Result<Option<usize>, InstallerError> {
        let mut holder = Some(node);
        while let Some(idx) = holder {
            if let Some(archive) = self.graph.install_candidate(idx).cloned() {
                let embedded = archive.embedded_packages()?;
                if let Some(epki) = pkginfo::find_satisfying_pkg(&embedded, dep) {
                    self.reporter
                        .stage_changed(&epki.id(), PackageStage::Extracting);
                    let extracted = archive.extract_embedded_package(epki)?;
                    // The new node hangs off the depender, not off the
                    // bundle that happened to carry the copy: install
                    // order follows the dependency edges.
                    let new_idx = self.graph.add_install_todo(Some(node), Arc::new(extracted));
                    return Ok(Some(new_idx));
                }
            } else {
                tracing::debug!(
                    "skipping embedded dependency-lookup in installed package {}",
                    self.graph.info(idx).id()
                );
            }
            holder = self.graph.parent(idx);
        }
        Ok(None)
    }

    /// Execute the install plan below `root` in post-order, then attach a
    /// runtime to the root if it is an application.
    fn install_node(&mut self, root: usize) -> Result<(), InstallerError> {
        let order = self.graph.post_order(root);
        let software_root = self.manager.software_root().to_path_buf();

        for idx in order {
            let Some(archive) = self.graph.install_candidate(idx).cloned() else {
                tracing::debug!("skipping '{}': already installed", self.graph.info(idx).id());
                continue;
            };

            // Only the origin was requested by the user.
            if !self.graph.is_origin(idx) {
                self.graph.info_mut(idx).add_flag(PackageFlags::AUTOMATIC);
            }
            if self.allow_insecure {
                archive.set_auto_verify(false);
            }

            let info = self.graph.info(idx).clone();
            self.graph.set_stage(idx, PackageStage::Installing);
            self.reporter
                .stage_changed(&info.id(), PackageStage::Installing);

            archive.install(&info, &software_root, &self.keyring, &self.export_root)?;

            self.graph.set_stage(idx, PackageStage::Installed);
            self.reporter
                .stage_changed(&info.id(), PackageStage::Installed);
            tracing::debug!("installed package: {}", info.id());
        }
        self.manager.invalidate();

        // Compose (or reuse) the runtime the application will run against.
        let root_info = self.graph.info(root).clone();
        let members = self.graph.member_ids_except(root);
        let uuid = if root_info.has_flag(PackageFlags::APPLICATION) && !members.is_empty() {
            match self.manager.find_runtime_with_members(&members)? {
                Some(rt) => rt.uuid().to_string(),
                None => {
                    tracing::debug!("creating new runtime for {}", root_info.id());
                    let rt = Runtime::create_with_members(&self.manager.runtimes_dir(), &members)?;
                    rt.uuid().to_string()
                }
            }
        } else {
            // The software runs without a runtime; state that explicitly.
            "None".to_string()
        };

        self.graph.info_mut(root).runtime_uuid = uuid;
        self.graph.info(root).save_changes(&software_root)?;
        self.manager.invalidate();
        Ok(())
    }

    /// Remove an installed package (root-only operation).
    pub fn remove(&mut self, pkgid: &str) -> Result<(), ManagerError> {
        self.manager.remove_software(pkgid)
    }

    /// Refresh the repository cache.
    pub async fn update_cache(&mut self) -> Result<(), CacheError> {
        self.cache.update().await
    }

    /// Installed packages, as seen by this installer's manager.
    pub fn installed_software(&mut self) -> Result<Vec<PkgInfo>, ManagerError> {
        self.manager.installed_software()
    }

    /// Available packages from the merged repository index.
    pub fn available_software(&mut self) -> Result<Vec<PkgInfo>, InstallerError> {
        self.cache.open()?;
        Ok(self.cache.packages())
    }
}
