//! Filesystem locations of the Limba directory layout.
//!
//! Every location honors an environment override so that tests (and
//! stateless systems) can redirect the whole tree.

use std::path::PathBuf;

/// Mount prefix at which application views are composed.
pub const APP_PREFIX: &str = "/app";

fn env_or(var: &str, default: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => PathBuf::from(default),
    }
}

/// Root directory holding installed bundles and runtimes: `/opt/software`.
pub fn software_root() -> PathBuf {
    env_or("LIMBA_SOFTWARE_ROOT", "/opt/software")
}

/// Repository cache root: `/var/cache/limba`.
pub fn cache_root() -> PathBuf {
    env_or("LIMBA_CACHE_ROOT", "/var/cache/limba")
}

/// User-maintained repository list.
pub fn sources_list() -> PathBuf {
    env_or("LIMBA_SOURCES_LIST", "/etc/limba/sources.list")
}

/// Automatically managed repository list.
pub fn auto_sources_list() -> PathBuf {
    env_or("LIMBA_AUTO_SOURCES_LIST", "/var/lib/limba/update-sources.list")
}

/// Directory of trusted repository signing keys.
pub fn keyring_dir() -> PathBuf {
    env_or("LIMBA_KEYRING_DIR", "/etc/limba/keyring")
}

/// Catalog of host-provided foundation components.
pub fn foundations_list() -> PathBuf {
    env_or("LIMBA_FOUNDATIONS_LIST", "/etc/limba/foundations.list")
}

/// AppStream metadata cache shared with software centers.
pub fn appstream_cache() -> PathBuf {
    env_or("LIMBA_APPSTREAM_CACHE", "/var/cache/app-info")
}

/// Socket of the privileged helper daemon.
pub fn helper_socket() -> PathBuf {
    env_or("LIMBA_HELPER_SOCKET", "/run/limba/helper.sock")
}

/// Host prefix receiving exported files (launchers, icons).
pub fn export_root() -> PathBuf {
    env_or("LIMBA_EXPORT_ROOT", "/usr/local")
}

/// Application mount prefix (normally [`APP_PREFIX`]).
pub fn app_prefix() -> PathBuf {
    env_or("LIMBA_APP_PREFIX", APP_PREFIX)
}

/// Architecture name used in repository index paths.
pub fn current_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Multiarch triplet used for library lookup inside the prefix.
pub fn arch_triplet() -> String {
    format!("{}-linux-gnu", std::env::consts::ARCH)
}

/// Extract the file name component of a URL.
pub fn filename_from_url(url: &str) -> &str {
    url.trim_end_matches('/').split('/').next_back().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://r.example/pool/hello-1.0.ipk"), "hello-1.0.ipk");
        assert_eq!(filename_from_url("hello-1.0.ipk"), "hello-1.0.ipk");
        assert_eq!(filename_from_url(""), "");
    }

    #[test]
    fn test_arch_triplet_shape() {
        assert!(arch_triplet().ends_with("-linux-gnu"));
    }
}
