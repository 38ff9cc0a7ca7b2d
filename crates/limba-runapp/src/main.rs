//! runapp - launch an installed bundle inside its composed prefix.
//!
//! Installed as a setuid helper. The sequence per invocation: keep only
//! `CAP_SYS_ADMIN` while dropping root, enter a fresh mount namespace,
//! overlay-mount the application's runtime and payload at the prefix,
//! drop the remaining capabilities, move into a private cgroup scope,
//! adjust the environment and exec the requested binary.
//!
//! Exit codes: 1 generic failure, 3 privilege handling failure, 6 scope
//! creation failure.

use std::ffi::CString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use limba_core::pkginfo::PkgInfo;
use limba_core::runtime::Runtime;
use limba_core::{paths, version};

const EXIT_FAILED: u8 = 1;
const EXIT_PRIV: u8 = 3;
const EXIT_SCOPE: u8 = 6;

const CAP_SYS_ADMIN: u32 = 21;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

fn capset(effective: u32, permitted: u32) -> std::io::Result<()> {
    let hdr = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    data[0].effective = effective;
    data[0].permitted = permitted;
    let res = unsafe { libc::syscall(libc::SYS_capset, &hdr, data.as_ptr()) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Keep just `CAP_SYS_ADMIN` while giving up the setuid root identity.
fn acquire_caps() -> std::io::Result<()> {
    unsafe {
        if libc::getuid() != libc::geteuid() {
            // Tell the kernel not to clear capabilities when dropping root.
            if libc::prctl(libc::PR_SET_KEEPCAPS, 1 as libc::c_ulong, 0, 0, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(libc::getuid()) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    let mask = 1 << CAP_SYS_ADMIN;
    capset(mask, mask)
}

fn drop_caps() -> std::io::Result<()> {
    capset(0, 0)
}

fn mount(
    source: &str,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> std::io::Result<()> {
    let c_source = CString::new(source)?;
    let c_target = CString::new(target.as_os_str().as_encoded_bytes())?;
    let c_fstype = fstype.map(CString::new).transpose()?;
    let c_data = data.map(CString::new).transpose()?;

    let res = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            c_data
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast()),
        )
    };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn umount(target: &Path) {
    if let Ok(c_target) = CString::new(target.as_os_str().as_encoded_bytes()) {
        unsafe {
            libc::umount(c_target.as_ptr());
        }
    }
}

/// Unwinds overlays mounted so far when a later step fails.
struct MountStack {
    prefix: PathBuf,
    count: usize,
}

impl MountStack {
    fn unwind(&mut self) {
        while self.count > 0 {
            umount(&self.prefix);
            self.count -= 1;
        }
    }
}

/// Enter a new mount namespace with the prefix made private.
fn create_mount_namespace(prefix: &Path, mounts: &mut MountStack) -> Result<(), String> {
    if unsafe { libc::unshare(libc::CLONE_NEWNS) } != 0 {
        return Err(format!(
            "failed to create new namespace: {}",
            std::io::Error::last_os_error()
        ));
    }

    let prefix_str = prefix.to_string_lossy();
    match mount(&prefix_str, prefix, None, libc::MS_PRIVATE, None) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            // No mount exists at the prefix yet; bind it onto itself and
            // retry making that private.
            mount(&prefix_str, prefix, None, libc::MS_BIND, None)
                .map_err(|e| format!("failed to bind prefix: {e}"))?;
            mounts.count += 1;
            mount(&prefix_str, prefix, None, libc::MS_PRIVATE, None)
                .map_err(|e| format!("failed to make prefix namespace private: {e}"))
        }
        Err(err) => Err(format!("failed to make prefix namespace private: {err}")),
    }
}

/// Compose the colon-separated lowerdir directive for a runtime.
///
/// The prefix itself is always appended last: overlayfs requires at least
/// two lowerdirs, and the topmost (first) entry wins on path collisions.
fn compose_lowerdir(software_root: &Path, members: &[String], prefix: &Path) -> String {
    let mut out = String::new();
    for member in members {
        let _ = write!(out, "{}/{}/data:", software_root.display(), member);
    }
    let _ = write!(out, "{}", prefix.display());
    out
}

/// Overlay-mount the runtime and the application payload at the prefix.
fn mount_overlay(pkgid: &str, prefix: &Path, mounts: &mut MountStack) -> Result<(), String> {
    let software_root = paths::software_root();
    let app_dir = software_root.join(pkgid);
    let control = app_dir.join("control");
    if !control.is_file() {
        return Err(format!("the software '{pkgid}' does not exist"));
    }

    let pki = PkgInfo::load_file(&control)
        .map_err(|e| format!("unable to read software metadata: {e}"))?;
    if pki.runtime_uuid.is_empty() {
        return Err(
            "no runtime environment has been assembled for this application yet".to_string(),
        );
    }

    let wdir = software_root.join("runtimes").join("ofs_work");
    std::fs::create_dir_all(&wdir)
        .map_err(|e| format!("unable to create overlay workdir: {e}"))?;

    let overlay_flags = libc::MS_MGC_VAL | libc::MS_RDONLY | libc::MS_NOSUID;

    if pki.runtime_uuid != "None" {
        let rt = Runtime::load_by_uuid(&software_root, &pki.runtime_uuid)
            .map_err(|e| format!("unable to load runtime '{}': {e}", pki.runtime_uuid))?;
        let members: Vec<String> = rt.members().iter().cloned().collect();
        let lowerdir = compose_lowerdir(&software_root, &members, prefix);
        let opts = format!("lowerdir={lowerdir}");
        mount("overlay", prefix, Some("overlay"), overlay_flags, Some(&opts))
            .map_err(|e| format!("unable to mount runtime directory: {e}"))?;
        mounts.count += 1;
    }

    // The application payload goes on top, with the workdir taking its
    // private writes.
    let opts = format!(
        "lowerdir={},upperdir={},workdir={}",
        prefix.display(),
        app_dir.join("data").display(),
        wdir.display()
    );
    mount("overlay", prefix, Some("overlay"), overlay_flags, Some(&opts))
        .map_err(|e| format!("unable to mount application directory: {e}"))?;
    mounts.count += 1;

    Ok(())
}

/// Move this process into a fresh transient cgroup scope.
fn enter_scope(pkgid: &str) -> std::io::Result<()> {
    let scope_name = format!("limba-app-{}.scope", sanitize_pkgid(pkgid));

    // Create the scope next to our current position in the v2 hierarchy,
    // where delegation rules permit it.
    let cgroups = std::fs::read_to_string("/proc/self/cgroup")?;
    let current = cgroups
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .unwrap_or("/")
        .trim();
    let scope_dir = Path::new("/sys/fs/cgroup")
        .join(current.trim_start_matches('/'))
        .join(scope_name);

    match std::fs::create_dir(&scope_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }
    std::fs::write(scope_dir.join("cgroup.procs"), std::process::id().to_string())
}

fn sanitize_pkgid(pkgid: &str) -> String {
    pkgid
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.' || *c == '_')
        .collect()
}

/// Prepend `item` to a colon-separated environment list.
fn update_env_var_list(var: &str, item: &str) {
    let value = match std::env::var(var) {
        Ok(old) if !old.is_empty() => format!("{item}:{old}"),
        _ => item.to_string(),
    };
    // This process is still single-threaded here.
    unsafe {
        std::env::set_var(var, value);
    }
}

/// Split `<pkg-id>:<relative-executable>` into its parts.
fn parse_target(arg: &str) -> Option<(&str, &str)> {
    match arg.split_once(':') {
        Some((pkgid, exe)) if !pkgid.is_empty() && !exe.is_empty() => Some((pkgid, exe)),
        _ => None,
    }
}

fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

fn exec(executable: &Path, args: &[String]) -> std::io::Error {
    let Ok(c_exe) = CString::new(executable.as_os_str().as_encoded_bytes()) else {
        return std::io::Error::other("executable path contains NUL");
    };
    let mut argv = vec![c_exe.clone()];
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(c_arg) => argv.push(c_arg),
            Err(_) => return std::io::Error::other("argument contains NUL"),
        }
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(c_exe.as_ptr(), argv_ptrs.as_ptr());
    }
    // execv only returns on failure.
    std::io::Error::last_os_error()
}

fn run() -> u8 {
    // First order of business: keep the one capability we need, give up
    // everything else the setuid bit handed us.
    if acquire_caps().is_err() {
        eprintln!("this program needs the suid bit to be set to function correctly");
        return EXIT_PRIV;
    }

    let args: Vec<String> = std::env::args().collect();
    let Some(target) = args.get(1) else {
        eprintln!("no application-id was specified");
        return EXIT_FAILED;
    };
    let Some((pkgid, rel_exe)) = parse_target(target) else {
        eprintln!("no installed software with that name or executable found");
        return EXIT_FAILED;
    };

    if let Some(release) = kernel_release() {
        if version::compare("4.0", &release) == std::cmp::Ordering::Greater {
            eprintln!(
                "W: running on Linux {release}; runapp needs at least Linux 4.0 to be sure all needed features are present"
            );
        }
    }

    let prefix = paths::app_prefix();
    let mut mounts = MountStack {
        prefix: prefix.clone(),
        count: 0,
    };

    if let Err(err) = create_mount_namespace(&prefix, &mut mounts) {
        eprintln!("{err}");
        mounts.unwind();
        return EXIT_FAILED;
    }
    if let Err(err) = mount_overlay(pkgid, &prefix, &mut mounts) {
        eprintln!("{err}");
        mounts.unwind();
        return EXIT_FAILED;
    }

    // Everything needing CAP_SYS_ADMIN is done.
    if drop_caps().is_err() {
        eprintln!("unable to drop capabilities");
        mounts.unwind();
        return EXIT_PRIV;
    }

    if let Err(err) = enter_scope(pkgid) {
        eprintln!("could not add process to new scope: {err}");
        mounts.unwind();
        return EXIT_SCOPE;
    }

    let prefix_str = prefix.to_string_lossy();
    update_env_var_list("LD_LIBRARY_PATH", &format!("{prefix_str}/lib"));
    update_env_var_list(
        "LD_LIBRARY_PATH",
        &format!("{prefix_str}/lib/{}", paths::arch_triplet()),
    );
    update_env_var_list("PATH", &format!("{prefix_str}/bin"));

    let executable = prefix.join(rel_exe);
    if !executable.exists() {
        eprintln!("executable '{}' was not found", executable.display());
        mounts.unwind();
        return EXIT_FAILED;
    }

    let err = exec(&executable, &args[2..]);
    eprintln!("unable to execute '{}': {err}", executable.display());
    mounts.unwind();
    EXIT_FAILED
}

fn main() -> ExitCode {
    ExitCode::from(run())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("hello/1.0:bin/hello"),
            Some(("hello/1.0", "bin/hello"))
        );
        assert!(parse_target("hello/1.0").is_none());
        assert!(parse_target(":bin/hello").is_none());
        assert!(parse_target("hello/1.0:").is_none());
    }

    #[test]
    fn test_compose_lowerdir_appends_prefix() {
        let lower = compose_lowerdir(
            Path::new("/opt/software"),
            &["libgreet/1.0".to_string(), "libmisc/2.0".to_string()],
            Path::new("/app"),
        );
        assert_eq!(
            lower,
            "/opt/software/libgreet/1.0/data:/opt/software/libmisc/2.0/data:/app"
        );

        // Even an empty runtime keeps the prefix so overlayfs always sees
        // at least one lowerdir besides the payload.
        assert_eq!(compose_lowerdir(Path::new("/opt/software"), &[], Path::new("/app")), "/app");
    }

    #[test]
    fn test_sanitize_pkgid() {
        assert_eq!(sanitize_pkgid("hello/1.0"), "hello1.0");
        assert_eq!(sanitize_pkgid("weird name/2"), "weirdname2");
    }

    #[test]
    fn test_update_env_var_list() {
        unsafe {
            std::env::remove_var("RUNAPP_TEST_PATH");
        }
        update_env_var_list("RUNAPP_TEST_PATH", "/app/bin");
        assert_eq!(std::env::var("RUNAPP_TEST_PATH").unwrap(), "/app/bin");
        update_env_var_list("RUNAPP_TEST_PATH", "/app/lib");
        assert_eq!(std::env::var("RUNAPP_TEST_PATH").unwrap(), "/app/lib:/app/bin");
    }
}
