//! `lipa install <id-or-file>`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use limba_core::Reporter as _;
use limba_core::installer::Installer;
use limba_core::keyring::TrustLevel;

use crate::console::Console;

pub async fn run(
    console: &Arc<Console>,
    target: &str,
    insecure: bool,
    ignore_foundations: bool,
) -> Result<()> {
    let mut installer =
        Installer::new(console.clone()).context("unable to set up installer")?;
    installer.set_allow_insecure(insecure);
    installer.set_ignore_foundations(ignore_foundations);

    let path = Path::new(target);
    if path.is_file() {
        installer
            .open_file(path)
            .with_context(|| format!("unable to open bundle {target}"))?;
        if !insecure {
            match installer.package_trust_level() {
                Ok(level) if level < TrustLevel::Medium => {
                    console.warning(&format!("bundle has a {level} trust level signature"));
                }
                Ok(_) => {}
                Err(err) => console.warning(&format!("trust check failed: {err}")),
            }
        }
    } else {
        installer
            .open_remote(target)
            .await
            .with_context(|| format!("unable to find package {target}"))?;
    }

    let info = installer
        .package_info()
        .map(|p| (p.id(), p.appname.clone()));
    installer.install().await.context("installation failed")?;

    if let Some((id, appname)) = info {
        let label = if appname.is_empty() { id } else { appname };
        console.info(&format!("Installed: {label}"));
    }
    Ok(())
}
