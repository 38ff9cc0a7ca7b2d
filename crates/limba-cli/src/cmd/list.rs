//! `lipa list-installed` / `lipa list-available`.

use anyhow::{Context, Result};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use limba_core::cache::PackageCache;
use limba_core::manager::Manager;
use limba_core::pkginfo::{PackageFlags, PkgInfo};

pub fn installed() -> Result<()> {
    let mut manager = Manager::new();
    let mut pkgs = manager
        .installed_software()
        .context("unable to scan installed software")?;
    pkgs.sort_by(|a, b| a.id().cmp(&b.id()));
    print_table(&pkgs, true);
    Ok(())
}

pub fn available() -> Result<()> {
    let mut cache = PackageCache::silent().context("unable to set up cache")?;
    cache.open().context("unable to load package cache")?;
    let mut pkgs = cache.packages();
    pkgs.sort_by(|a, b| a.id().cmp(&b.id()));
    print_table(&pkgs, false);
    Ok(())
}

fn print_table(pkgs: &[PkgInfo], installed: bool) {
    if pkgs.is_empty() {
        println!("No packages found.");
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    if installed {
        table.set_header(["Package", "Version", "Name", "Flags"]);
    } else {
        table.set_header(["Package", "Version", "Name", "Repository"]);
    }

    for pkg in pkgs {
        let last = if installed {
            let mut flags = Vec::new();
            if pkg.has_flag(PackageFlags::APPLICATION) {
                flags.push("app");
            }
            if pkg.has_flag(PackageFlags::AUTOMATIC) {
                flags.push("auto");
            }
            flags.join(",")
        } else {
            pkg.repository.clone()
        };
        table.add_row([
            pkg.name.clone(),
            pkg.version.clone(),
            pkg.appname.clone(),
            last,
        ]);
    }
    println!("{table}");
}
