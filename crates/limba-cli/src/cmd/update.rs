//! `lipa update`.

use std::sync::Arc;

use anyhow::{Context, Result};
use limba_core::cache::PackageCache;
use limba_core::ipc::{self, Request};
use limba_core::{Reporter as _, paths};

use crate::cmd::is_root;
use crate::console::Console;

pub async fn run(console: &Arc<Console>) -> Result<()> {
    if is_root() {
        let mut cache = PackageCache::new(console.clone()).context("unable to set up cache")?;
        if cache.repositories().is_empty() {
            console.warning("no repositories are configured");
            return Ok(());
        }
        cache.update().await.context("cache update failed")?;
    } else {
        ipc::request(&paths::helper_socket(), &Request::Update, console.as_ref())
            .await
            .context("cache update failed")?;
    }
    console.info("Repository data is up to date.");
    Ok(())
}
