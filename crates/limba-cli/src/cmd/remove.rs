//! `lipa remove <id>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use limba_core::ipc::{self, Request};
use limba_core::manager::Manager;
use limba_core::{Reporter as _, paths};

use crate::cmd::is_root;
use crate::console::Console;

pub async fn run(console: &Arc<Console>, id: &str) -> Result<()> {
    if is_root() {
        let mut manager = Manager::new();
        manager
            .remove_software(id)
            .with_context(|| format!("unable to remove {id}"))?;
    } else {
        ipc::request(
            &paths::helper_socket(),
            &Request::Remove { id: id.to_string() },
            console.as_ref(),
        )
        .await
        .with_context(|| format!("unable to remove {id}"))?;
    }
    console.info(&format!("Removed: {id}"));
    Ok(())
}
