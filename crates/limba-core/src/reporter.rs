//! Progress reporting trait for UI decoupling.
//!
//! Core components never print; they report through a [`Reporter`] handed
//! in at construction time. Front-ends render the events, the daemon
//! forwards them over the wire.

use crate::graph::PackageStage;

/// Receiver for transaction progress events.
///
/// All methods have no-op defaults so implementations only handle what
/// they care about. Events arrive in the order they occur; there is no
/// reordering across a transaction.
pub trait Reporter: Send + Sync {
    /// Download or operation progress, 0..=100. `id` names the package the
    /// progress belongs to, or `None` for the transaction itself.
    fn progress(&self, id: Option<&str>, percentage: u32) {
        let _ = (id, percentage);
    }

    /// A package moved to a new lifecycle stage.
    fn stage_changed(&self, id: &str, stage: PackageStage) {
        let _ = (id, stage);
    }

    /// Informational message.
    fn info(&self, msg: &str) {
        let _ = msg;
    }

    /// Non-fatal problem worth surfacing.
    fn warning(&self, msg: &str) {
        let _ = msg;
    }
}

/// A reporter that swallows every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}
