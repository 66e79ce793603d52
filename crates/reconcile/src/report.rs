use kustodian_core::Change;
use tracing::info;

/// Receives every object-level change as it happens, and coarse progress between stages.
pub trait Reporter: Send + Sync {
    fn change(&self, change: &Change);
    fn progress(&self, _message: &str) {}
}

/// Logs changes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn change(&self, change: &Change) {
        info!(object = %change.object, action = %change.action, "change");
    }

    fn progress(&self, message: &str) {
        info!("{}", message);
    }
}
