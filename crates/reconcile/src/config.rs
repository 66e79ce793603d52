use std::time::Duration;

use kustodian_core::{ApplyOptions, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
static DNS_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap());

/// Upper bound for a run and for the readiness poll interval.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a run needs to know beyond the objects themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Inventory name; also the name of the stored record.
    pub name: String,
    pub namespace: String,
    pub source: Option<String>,
    pub revision: Option<String>,
    /// Delete objects the previous run owned that this run no longer declares.
    pub prune: bool,
    /// Wait for applied objects to become ready and pruned ones to terminate.
    pub wait: bool,
    /// Recreate objects whose update is rejected for immutable field changes.
    pub force: bool,
    /// Bound for the whole run, waits included.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ReconcileConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            source: None,
            revision: None,
            prune: false,
            wait: false,
            force: false,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::input("inventory name is required"));
        }
        if self.name.len() > 253 || !DNS_SUBDOMAIN.is_match(&self.name) {
            return Err(Error::input(format!("invalid inventory name {:?}: must be a lowercase RFC 1123 name", self.name)));
        }
        if self.namespace.is_empty() {
            return Err(Error::input("inventory namespace is required"));
        }
        if self.namespace.len() > 63 || !DNS_LABEL.is_match(&self.namespace) {
            return Err(Error::input(format!(
                "invalid inventory namespace {:?}: must be a lowercase RFC 1123 label",
                self.namespace
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::input("timeout must be greater than zero"));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(Error::input(format!("timeout {:?} exceeds the {:?} maximum", self.timeout, MAX_TIMEOUT)));
        }
        if self.poll_interval.is_zero() || self.poll_interval > MAX_TIMEOUT {
            return Err(Error::input(format!(
                "poll interval {:?} must be non-zero and at most {:?}",
                self.poll_interval, MAX_TIMEOUT
            )));
        }
        Ok(())
    }

    pub fn apply_options(&self) -> ApplyOptions { ApplyOptions { force: self.force, timeout: self.timeout } }
}
