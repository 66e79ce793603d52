use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Run-level error taxonomy. Cluster-facing code works in `anyhow` and is mapped
/// into one of these at the trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input: {0}")]
    Input(String),
    #[error("plan: {0}")]
    Plan(String),
    #[error("apply {object} failed: {message}")]
    Apply { object: String, message: String },
    #[error("inventory {inventory} is corrupt: {reason}")]
    Corrupt { inventory: String, reason: String },
    #[error("inventory {0} not found")]
    InventoryNotFound(String),
    #[error("inventory storage: {0}")]
    Storage(String),
    #[error("persisting inventory failed: {0}")]
    Persist(String),
    #[error("{}", DeleteFailures(.0))]
    Delete(Vec<DeleteFailure>),
    #[error("wait: {0}")]
    Wait(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn input(msg: impl Into<String>) -> Self { Self::Input(msg.into()) }
    pub fn plan(msg: impl Into<String>) -> Self { Self::Plan(msg.into()) }

    pub fn apply(object: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::Apply { object: object.to_string(), message: err.to_string() }
    }

    pub fn corrupt(inventory: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Corrupt { inventory: inventory.to_string(), reason: reason.into() }
    }

    /// Keeps the full `anyhow` context chain in the message.
    pub fn storage(err: anyhow::Error) -> Self { Self::Storage(format!("{:#}", err)) }
}

/// A single failed delete, collected while the remaining deletes continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub object: ResourceId,
    pub message: String,
}

struct DeleteFailures<'a>(&'a [DeleteFailure]);

impl fmt::Display for DeleteFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delete(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, failure.object, failure.message)?;
        }
        Ok(())
    }
}
