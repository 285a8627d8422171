//! Error types shared across Corral crates.

use thiserror::Error;

/// Failure talking to the node repository.
///
/// Repository failures are transient by policy: callers log them and retry
/// on their own schedule rather than propagating them upward.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Transport or storage failure reading from the repository.
    #[error("node repository I/O failure: {0}")]
    Io(String),

    /// The requested entity does not exist in the repository.
    #[error("not found in node repository: {0}")]
    NotFound(String),
}
