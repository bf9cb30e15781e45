//! Fatal startup errors.
//!
//! Only three conditions abort the process: an unusable privilege state,
//! an unreadable debug-key mask, and an unreachable lock-state service.
//! Everything else degrades a feature or is retried on the next
//! transition; see the per-module error types.

use thiserror::Error;

use crate::privilege::PrivilegeError;
use crate::restore::CaptureError;

/// A startup precondition without which the guard's guarantees cannot be
/// established. The process exits before entering the event loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FatalError {
    /// The privileged/unprivileged identities are not both reachable.
    #[error("privilege initialization failed: {0}")]
    Privilege(#[from] PrivilegeError),

    /// The debug-key mask could not be captured, so it could never be
    /// restored faithfully.
    #[error(transparent)]
    DebugKeys(CaptureError),

    /// The user's session bus is unreachable.
    #[error("failed to connect to the session bus: {0}")]
    SessionBus(#[source] zbus::Error),

    /// The lock-state notification cannot be subscribed; the guard has no
    /// purpose without it.
    #[error("lock-state notification unavailable: {0}")]
    LockSignal(#[source] zbus::Error),

    /// Termination-signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}
