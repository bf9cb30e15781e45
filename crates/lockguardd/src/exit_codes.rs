//! Deterministic exit codes.
//!
//! `0` means the guard shut down gracefully with all settings restored.
//! Non-zero codes identify which fatal startup precondition failed, so a
//! supervisor can tell a misconfiguration from a missing session service.

use crate::error::FatalError;

/// Exit code constants.
pub mod codes {
    /// Graceful shutdown; all restorations attempted.
    pub const SUCCESS: u8 = 0;

    /// Fallback for unmapped failures.
    pub const GENERIC_ERROR: u8 = 1;

    /// The configuration file was unreadable or malformed.
    pub const CONFIG_ERROR: u8 = 10;

    /// The privilege drop/regain probe failed.
    pub const PRIVILEGE_ERROR: u8 = 11;

    /// The debug-key mask file could not be read.
    pub const DEBUG_KEYS_ERROR: u8 = 12;

    /// The session bus or the lock-state service is unreachable.
    pub const LOCK_SIGNAL_ERROR: u8 = 13;
}

/// Maps a fatal startup error onto its exit code.
#[must_use]
pub fn for_fatal(error: &FatalError) -> u8 {
    match error {
        FatalError::Privilege(_) => codes::PRIVILEGE_ERROR,
        FatalError::DebugKeys(_) => codes::DEBUG_KEYS_ERROR,
        FatalError::SessionBus(_) | FatalError::LockSignal(_) => codes::LOCK_SIGNAL_ERROR,
        FatalError::Signals(_) => codes::GENERIC_ERROR,
    }
}
