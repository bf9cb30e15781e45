//! Virtual-terminal protection.
//!
//! Two concerns live here. [`VtConsole`] locks and unlocks VT switching
//! through the console device while the screen is locked, so nobody can
//! hop to a text console behind the locker's back. [`VtWatch`] follows the
//! kernel's active-VT attribute (a priority-pollable sysfs file) so the
//! loop can compare the active terminal against the one the session owns,
//! captured once at startup as [`VtOwnership`].

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::privilege::{Identity, PrivilegeContext, PrivilegeError};

/// Default console device for the switch-lock ioctl.
pub const DEFAULT_CONSOLE_PATH: &str = "/dev/console";

/// Default kernel attribute reporting the active virtual terminal.
pub const DEFAULT_VT_ACTIVE_PATH: &str = "/sys/class/tty/tty0/active";

const VT_LOCKSWITCH: libc::c_ulong = 0x560B;
const VT_UNLOCKSWITCH: libc::c_ulong = 0x560C;

nix::ioctl_none_bad!(vt_lockswitch, VT_LOCKSWITCH);
nix::ioctl_none_bad!(vt_unlockswitch, VT_UNLOCKSWITCH);

/// VT protection errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VtError {
    /// The console device could not be opened.
    #[error("failed to open console '{path}': {source}")]
    OpenConsole {
        /// The device path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A switch-lock ioctl failed.
    #[error("VT switch ioctl failed: {0}")]
    Ioctl(#[source] nix::Error),

    /// The privileged identity could not be acquired.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

/// Open console device used for the switch-lock ioctls.
#[derive(Debug)]
pub struct VtConsole {
    file: File,
}

impl VtConsole {
    /// Opens the console device under the privileged identity.
    ///
    /// # Errors
    ///
    /// Returns an error when the identity switch or the open fails; the
    /// caller treats either as "VT protection unavailable".
    pub fn open(path: &Path, privilege: &PrivilegeContext) -> Result<Self, VtError> {
        let _guard = privilege.scoped(Identity::Privileged)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| VtError::OpenConsole {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { file })
    }

    /// Forbids VT switching until [`unlock_switch`](Self::unlock_switch).
    ///
    /// # Errors
    ///
    /// Returns an error when the ioctl fails; the lock state is unchanged.
    pub fn lock_switch(&self, privilege: &PrivilegeContext) -> Result<(), VtError> {
        let _guard = privilege.scoped(Identity::Privileged)?;
        // SAFETY: the ioctl takes no argument and the fd is owned by self.
        unsafe { vt_lockswitch(self.file.as_raw_fd()) }.map_err(VtError::Ioctl)?;
        Ok(())
    }

    /// Re-allows VT switching. Harmless when switching was never locked.
    ///
    /// # Errors
    ///
    /// Returns an error when the ioctl fails.
    pub fn unlock_switch(&self, privilege: &PrivilegeContext) -> Result<(), VtError> {
        let _guard = privilege.scoped(Identity::Privileged)?;
        // SAFETY: the ioctl takes no argument and the fd is owned by self.
        unsafe { vt_unlockswitch(self.file.as_raw_fd()) }.map_err(VtError::Ioctl)?;
        Ok(())
    }
}

/// The terminal this session was bound to when the guard started.
/// Read-only after capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtOwnership {
    owning_tty: String,
}

impl VtOwnership {
    /// Wraps an already-known terminal name.
    #[must_use]
    pub fn new(owning_tty: impl Into<String>) -> Self {
        Self {
            owning_tty: owning_tty.into(),
        }
    }

    /// Reads the active terminal from the kernel attribute. The session's
    /// terminal is the active one at guard startup.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the attribute is unreadable.
    pub fn capture(active_path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(active_path)?;
        Ok(Self::new(contents.trim()))
    }

    /// The captured terminal name (e.g. `tty2`).
    #[must_use]
    pub fn owning_tty(&self) -> &str {
        &self.owning_tty
    }

    /// Whether `active` names the owned terminal.
    #[must_use]
    pub fn owns(&self, active: &str) -> bool {
        self.owning_tty == active
    }
}

/// Priority-poll watch over the kernel's active-VT attribute.
pub struct VtWatch {
    fd: AsyncFd<File>,
}

impl VtWatch {
    /// Opens the attribute and arms the first edge (sysfs only reports
    /// priority data after an initial read).
    ///
    /// # Errors
    ///
    /// Returns an error when the attribute cannot be opened or registered.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        let mut scratch = String::new();
        file.read_to_string(&mut scratch)?;
        Ok(Self {
            fd: AsyncFd::with_interest(file, Interest::PRIORITY)?,
        })
    }

    /// Completes on the next change, yielding the new active terminal.
    ///
    /// # Errors
    ///
    /// Returns an error when polling or re-reading the attribute fails;
    /// the caller drops the watch in that case.
    pub async fn next_active(&mut self) -> std::io::Result<String> {
        loop {
            let mut ready = self.fd.ready(Interest::PRIORITY).await?;
            ready.clear_ready();
            let mut file = self.fd.get_ref();
            file.seek(SeekFrom::Start(0))?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let active = contents.trim();
            if !active.is_empty() {
                return Ok(active.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn ownership_compares_terminal_names() {
        let ownership = VtOwnership::new("tty2");
        assert!(ownership.owns("tty2"));
        assert!(!ownership.owns("tty3"));
        assert_eq!(ownership.owning_tty(), "tty2");
    }

    #[test]
    fn ownership_capture_trims_attribute_payload() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "tty7").expect("seed value");
        let ownership = VtOwnership::capture(file.path()).expect("capture should succeed");
        assert_eq!(ownership.owning_tty(), "tty7");
    }

    #[test]
    fn ownership_capture_reports_missing_attribute() {
        assert!(VtOwnership::capture(Path::new("/nonexistent/lockguardd-active")).is_err());
    }
}
