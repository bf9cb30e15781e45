//! Effective-identity management.
//!
//! The guard starts set-user-ID root from a user's desktop session: the
//! real uid is the invoking user, the effective uid is root. Session-scoped
//! services (the session bus, the X server, user helper processes) must
//! never observe root credentials, while the kernel control file and the VT
//! ioctl require them. [`PrivilegeContext`] records both identities and
//! hands out scoped switches; [`PrivilegeGuard`] restores the previous
//! effective identity on drop, including when the guarded section fails.
//!
//! Helper processes are spawned through [`PrivilegeContext::command_as`],
//! which performs a *full* identity switch (`setresgid` + `setresuid`) in
//! the child before exec so a helper cannot regain root through the saved
//! set-user-ID.

#![allow(unsafe_code)]

use std::ffi::OsStr;

use nix::unistd::{
    getegid, geteuid, getgid, getuid, setegid, seteuid, setresgid, setresuid, Gid, Uid,
};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Privilege level required by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// The elevated identity the process was started with.
    Privileged,
    /// The invoking user's identity.
    Unprivileged,
}

/// Errors from identity switching and helper spawning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrivilegeError {
    /// Switching the effective uid/gid failed.
    #[error("failed to switch effective identity to {level:?}: {source}")]
    Switch {
        /// The identity that could not be acquired.
        level: Identity,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The startup round-trip probe did not end on the expected identity.
    #[error("identity probe failed: could not regain {0:?}")]
    Probe(Identity),

    /// A helper command line was empty.
    #[error("empty helper command line")]
    EmptyCommand,

    /// A helper process could not be spawned.
    #[error("failed to spawn helper '{command}': {source}")]
    Spawn {
        /// The program that failed to start.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Switches the effective uid/gid, ordering the two calls so the change is
/// permitted in both directions (gid first when dropping, uid first when
/// regaining root).
fn switch_effective(uid: Uid, gid: Gid) -> nix::Result<()> {
    if uid.is_root() {
        seteuid(uid)?;
        setegid(gid)?;
    } else {
        setegid(gid)?;
        seteuid(uid)?;
    }
    Ok(())
}

/// Restores the effective identity that was current when the guard was
/// created. Obtained from [`PrivilegeContext::scoped`].
#[derive(Debug)]
pub struct PrivilegeGuard {
    prev_uid: Uid,
    prev_gid: Gid,
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if let Err(err) = switch_effective(self.prev_uid, self.prev_gid) {
            // Nothing sensible to do beyond reporting: the next scoped
            // switch will fail loudly if the process is truly stuck.
            warn!(uid = %self.prev_uid, error = %err, "failed to restore previous effective identity");
        }
    }
}

/// The two identities the process may run as.
#[derive(Debug)]
pub struct PrivilegeContext {
    privileged: (Uid, Gid),
    unprivileged: (Uid, Gid),
}

impl PrivilegeContext {
    /// Records the elevated (effective) and user (real) identities and
    /// proves both are reachable with a drop/regain round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if either switch is refused. The caller must treat
    /// this as fatal: entering the event loop with an unknown privilege
    /// state would void every guarantee the guard makes.
    pub fn init() -> Result<Self, PrivilegeError> {
        let context = Self {
            privileged: (geteuid(), getegid()),
            unprivileged: (getuid(), getgid()),
        };
        {
            let _guard = context.scoped(Identity::Unprivileged)?;
        }
        if geteuid() != context.privileged.0 {
            return Err(PrivilegeError::Probe(Identity::Privileged));
        }
        debug!(
            privileged = %context.privileged.0,
            unprivileged = %context.unprivileged.0,
            "identity probe succeeded"
        );
        Ok(context)
    }

    const fn ids(&self, level: Identity) -> (Uid, Gid) {
        match level {
            Identity::Privileged => self.privileged,
            Identity::Unprivileged => self.unprivileged,
        }
    }

    /// Returns the uid of the requested identity.
    #[must_use]
    pub const fn uid(&self, level: Identity) -> Uid {
        self.ids(level).0
    }

    /// Switches the effective identity until the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel refuses the switch; the effective
    /// identity is left unchanged in that case.
    pub fn scoped(&self, level: Identity) -> Result<PrivilegeGuard, PrivilegeError> {
        let prev_uid = geteuid();
        let prev_gid = getegid();
        let (uid, gid) = self.ids(level);
        switch_effective(uid, gid).map_err(|source| PrivilegeError::Switch { level, source })?;
        Ok(PrivilegeGuard { prev_uid, prev_gid })
    }

    /// Runs `f` under the requested identity, restoring the previous one
    /// afterwards regardless of what `f` does.
    ///
    /// # Errors
    ///
    /// Returns an error when the identity cannot be acquired; `f` is not
    /// called in that case.
    pub fn run_as<T>(&self, level: Identity, f: impl FnOnce() -> T) -> Result<T, PrivilegeError> {
        let _guard = self.scoped(level)?;
        Ok(f())
    }

    /// Builds a command whose child fully assumes the requested identity
    /// (real, effective, and saved ids) before exec.
    #[must_use]
    pub fn command_as(&self, level: Identity, program: impl AsRef<OsStr>) -> Command {
        let (uid, gid) = self.ids(level);
        let mut command = Command::new(program);
        // SAFETY: the pre-exec closure only performs async-signal-safe
        // id switches and returns an error to abort the spawn on failure.
        unsafe {
            command.pre_exec(move || {
                setresgid(gid, gid, gid)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                setresuid(uid, uid, uid)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                Ok(())
            });
        }
        command
    }

    /// Spawns `argv` under the requested identity.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty command line or a failed spawn.
    pub fn spawn_as(&self, level: Identity, argv: &[String]) -> Result<Child, PrivilegeError> {
        let (program, args) = argv.split_first().ok_or(PrivilegeError::EmptyCommand)?;
        let mut command = self.command_as(level, program);
        command.args(args);
        command.spawn().map_err(|source| PrivilegeError::Spawn {
            command: program.clone(),
            source,
        })
    }

    /// Permanently drops to the unprivileged identity. Called once at the
    /// very end of finalization; afterwards no privileged operation can
    /// succeed again.
    pub fn relinquish(&self) {
        let (uid, gid) = self.unprivileged;
        let result = setresgid(gid, gid, gid).and_then(|()| setresuid(uid, uid, uid));
        if let Err(err) = result {
            warn!(uid = %uid, error = %err, "failed to relinquish privileges");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // All tests run under a single uid, so every switch is a permitted
    // no-op and the control flow can be exercised without root.

    fn context() -> PrivilegeContext {
        PrivilegeContext::init().expect("same-uid probe should succeed")
    }

    #[test]
    fn init_probes_round_trip() {
        let ctx = context();
        assert_eq!(ctx.uid(Identity::Privileged), geteuid());
        assert_eq!(ctx.uid(Identity::Unprivileged), getuid());
    }

    #[test]
    fn run_as_returns_closure_value_and_restores() {
        let ctx = context();
        let before = geteuid();
        let value = ctx
            .run_as(Identity::Unprivileged, || 41 + 1)
            .expect("switch should succeed");
        assert_eq!(value, 42);
        assert_eq!(geteuid(), before);
    }

    #[test]
    fn scoped_guard_restores_on_drop() {
        let ctx = context();
        let before = geteuid();
        let guard = ctx
            .scoped(Identity::Unprivileged)
            .expect("switch should succeed");
        drop(guard);
        assert_eq!(geteuid(), before);
    }

    #[test]
    fn spawn_as_rejects_empty_command_line() {
        let ctx = context();
        let err = ctx
            .spawn_as(Identity::Unprivileged, &[])
            .expect_err("empty argv must be rejected");
        assert!(matches!(err, PrivilegeError::EmptyCommand));
    }

    #[tokio::test]
    async fn spawn_as_runs_helper_to_completion() {
        let ctx = context();
        let mut child = ctx
            .spawn_as(
                Identity::Unprivileged,
                &["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            )
            .expect("spawn should succeed");
        let status = child.wait().await.expect("wait should succeed");
        assert!(status.success());
    }
}
