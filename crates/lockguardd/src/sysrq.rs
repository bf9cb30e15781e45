//! Kernel debug-key (sysrq) mask endpoint.
//!
//! The mask is a single global byte string under `/proc`. While the screen
//! is locked it is forced to `0` so the magic debug keys cannot bypass the
//! locker; the captured mask comes back on unlock and again at shutdown.
//! Reads and writes require the privileged identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::privilege::{Identity, PrivilegeContext};
use crate::restore::{EndpointError, SettingEndpoint};

/// Default location of the debug-key mask.
pub const DEFAULT_SYSRQ_PATH: &str = "/proc/sys/kernel/sysrq";

/// The mask value that disables all debug keys.
pub const MASK_DISABLED: &str = "0";

/// The mask is only managed when it was not already fully disabled.
#[must_use]
pub fn wants_debug_key_management(original: &str) -> bool {
    !original.is_empty() && original != MASK_DISABLED
}

/// Privileged file endpoint for the debug-key mask.
#[derive(Debug)]
pub struct SysrqFile {
    path: PathBuf,
    privilege: Arc<PrivilegeContext>,
}

impl SysrqFile {
    /// Points at the mask file; nothing is opened until first use.
    pub fn new(path: impl AsRef<Path>, privilege: Arc<PrivilegeContext>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            privilege,
        }
    }
}

impl SettingEndpoint for SysrqFile {
    type Value = String;

    fn describe(&self) -> &str {
        "kernel debug-key mask"
    }

    async fn read(&mut self) -> Result<String, EndpointError> {
        let path = self.path.clone();
        let contents = self
            .privilege
            .run_as(Identity::Privileged, || std::fs::read_to_string(&path))??;
        Ok(contents.trim().to_string())
    }

    async fn write(&mut self, value: &String) -> Result<(), EndpointError> {
        let path = self.path.clone();
        let value = value.clone();
        self.privilege
            .run_as(Identity::Privileged, move || {
                std::fs::write(&path, value.as_bytes())
            })??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::restore::RestorableSetting;

    #[test]
    fn management_predicate_follows_captured_mask() {
        assert!(wants_debug_key_management("1"));
        assert!(wants_debug_key_management("438"));
        assert!(!wants_debug_key_management("0"));
        assert!(!wants_debug_key_management(""));
    }

    #[tokio::test]
    async fn endpoint_round_trips_through_a_file() {
        let privilege = Arc::new(PrivilegeContext::init().expect("same-uid probe"));
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "438").expect("seed value");

        let mut setting = RestorableSetting::new(SysrqFile::new(file.path(), privilege));
        let mask = setting.capture().await.expect("capture should succeed");
        assert_eq!(mask, "438");

        setting.apply(MASK_DISABLED.to_string()).await;
        assert_eq!(
            std::fs::read_to_string(file.path()).expect("read back"),
            "0"
        );

        setting.restore().await;
        assert_eq!(
            std::fs::read_to_string(file.path()).expect("read back"),
            "438"
        );
    }

    #[tokio::test]
    async fn unreadable_file_reports_capture_error() {
        let privilege = Arc::new(PrivilegeContext::init().expect("same-uid probe"));
        let mut setting = RestorableSetting::new(SysrqFile::new(
            "/nonexistent/lockguardd-sysrq",
            privilege,
        ));
        let err = setting.capture().await.expect_err("capture must fail");
        assert!(err.setting.contains("debug-key"));
    }
}
