//! Guard policy configuration.
//!
//! The policy table — which effects are wired to lock/unlock transitions
//! and which helper processes exist — is configuration, not code. The
//! defaults match a stock desktop; a TOML file can override any field.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::sysrq::DEFAULT_SYSRQ_PATH;
use crate::vt::{DEFAULT_CONSOLE_PATH, DEFAULT_VT_ACTIVE_PATH};

/// Configuration load errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// Guard policy and system paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Console device for the VT switch-lock ioctl.
    pub console_path: PathBuf,
    /// Kernel debug-key mask file.
    pub sysrq_path: PathBuf,
    /// Kernel attribute reporting the active virtual terminal.
    pub vt_active_path: PathBuf,
    /// Lock VT switching while the screen is locked.
    pub vt_protection: bool,
    /// Suppress the debug-key mask while the screen is locked.
    pub manage_debug_keys: bool,
    /// Strip the layout terminate option while the screen is locked.
    pub manage_layout_options: bool,
    /// Mute the default sink on lock.
    pub mute_on_lock: bool,
    /// Command line spawned (as the user) after unlock to un-stick input
    /// devices; disabled when absent.
    pub repair_helper: Option<Vec<String>>,
    /// Command line spawned (as the user) while ending the session;
    /// disabled when absent.
    pub cleanup_helper: Option<Vec<String>>,
    /// Client name used towards the session manager and the audio server.
    pub app_id: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            console_path: PathBuf::from(DEFAULT_CONSOLE_PATH),
            sysrq_path: PathBuf::from(DEFAULT_SYSRQ_PATH),
            vt_active_path: PathBuf::from(DEFAULT_VT_ACTIVE_PATH),
            vt_protection: true,
            manage_debug_keys: true,
            manage_layout_options: true,
            mute_on_lock: true,
            repair_helper: None,
            cleanup_helper: None,
            app_id: "lockguardd".to_string(),
        }
    }
}

impl GuardConfig {
    /// Loads the file if one was given; defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable or malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces the cleanup helper command line.
    #[must_use]
    pub fn with_cleanup_helper(mut self, argv: Vec<String>) -> Self {
        self.cleanup_helper = Some(argv);
        self
    }

    /// Replaces the repair helper command line.
    #[must_use]
    pub fn with_repair_helper(mut self, argv: Vec<String>) -> Self {
        self.repair_helper = Some(argv);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_point_at_stock_paths() {
        let config = GuardConfig::default();
        assert_eq!(config.sysrq_path, PathBuf::from("/proc/sys/kernel/sysrq"));
        assert_eq!(config.console_path, PathBuf::from("/dev/console"));
        assert!(config.vt_protection);
        assert!(config.repair_helper.is_none());
    }

    #[test]
    fn missing_file_argument_yields_defaults() {
        let config = GuardConfig::load(None).expect("defaults always load");
        assert_eq!(config.app_id, "lockguardd");
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            "vt_protection = false\nrepair_helper = [\"/usr/bin/xinput-repair\"]\n"
        )
        .expect("seed config");
        let config = GuardConfig::load(Some(file.path())).expect("parse should succeed");
        assert!(!config.vt_protection);
        assert_eq!(
            config.repair_helper,
            Some(vec!["/usr/bin/xinput-repair".to_string()])
        );
        assert!(config.manage_debug_keys);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "no_such_field = 1\n").expect("seed config");
        assert!(matches!(
            GuardConfig::load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }
}
