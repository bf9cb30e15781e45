//! Capture/restore tracking for shared system settings.
//!
//! The guard mutates settings it does not own exclusively (the kernel
//! debug-key mask, the session's keyboard-layout options). It therefore
//! never assumes a value it did not observe itself: every managed setting
//! is captured once before the first mutation, and the captured original is
//! written back exactly once from the single finalize routine, no matter
//! how the process terminates.
//!
//! # Lifecycle
//!
//! ```text
//! NotCaptured --capture()--> Captured { original, current }
//!                                |            |
//!                             apply()    reapply_original()
//!                                |            |
//!                                +--restore()-+--> Restored
//! ```
//!
//! A failed capture leaves the setting permanently in `NotCaptured`; every
//! later `apply`/`reapply_original`/`restore` call is then a no-op, which
//! is how a missing feature degrades without special-casing at call sites.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::privilege::PrivilegeError;

/// Error from reading or writing a setting's external store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The required identity could not be acquired.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// The store answered but is unusable (bad exit status, missing data).
    #[error("{0}")]
    Unavailable(String),
}

/// Error from [`RestorableSetting::capture`].
#[derive(Debug, Error)]
#[error("failed to capture {setting}: {source}")]
pub struct CaptureError {
    /// Human-readable setting name.
    pub setting: String,
    /// The underlying endpoint failure.
    #[source]
    pub source: EndpointError,
}

/// One externally owned mutable value the guard can read and write.
#[allow(async_fn_in_trait)]
pub trait SettingEndpoint {
    /// The value stored at the endpoint.
    type Value: Clone + PartialEq + fmt::Debug;

    /// Human-readable name for logs and errors.
    fn describe(&self) -> &str;

    /// Reads the current external value.
    async fn read(&mut self) -> Result<Self::Value, EndpointError>;

    /// Writes a new external value.
    async fn write(&mut self, value: &Self::Value) -> Result<(), EndpointError>;
}

#[derive(Debug)]
enum Lifecycle<T> {
    NotCaptured,
    Captured { original: T, current: T },
    Restored,
}

/// Capture-once / restore-once wrapper around a [`SettingEndpoint`].
#[derive(Debug)]
pub struct RestorableSetting<E: SettingEndpoint> {
    endpoint: E,
    lifecycle: Lifecycle<E::Value>,
}

impl<E: SettingEndpoint> RestorableSetting<E> {
    /// Wraps an endpoint; nothing is read until [`capture`](Self::capture).
    pub const fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            lifecycle: Lifecycle::NotCaptured,
        }
    }

    /// Reads and records the current external value. The recorded original
    /// is immutable afterwards; a repeated call returns it without
    /// re-reading.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] when the store is unreadable. The setting
    /// then stays uncaptured and all later operations on it are no-ops.
    pub async fn capture(&mut self) -> Result<E::Value, CaptureError> {
        if let Lifecycle::Captured { original, .. } = &self.lifecycle {
            return Ok(original.clone());
        }
        match self.endpoint.read().await {
            Ok(value) => {
                debug!(
                    setting = self.endpoint.describe(),
                    value = ?value,
                    "captured original value"
                );
                self.lifecycle = Lifecycle::Captured {
                    original: value.clone(),
                    current: value.clone(),
                };
                Ok(value)
            }
            Err(source) => Err(CaptureError {
                setting: self.endpoint.describe().to_string(),
                source,
            }),
        }
    }

    /// Whether a capture has succeeded.
    #[must_use]
    pub const fn is_captured(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Captured { .. })
    }

    /// The captured original, if any.
    #[must_use]
    pub const fn original(&self) -> Option<&E::Value> {
        match &self.lifecycle {
            Lifecycle::Captured { original, .. } => Some(original),
            _ => None,
        }
    }

    /// Writes a new value. A write failure is logged and leaves the
    /// tracked current value unchanged — the store simply kept its old
    /// value, and the next transition retries independently. No-op unless
    /// captured.
    pub async fn apply(&mut self, value: E::Value) {
        let Lifecycle::Captured { current, .. } = &mut self.lifecycle else {
            return;
        };
        match self.endpoint.write(&value).await {
            Ok(()) => {
                *current = value;
            }
            Err(err) => {
                warn!(
                    setting = self.endpoint.describe(),
                    value = ?value,
                    error = %err,
                    "failed to apply value"
                );
            }
        }
    }

    /// Writes the captured original back as a regular apply (the unlock
    /// path). Unlike [`restore`](Self::restore) this can run any number of
    /// times and keeps the setting live.
    pub async fn reapply_original(&mut self) {
        let Lifecycle::Captured { original, .. } = &self.lifecycle else {
            return;
        };
        let original = original.clone();
        self.apply(original).await;
    }

    /// Final restoration: writes the original back if the current value
    /// diverged. At most one write per process lifetime; later calls (and
    /// calls on an uncaptured setting) are no-ops.
    pub async fn restore(&mut self) {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Restored) {
            Lifecycle::NotCaptured => {
                self.lifecycle = Lifecycle::NotCaptured;
            }
            Lifecycle::Restored => {}
            Lifecycle::Captured { original, current } => {
                if current == original {
                    return;
                }
                debug!(
                    setting = self.endpoint.describe(),
                    value = ?original,
                    "restoring original value"
                );
                if let Err(err) = self.endpoint.write(&original).await {
                    warn!(
                        setting = self.endpoint.describe(),
                        error = %err,
                        "failed to restore original value"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEndpoint {
        value: String,
        reads: usize,
        writes: Vec<String>,
        fail_read: bool,
        fail_write: bool,
    }

    impl FakeEndpoint {
        fn new(value: &str) -> Self {
            Self {
                value: value.to_string(),
                reads: 0,
                writes: Vec::new(),
                fail_read: false,
                fail_write: false,
            }
        }
    }

    impl SettingEndpoint for FakeEndpoint {
        type Value = String;

        fn describe(&self) -> &str {
            "fake setting"
        }

        async fn read(&mut self) -> Result<String, EndpointError> {
            self.reads += 1;
            if self.fail_read {
                return Err(EndpointError::Unavailable("forced read failure".into()));
            }
            Ok(self.value.clone())
        }

        async fn write(&mut self, value: &String) -> Result<(), EndpointError> {
            if self.fail_write {
                return Err(EndpointError::Unavailable("forced write failure".into()));
            }
            self.value = value.clone();
            self.writes.push(value.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn restore_returns_to_captured_value() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("1"));
        setting.capture().await.expect("capture should succeed");
        setting.apply("0".to_string()).await;
        assert_eq!(setting.endpoint.value, "0");
        setting.restore().await;
        assert_eq!(setting.endpoint.value, "1");
    }

    #[tokio::test]
    async fn restore_without_divergence_writes_nothing() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("438"));
        setting.capture().await.expect("capture should succeed");
        setting.restore().await;
        assert!(setting.endpoint.writes.is_empty());
    }

    #[tokio::test]
    async fn restore_runs_at_most_once() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("1"));
        setting.capture().await.expect("capture should succeed");
        setting.apply("0".to_string()).await;
        setting.restore().await;
        setting.restore().await;
        setting.restore().await;
        assert_eq!(setting.endpoint.writes, vec!["0", "1"]);
    }

    #[tokio::test]
    async fn failed_capture_disables_all_later_operations() {
        let mut endpoint = FakeEndpoint::new("1");
        endpoint.fail_read = true;
        let mut setting = RestorableSetting::new(endpoint);
        setting.capture().await.expect_err("capture must fail");
        setting.apply("0".to_string()).await;
        setting.reapply_original().await;
        setting.restore().await;
        assert!(setting.endpoint.writes.is_empty());
        assert_eq!(setting.endpoint.value, "1");
    }

    #[tokio::test]
    async fn failed_apply_keeps_tracked_value() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("1"));
        setting.capture().await.expect("capture should succeed");
        setting.endpoint.fail_write = true;
        setting.apply("0".to_string()).await;
        setting.endpoint.fail_write = false;
        // The apply never took effect, so there is nothing to restore.
        setting.restore().await;
        assert!(setting.endpoint.writes.is_empty());
    }

    #[tokio::test]
    async fn reapply_original_writes_captured_value() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("176"));
        setting.capture().await.expect("capture should succeed");
        setting.apply("0".to_string()).await;
        setting.reapply_original().await;
        assert_eq!(setting.endpoint.writes, vec!["0", "176"]);
        assert_eq!(setting.endpoint.value, "176");
    }

    #[tokio::test]
    async fn second_capture_does_not_reread() {
        let mut setting = RestorableSetting::new(FakeEndpoint::new("1"));
        setting.capture().await.expect("capture should succeed");
        setting.apply("0".to_string()).await;
        let original = setting.capture().await.expect("repeat capture is a no-op");
        assert_eq!(original, "1");
        assert_eq!(setting.endpoint.reads, 1);
    }
}
