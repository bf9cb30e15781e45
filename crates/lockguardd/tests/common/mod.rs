//! Shared fixtures for the dispatch-loop tests.

use std::fmt;
use std::sync::{Arc, Mutex};

use lockguardd::restore::{EndpointError, SettingEndpoint};
use lockguardd::session::LifecycleResponder;

/// Chronological record shared by every fixture, so ordering across
/// setting writes and lifecycle responses can be asserted.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().expect("journal lock").clone()
}

/// In-memory setting store that journals every write.
pub struct MemoryEndpoint<T> {
    name: &'static str,
    value: T,
    journal: Journal,
}

impl<T> MemoryEndpoint<T> {
    pub fn new(name: &'static str, value: T, journal: Journal) -> Self {
        Self {
            name,
            value,
            journal,
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug> SettingEndpoint for MemoryEndpoint<T> {
    type Value = T;

    fn describe(&self) -> &str {
        self.name
    }

    async fn read(&mut self) -> Result<T, EndpointError> {
        Ok(self.value.clone())
    }

    async fn write(&mut self, value: &T) -> Result<(), EndpointError> {
        self.value = value.clone();
        self.journal
            .lock()
            .expect("journal lock")
            .push(format!("{}={:?}", self.name, value));
        Ok(())
    }
}

/// Lifecycle responder that journals each response. Unregistration is
/// idempotent like the real client's.
pub struct RecordingResponder {
    journal: Journal,
    unregistered: bool,
}

impl RecordingResponder {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            unregistered: false,
        }
    }

    fn push(&self, entry: &str) {
        self.journal
            .lock()
            .expect("journal lock")
            .push(entry.to_string());
    }
}

impl LifecycleResponder for RecordingResponder {
    async fn respond_ready(&mut self) {
        self.push("respond_ready");
    }

    async fn acknowledge_end(&mut self) {
        self.push("acknowledge_end");
    }

    async fn unregister(&mut self) {
        if self.unregistered {
            return;
        }
        self.unregistered = true;
        self.push("unregister");
    }
}
