//! Unified event delivery for the control loop.
//!
//! Every notification source — bus signal streams, the sysfs VT watch,
//! audio-connection callbacks, child-process reapers, termination signals
//! — is funneled into one queue as a [`GuardEvent`]. The loop reads the
//! queue one event at a time and fully processes each before the next,
//! which is the whole serialization story: forwarder tasks never touch
//! guard state.
//!
//! The hub owns every source and releases them exactly once, either
//! through [`EventHub::release`] or when a source signals end-of-stream.

use std::time::Instant;

use futures_util::StreamExt;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::AudioEvent;
use crate::screensaver::ActiveChangedStream;
use crate::session::SessionStreams;
use crate::state::LockEventKind;
use crate::vt::VtWatch;

/// Screen-lock notification as seen by the state machine.
#[derive(Debug, Clone, Copy)]
pub struct LockEvent {
    /// Locked or unlocked.
    pub kind: LockEventKind,
    /// When the signal arrived at the guard.
    pub received_at: Instant,
}

impl LockEvent {
    #[must_use]
    pub fn now(kind: LockEventKind) -> Self {
        Self {
            kind,
            received_at: Instant::now(),
        }
    }
}

/// Why the loop is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGINT or SIGTERM.
    Signal,
    /// The lock-state signal stream ended; the guard has no purpose
    /// without it.
    LockSignalGone,
}

/// What a reaped helper process was spawned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperPurpose {
    /// Post-unlock input-repair helper.
    InputRepair,
    /// End-of-session cleanup helper.
    SessionCleanup,
}

/// Inbound session-manager request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    QueryEndSession,
    EndSession,
    Stop,
}

/// One notification from any event source.
#[derive(Debug)]
pub enum GuardEvent {
    /// Lock-state signal.
    Lock(LockEvent),
    /// The active virtual terminal changed.
    VtActive(String),
    /// Audio-connection notification.
    Audio(AudioEvent),
    /// Session-manager lifecycle request.
    Session(SessionRequest),
    /// A tracked helper process exited.
    HelperExited {
        purpose: HelperPurpose,
        status: Option<i32>,
    },
    /// Graceful shutdown request.
    Shutdown(ShutdownCause),
}

/// Hands spawned helpers to a reaper task; the exit arrives as an event,
/// so waiting for a helper never blocks dispatch.
#[derive(Debug, Clone)]
pub struct ChildTracker {
    tx: UnboundedSender<GuardEvent>,
}

impl ChildTracker {
    pub fn track(&self, purpose: HelperPurpose, mut child: Child) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(error = %err, "failed to wait for helper");
                    None
                }
            };
            let _ = tx.send(GuardEvent::HelperExited { purpose, status });
        });
    }
}

/// Owns every event source and funnels them into one queue.
pub struct EventHub {
    tx: UnboundedSender<GuardEvent>,
    rx: UnboundedReceiver<GuardEvent>,
    forwarders: Vec<JoinHandle<()>>,
    released: bool,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            forwarders: Vec::new(),
            released: false,
        }
    }

    /// A sender for injecting events (used by sources wired elsewhere).
    #[must_use]
    pub fn sender(&self) -> UnboundedSender<GuardEvent> {
        self.tx.clone()
    }

    /// A tracker handle for helper processes.
    #[must_use]
    pub fn tracker(&self) -> ChildTracker {
        ChildTracker {
            tx: self.tx.clone(),
        }
    }

    /// Receives the next event; `None` once all senders are gone.
    pub async fn next(&mut self) -> Option<GuardEvent> {
        self.rx.recv().await
    }

    /// SIGINT and SIGTERM both request graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error when a signal handler cannot be installed.
    pub fn watch_termination_signals(&mut self) -> std::io::Result<()> {
        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            let mut stream = signal(kind)?;
            let tx = self.tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    let _ = tx.send(GuardEvent::Shutdown(ShutdownCause::Signal));
                }
            }));
        }
        Ok(())
    }

    /// Forwards the lock-state signal; its end-of-stream also ends the
    /// guard.
    pub fn watch_lock_signal(&mut self, mut stream: ActiveChangedStream) {
        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                match change.args() {
                    Ok(args) => {
                        let kind = if *args.active() {
                            LockEventKind::Locked
                        } else {
                            LockEventKind::Unlocked
                        };
                        if tx.send(GuardEvent::Lock(LockEvent::now(kind))).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "malformed lock-state signal"),
                }
            }
            debug!("lock-state signal stream ended");
            let _ = tx.send(GuardEvent::Shutdown(ShutdownCause::LockSignalGone));
        }));
    }

    /// Forwards active-VT changes until the watch fails.
    pub fn watch_vt(&mut self, mut watch: VtWatch) {
        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            loop {
                match watch.next_active().await {
                    Ok(active) => {
                        if tx.send(GuardEvent::VtActive(active)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "active-VT watch failed");
                        return;
                    }
                }
            }
        }));
    }

    /// Forwards audio-connection notifications.
    pub fn watch_audio(&mut self, mut events: UnboundedReceiver<AudioEvent>) {
        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(GuardEvent::Audio(event)).is_err() {
                    return;
                }
            }
        }));
    }

    /// Forwards the three session-manager lifecycle signals.
    pub fn watch_session(&mut self, streams: SessionStreams) {
        let SessionStreams {
            mut query_end_session,
            mut end_session,
            mut stop,
        } = streams;

        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while query_end_session.next().await.is_some() {
                if tx
                    .send(GuardEvent::Session(SessionRequest::QueryEndSession))
                    .is_err()
                {
                    return;
                }
            }
        }));

        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while end_session.next().await.is_some() {
                if tx
                    .send(GuardEvent::Session(SessionRequest::EndSession))
                    .is_err()
                {
                    return;
                }
            }
        }));

        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while stop.next().await.is_some() {
                if tx.send(GuardEvent::Session(SessionRequest::Stop)).is_err() {
                    return;
                }
            }
        }));
    }

    /// Releases every source. Safe to call more than once; only the first
    /// call does anything.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracked_child_exit_arrives_as_event() {
        let mut hub = EventHub::new();
        let tracker = hub.tracker();
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 7")
            .spawn()
            .expect("spawn should succeed");
        tracker.track(HelperPurpose::SessionCleanup, child);

        match hub.next().await {
            Some(GuardEvent::HelperExited { purpose, status }) => {
                assert_eq!(purpose, HelperPurpose::SessionCleanup);
                assert_eq!(status, Some(7));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mut hub = EventHub::new();
        hub.watch_termination_signals()
            .expect("signal handlers should install");
        hub.release();
        hub.release();
        assert!(hub.forwarders.is_empty());
    }

    #[tokio::test]
    async fn injected_events_preserve_order() {
        let mut hub = EventHub::new();
        let tx = hub.sender();
        tx.send(GuardEvent::Lock(LockEvent::now(LockEventKind::Locked)))
            .expect("send");
        tx.send(GuardEvent::VtActive("tty3".to_string())).expect("send");

        assert!(matches!(hub.next().await, Some(GuardEvent::Lock(_))));
        match hub.next().await {
            Some(GuardEvent::VtActive(active)) => assert_eq!(active, "tty3"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
