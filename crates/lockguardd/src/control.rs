//! The guard's control loop.
//!
//! # Bootstrap order
//!
//! 1. Prove both identities are reachable (fatal otherwise).
//! 2. Capture the debug-key mask (fatal if unreadable) and, best-effort,
//!    the console device, the owning terminal, and the VT watch.
//! 3. Under the unprivileged identity: connect to the session bus and
//!    subscribe to the lock-state signal (fatal if unavailable), capture
//!    the layout options, start the audio connection, and register with
//!    the session manager (all best-effort).
//! 4. Regain the privileged identity and enter the loop.
//!
//! # Dispatch
//!
//! Events are processed strictly one at a time; a transition's whole
//! effect sequence completes before the next event is read, so two
//! overlapping lock/unlock transitions can never interleave their side
//! effects. The end-of-session acknowledgement is plain loop state keyed
//! on the cleanup helper's exit event, which keeps the loop draining
//! while the helper runs.
//!
//! # Finalize
//!
//! One path, run exactly once on every way out: unlock the VT switch,
//! restore every captured setting, unregister the session client, release
//! every event source, relinquish privileges.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::Connection;

use crate::audio::AudioClient;
use crate::config::GuardConfig;
use crate::error::FatalError;
use crate::events::{EventHub, GuardEvent, HelperPurpose, SessionRequest};
use crate::executor::EffectExecutor;
use crate::layout::{remove_token, LayoutOptions, TERMINATE_OPTION};
use crate::privilege::{Identity, PrivilegeContext};
use crate::restore::{RestorableSetting, SettingEndpoint};
use crate::screensaver::ScreenSaverProxy;
use crate::session::{LifecycleResponder, SessionLifecycleClient};
use crate::state::{plan, FeatureSet, LockStateMachine};
use crate::sysrq::{self, SysrqFile};
use crate::vt::{VtConsole, VtOwnership, VtWatch};

/// Loop lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Finalizing,
    Terminated,
}

enum Flow {
    Continue,
    Stop,
}

/// Owns the state machine, the executor, the event hub, and the optional
/// lifecycle responder, and turns events into effects.
pub struct ControlLoop<D, L, R>
where
    D: SettingEndpoint<Value = String>,
    L: SettingEndpoint<Value = Vec<String>>,
    R: LifecycleResponder,
{
    privilege: Arc<PrivilegeContext>,
    machine: LockStateMachine,
    features: FeatureSet,
    executor: EffectExecutor<D, L>,
    responder: Option<R>,
    hub: EventHub,
    ownership: Option<VtOwnership>,
    last_active_vt: Option<String>,
    awaiting_cleanup: bool,
    phase: Phase,
}

impl<D, L, R> ControlLoop<D, L, R>
where
    D: SettingEndpoint<Value = String>,
    L: SettingEndpoint<Value = Vec<String>>,
    R: LifecycleResponder,
{
    pub fn new(
        privilege: Arc<PrivilegeContext>,
        features: FeatureSet,
        executor: EffectExecutor<D, L>,
        hub: EventHub,
        responder: Option<R>,
    ) -> Self {
        Self {
            privilege,
            machine: LockStateMachine::new(),
            features,
            executor,
            responder,
            hub,
            ownership: None,
            last_active_vt: None,
            awaiting_cleanup: false,
            phase: Phase::Initializing,
        }
    }

    /// Records the terminal captured at startup for VT-change comparison.
    #[must_use]
    pub fn with_vt_ownership(mut self, ownership: VtOwnership) -> Self {
        self.ownership = Some(ownership);
        self
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The most recently reported active terminal.
    #[must_use]
    pub fn last_active_vt(&self) -> Option<&str> {
        self.last_active_vt.as_deref()
    }

    /// Dispatches events until a stop condition, then finalizes. The
    /// blocking wait always happens under the privileged identity; scoped
    /// drops are confined to individual operations.
    pub async fn run(&mut self) {
        self.phase = Phase::Running;
        info!("entering event loop");
        while let Some(event) = self.hub.next().await {
            if matches!(self.handle_event(event).await, Flow::Stop) {
                break;
            }
        }
        self.finalize().await;
    }

    async fn handle_event(&mut self, event: GuardEvent) -> Flow {
        match event {
            GuardEvent::Lock(lock) => {
                if let Some(transition) = self.machine.observe(lock.kind) {
                    info!(?transition, queued = ?lock.received_at.elapsed(), "lock state transition");
                    for effect in plan(transition, &self.features) {
                        self.executor.apply(effect).await;
                    }
                } else {
                    debug!(kind = ?lock.kind, "duplicate lock notification ignored");
                }
                Flow::Continue
            }
            GuardEvent::VtActive(active) => {
                self.note_active_vt(active);
                Flow::Continue
            }
            GuardEvent::Audio(event) => {
                self.executor.handle_audio_event(event);
                Flow::Continue
            }
            GuardEvent::Session(request) => self.handle_session_request(request).await,
            GuardEvent::HelperExited { purpose, status } => {
                self.handle_helper_exit(purpose, status).await
            }
            GuardEvent::Shutdown(cause) => {
                info!(?cause, "shutdown requested");
                Flow::Stop
            }
        }
    }

    fn note_active_vt(&mut self, active: String) {
        match &self.ownership {
            Some(ownership) if ownership.owns(&active) => {
                debug!(%active, "session terminal active again");
            }
            Some(ownership) => {
                info!(
                    %active,
                    owner = ownership.owning_tty(),
                    "another virtual terminal became active"
                );
            }
            None => {}
        }
        self.last_active_vt = Some(active);
    }

    async fn handle_session_request(&mut self, request: SessionRequest) -> Flow {
        match request {
            SessionRequest::QueryEndSession => {
                // Refresh the sink cache now so the eventual mute-on-end
                // has a valid target.
                self.executor.refresh_default_sink();
                if let Some(responder) = self.responder.as_mut() {
                    responder.respond_ready().await;
                }
                Flow::Continue
            }
            SessionRequest::EndSession => {
                self.executor.mute_default_sink();
                if self.executor.spawn_session_cleanup() {
                    // Keep draining events; the acknowledgement is sent
                    // when the helper's exit event arrives.
                    self.awaiting_cleanup = true;
                    Flow::Continue
                } else {
                    self.acknowledge_end().await;
                    Flow::Stop
                }
            }
            SessionRequest::Stop => {
                if let Some(responder) = self.responder.as_mut() {
                    responder.unregister().await;
                }
                Flow::Stop
            }
        }
    }

    async fn handle_helper_exit(&mut self, purpose: HelperPurpose, status: Option<i32>) -> Flow {
        match purpose {
            HelperPurpose::InputRepair => {
                debug!(?status, "input-repair helper exited");
                Flow::Continue
            }
            HelperPurpose::SessionCleanup => {
                debug!(?status, "session cleanup helper exited");
                if self.awaiting_cleanup {
                    self.awaiting_cleanup = false;
                    self.acknowledge_end().await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
        }
    }

    async fn acknowledge_end(&mut self) {
        if let Some(responder) = self.responder.as_mut() {
            responder.acknowledge_end().await;
            responder.unregister().await;
        }
    }

    /// Runs the restoration path exactly once.
    pub async fn finalize(&mut self) {
        if matches!(self.phase, Phase::Finalizing | Phase::Terminated) {
            return;
        }
        self.phase = Phase::Finalizing;
        info!("finalizing: restoring system state");
        self.executor.finalize().await;
        if let Some(responder) = self.responder.as_mut() {
            responder.unregister().await;
        }
        self.hub.release();
        self.privilege.relinquish();
        self.phase = Phase::Terminated;
    }
}

/// Bootstraps the guard against the real system and runs it to
/// completion.
///
/// # Errors
///
/// Returns a [`FatalError`] when a startup precondition fails; nothing
/// was mutated at that point beyond what its own restoration already
/// covered.
pub async fn run_guard(config: GuardConfig) -> Result<(), FatalError> {
    let privilege = Arc::new(PrivilegeContext::init()?);

    // The debug-key mask is the one capture the guard cannot do without:
    // it will be overwritten on every lock, so an unobserved original
    // could never be restored faithfully.
    let mut debug_keys =
        RestorableSetting::new(SysrqFile::new(&config.sysrq_path, Arc::clone(&privilege)));
    let mask = debug_keys.capture().await.map_err(FatalError::DebugKeys)?;

    let mut features = FeatureSet::default();
    features.debug_keys = config.manage_debug_keys && sysrq::wants_debug_key_management(&mask);
    if config.manage_debug_keys && !features.debug_keys {
        debug!(mask = %mask, "debug keys already disabled; mask management off");
    }

    let mut console = None;
    if config.vt_protection {
        match VtConsole::open(&config.console_path, &privilege) {
            Ok(handle) => {
                console = Some(handle);
                features.vt_switch_lock = true;
            }
            Err(err) => warn!(error = %err, "VT switch protection unavailable"),
        }
    }

    let ownership = match VtOwnership::capture(&config.vt_active_path) {
        Ok(ownership) => {
            debug!(tty = ownership.owning_tty(), "captured owning terminal");
            Some(ownership)
        }
        Err(err) => {
            warn!(error = %err, "active-VT attribute unreadable; VT watch disabled");
            None
        }
    };
    let vt_watch = if ownership.is_some() {
        match VtWatch::open(&config.vt_active_path) {
            Ok(watch) => Some(watch),
            Err(err) => {
                warn!(error = %err, "failed to start active-VT watch");
                None
            }
        }
    } else {
        None
    };

    let mut hub = EventHub::new();
    hub.watch_termination_signals().map_err(FatalError::Signals)?;

    // Everything session-scoped happens under the unprivileged identity:
    // those services must never observe root credentials.
    let mut layout = RestorableSetting::new(LayoutOptions::new(Arc::clone(&privilege)));
    let mut stripped_layout = Vec::new();
    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let mut audio = None;
    let session;
    let lock_stream;
    {
        let _guard = privilege.scoped(Identity::Unprivileged)?;

        let connection = Connection::session()
            .await
            .map_err(FatalError::SessionBus)?;
        let screensaver = ScreenSaverProxy::new(&connection)
            .await
            .map_err(FatalError::LockSignal)?;
        lock_stream = screensaver
            .receive_active_changed()
            .await
            .map_err(FatalError::LockSignal)?;

        if config.manage_layout_options {
            match layout.capture().await {
                Ok(options) => {
                    let (stripped, present) = remove_token(&options, TERMINATE_OPTION);
                    if present {
                        stripped_layout = stripped;
                        features.layout_options = true;
                    } else {
                        debug!("terminate option not set; layout management off");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "layout options unreadable; layout management off");
                }
            }
        }

        if config.mute_on_lock {
            match AudioClient::connect(&config.app_id, audio_tx) {
                Ok(client) => {
                    audio = Some(client);
                    features.audio_mute = true;
                }
                Err(err) => warn!(error = %err, "audio server unavailable; mute-on-lock off"),
            }
        }

        session =
            SessionLifecycleClient::register(&connection, Arc::clone(&privilege), &config.app_id)
                .await;
    }
    // Guard dropped: the loop blocks under the privileged identity again.

    hub.watch_lock_signal(lock_stream);
    if let Some(watch) = vt_watch {
        hub.watch_vt(watch);
    }
    if features.audio_mute {
        hub.watch_audio(audio_rx);
    }

    let mut executor = EffectExecutor::new(
        Arc::clone(&privilege),
        debug_keys,
        layout,
        hub.tracker(),
    )
    .with_stripped_layout(stripped_layout);
    if let Some(console) = console {
        executor = executor.with_console(console);
    }
    if let Some(client) = audio {
        executor = executor.with_audio(client);
    }
    if let Some(argv) = config.repair_helper.clone() {
        executor = executor.with_repair_helper(argv);
        features.input_repair = true;
    }
    if let Some(argv) = config.cleanup_helper.clone() {
        executor = executor.with_cleanup_helper(argv);
    }

    let mut responder = None;
    if let Some((client, streams)) = session {
        hub.watch_session(streams);
        responder = Some(client);
    }

    let mut control = ControlLoop::new(privilege, features, executor, hub, responder);
    if let Some(ownership) = ownership {
        control = control.with_vt_ownership(ownership);
    }
    control.run().await;
    Ok(())
}
