//! Failure-isolated execution of transition effects.
//!
//! The executor owns every handle the effects need: the restorable
//! settings, the console device, the audio connection with its cached
//! default sink, and the helper command lines. Each effect step runs under
//! the privilege level it requires and is isolated from the others — a
//! failed ioctl or write is logged and the remaining steps of the
//! transition still run; the next transition retries independently.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::{AudioClient, AudioEvent};
use crate::events::{ChildTracker, HelperPurpose};
use crate::privilege::{Identity, PrivilegeContext};
use crate::restore::{RestorableSetting, SettingEndpoint};
use crate::state::Effect;
use crate::sysrq;
use crate::vt::VtConsole;

/// Applies planned effects against the real system (or, in tests, against
/// in-memory endpoints). Generic over the two setting endpoints so the
/// transition logic can be driven without touching `/proc` or X11.
pub struct EffectExecutor<D, L>
where
    D: SettingEndpoint<Value = String>,
    L: SettingEndpoint<Value = Vec<String>>,
{
    privilege: Arc<PrivilegeContext>,
    debug_keys: RestorableSetting<D>,
    layout: RestorableSetting<L>,
    stripped_layout: Vec<String>,
    console: Option<VtConsole>,
    audio: Option<AudioClient>,
    default_sink: Option<String>,
    mute_pending: bool,
    repair_helper: Option<Vec<String>>,
    cleanup_helper: Option<Vec<String>>,
    children: ChildTracker,
    finalized: bool,
}

impl<D, L> EffectExecutor<D, L>
where
    D: SettingEndpoint<Value = String>,
    L: SettingEndpoint<Value = Vec<String>>,
{
    pub fn new(
        privilege: Arc<PrivilegeContext>,
        debug_keys: RestorableSetting<D>,
        layout: RestorableSetting<L>,
        children: ChildTracker,
    ) -> Self {
        Self {
            privilege,
            debug_keys,
            layout,
            stripped_layout: Vec::new(),
            console: None,
            audio: None,
            default_sink: None,
            mute_pending: false,
            repair_helper: None,
            cleanup_helper: None,
            children,
            finalized: false,
        }
    }

    /// The option list to install while locked (captured list minus the
    /// terminate option).
    #[must_use]
    pub fn with_stripped_layout(mut self, options: Vec<String>) -> Self {
        self.stripped_layout = options;
        self
    }

    #[must_use]
    pub fn with_console(mut self, console: VtConsole) -> Self {
        self.console = Some(console);
        self
    }

    #[must_use]
    pub fn with_audio(mut self, audio: AudioClient) -> Self {
        self.audio = Some(audio);
        self
    }

    #[must_use]
    pub fn with_repair_helper(mut self, argv: Vec<String>) -> Self {
        self.repair_helper = Some(argv);
        self
    }

    #[must_use]
    pub fn with_cleanup_helper(mut self, argv: Vec<String>) -> Self {
        self.cleanup_helper = Some(argv);
        self
    }

    /// Runs one effect step. Never fails: problems are logged and the
    /// caller proceeds with the rest of the sequence.
    pub async fn apply(&mut self, effect: Effect) {
        debug!(?effect, "applying effect");
        match effect {
            Effect::LockVtSwitch => self.set_vt_switch_lock(true),
            Effect::UnlockVtSwitch => self.set_vt_switch_lock(false),
            Effect::SuppressDebugKeys => {
                self.debug_keys.apply(sysrq::MASK_DISABLED.to_string()).await;
            }
            Effect::ReapplyDebugKeys => self.debug_keys.reapply_original().await,
            Effect::StripLayoutEscape => {
                let stripped = self.stripped_layout.clone();
                self.layout.apply(stripped).await;
            }
            Effect::ReapplyLayoutEscape => self.layout.reapply_original().await,
            Effect::MuteAudio => self.mute_default_sink(),
            Effect::SpawnInputRepair => self.spawn_input_repair(),
        }
    }

    fn set_vt_switch_lock(&mut self, lock: bool) {
        let Some(console) = &self.console else {
            return;
        };
        let result = if lock {
            console.lock_switch(&self.privilege)
        } else {
            console.unlock_switch(&self.privilege)
        };
        if let Err(err) = result {
            warn!(lock, error = %err, "VT switch ioctl failed");
        }
    }

    /// Best-effort mute of the default sink. Skipped silently unless the
    /// audio connection is live and ready. Without a cached sink name the
    /// mute is deferred onto the server-info reply.
    pub fn mute_default_sink(&mut self) {
        let Some(audio) = self.audio.as_mut() else {
            return;
        };
        if !audio.is_ready() {
            debug!("audio connection not ready; skipping mute");
            return;
        }
        if let Some(sink) = self.default_sink.clone() {
            audio.mute_sink(&sink);
        } else {
            self.mute_pending = true;
            audio.request_default_sink();
        }
    }

    /// Refreshes the cached default sink without muting (used while the
    /// session manager is querying end-of-session readiness).
    pub fn refresh_default_sink(&mut self) {
        let Some(audio) = self.audio.as_mut() else {
            return;
        };
        if audio.is_ready() {
            audio.request_default_sink();
        }
    }

    /// Feeds one audio-connection notification.
    pub fn handle_audio_event(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::StateChanged => {
                let Some(audio) = self.audio.as_mut() else {
                    return;
                };
                if audio.is_ready() && self.default_sink.is_none() {
                    debug!("audio connection ready; priming default-sink cache");
                    audio.request_default_sink();
                }
            }
            AudioEvent::DefaultSink(Some(name)) => {
                if self.default_sink.as_deref() != Some(name.as_str()) {
                    debug!(sink = %name, "default sink cached");
                }
                self.default_sink = Some(name.clone());
                if self.mute_pending {
                    self.mute_pending = false;
                    if let Some(audio) = self.audio.as_mut() {
                        audio.mute_sink(&name);
                    }
                }
            }
            AudioEvent::DefaultSink(None) => {
                self.mute_pending = false;
            }
        }
    }

    fn spawn_input_repair(&mut self) {
        let Some(argv) = self.repair_helper.clone() else {
            return;
        };
        match self.privilege.spawn_as(Identity::Unprivileged, &argv) {
            Ok(child) => {
                info!(helper = %argv[0], "spawned input-repair helper");
                self.children.track(HelperPurpose::InputRepair, child);
            }
            Err(err) => warn!(error = %err, "failed to spawn input-repair helper"),
        }
    }

    /// Spawns the end-of-session cleanup helper under the unprivileged
    /// identity; the exit arrives on the event queue. Returns `false`
    /// when nothing was spawned (not configured, or the spawn failed) —
    /// the caller acknowledges immediately then.
    pub fn spawn_session_cleanup(&mut self) -> bool {
        let Some(argv) = self.cleanup_helper.clone() else {
            return false;
        };
        match self.privilege.spawn_as(Identity::Unprivileged, &argv) {
            Ok(child) => {
                info!(helper = %argv[0], "spawned session cleanup helper");
                self.children.track(HelperPurpose::SessionCleanup, child);
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to spawn session cleanup helper");
                false
            }
        }
    }

    /// The unlock-like restoration path. Runs exactly once; every step is
    /// attempted independently of the others' outcomes.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.set_vt_switch_lock(false);
        self.debug_keys.restore().await;
        self.layout.restore().await;
        if let Some(audio) = self.audio.as_mut() {
            audio.shutdown();
        }
    }

    /// Whether the restoration path already ran.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }
}
