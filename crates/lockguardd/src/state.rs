//! Lock-state machine and effect planning.
//!
//! The machine is deliberately tiny: two states, duplicate notifications
//! suppressed. What matters is what hangs off a transition — the ordered
//! effect list computed by [`plan`], which the executor then runs with
//! per-step failure isolation. Which families of effects are live is
//! decided once at startup (configuration plus capture results) and
//! recorded in [`FeatureSet`].

/// Payload of a screen-lock notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEventKind {
    /// The screen lock engaged.
    Locked,
    /// The screen lock released.
    Unlocked,
}

/// A lock-state edge actually taken by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Unlocked → Locked`.
    Lock,
    /// `Locked → Unlocked`.
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LockState {
    #[default]
    Unlocked,
    Locked,
}

/// Duplicate-suppressing two-state machine over lock notifications.
/// No terminal state: at shutdown it is abandoned wherever it stands and
/// the finalize path runs the unlock-like restoration regardless.
#[derive(Debug, Default)]
pub struct LockStateMachine {
    state: LockState,
}

impl LockStateMachine {
    /// Starts in `Unlocked`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: LockState::Unlocked,
        }
    }

    /// Feeds one notification. A redundant notification for the current
    /// state produces no transition, so effects never double-apply.
    pub fn observe(&mut self, kind: LockEventKind) -> Option<Transition> {
        match (self.state, kind) {
            (LockState::Unlocked, LockEventKind::Locked) => {
                self.state = LockState::Locked;
                Some(Transition::Lock)
            }
            (LockState::Locked, LockEventKind::Unlocked) => {
                self.state = LockState::Unlocked;
                Some(Transition::Unlock)
            }
            _ => None,
        }
    }

    /// Whether the machine currently considers the screen locked.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self.state, LockState::Locked)
    }
}

/// Which effect families are live for this process. Decided during
/// startup; a disabled family is never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSet {
    /// VT switch locking (console device available, protection enabled).
    pub vt_switch_lock: bool,
    /// Debug-key mask management (captured mask was non-zero).
    pub debug_keys: bool,
    /// Layout-option management (terminate option was present).
    pub layout_options: bool,
    /// Mute-on-lock (audio connection established).
    pub audio_mute: bool,
    /// Input-repair helper on unlock (configured).
    pub input_repair: bool,
}

/// One step of a transition's effect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    LockVtSwitch,
    UnlockVtSwitch,
    SuppressDebugKeys,
    ReapplyDebugKeys,
    StripLayoutEscape,
    ReapplyLayoutEscape,
    MuteAudio,
    SpawnInputRepair,
}

/// Ordered effect list for one transition. Ordering matters only within
/// the returned sequence.
#[must_use]
pub fn plan(transition: Transition, features: &FeatureSet) -> Vec<Effect> {
    let mut effects = Vec::new();
    match transition {
        Transition::Lock => {
            if features.vt_switch_lock {
                effects.push(Effect::LockVtSwitch);
            }
            if features.debug_keys {
                effects.push(Effect::SuppressDebugKeys);
            }
            if features.layout_options {
                effects.push(Effect::StripLayoutEscape);
            }
            if features.audio_mute {
                effects.push(Effect::MuteAudio);
            }
        }
        Transition::Unlock => {
            if features.vt_switch_lock {
                effects.push(Effect::UnlockVtSwitch);
            }
            if features.debug_keys {
                effects.push(Effect::ReapplyDebugKeys);
            }
            if features.layout_options {
                effects.push(Effect::ReapplyLayoutEscape);
            }
            if features.input_repair {
                effects.push(Effect::SpawnInputRepair);
            }
        }
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: FeatureSet = FeatureSet {
        vt_switch_lock: true,
        debug_keys: true,
        layout_options: true,
        audio_mute: true,
        input_repair: true,
    };

    #[test]
    fn duplicate_locked_notifications_transition_once() {
        let mut machine = LockStateMachine::new();
        assert_eq!(machine.observe(LockEventKind::Locked), Some(Transition::Lock));
        assert_eq!(machine.observe(LockEventKind::Locked), None);
        assert_eq!(machine.observe(LockEventKind::Locked), None);
        assert!(machine.is_locked());
        assert_eq!(
            machine.observe(LockEventKind::Unlocked),
            Some(Transition::Unlock)
        );
        assert!(!machine.is_locked());
    }

    #[test]
    fn unlocked_notification_in_initial_state_is_ignored() {
        let mut machine = LockStateMachine::new();
        assert_eq!(machine.observe(LockEventKind::Unlocked), None);
        assert!(!machine.is_locked());
    }

    #[test]
    fn transition_count_tracks_edges_not_events() {
        let mut machine = LockStateMachine::new();
        let events = [
            LockEventKind::Locked,
            LockEventKind::Locked,
            LockEventKind::Unlocked,
            LockEventKind::Unlocked,
            LockEventKind::Locked,
        ];
        let transitions = events
            .into_iter()
            .filter_map(|kind| machine.observe(kind))
            .count();
        assert_eq!(transitions, 3);
    }

    #[test]
    fn lock_plan_is_ordered_vt_first() {
        assert_eq!(
            plan(Transition::Lock, &ALL),
            vec![
                Effect::LockVtSwitch,
                Effect::SuppressDebugKeys,
                Effect::StripLayoutEscape,
                Effect::MuteAudio,
            ]
        );
    }

    #[test]
    fn unlock_plan_mirrors_lock_and_adds_repair() {
        assert_eq!(
            plan(Transition::Unlock, &ALL),
            vec![
                Effect::UnlockVtSwitch,
                Effect::ReapplyDebugKeys,
                Effect::ReapplyLayoutEscape,
                Effect::SpawnInputRepair,
            ]
        );
    }

    #[test]
    fn disabled_features_are_omitted_from_plans() {
        let features = FeatureSet {
            debug_keys: true,
            ..FeatureSet::default()
        };
        assert_eq!(
            plan(Transition::Lock, &features),
            vec![Effect::SuppressDebugKeys]
        );
        assert_eq!(
            plan(Transition::Unlock, &features),
            vec![Effect::ReapplyDebugKeys]
        );
    }

    #[test]
    fn empty_feature_set_plans_nothing() {
        assert!(plan(Transition::Lock, &FeatureSet::default()).is_empty());
        assert!(plan(Transition::Unlock, &FeatureSet::default()).is_empty());
    }
}
