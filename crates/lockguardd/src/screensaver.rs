//! Screen-lock state notification.

use zbus::proxy;

/// `org.freedesktop.ScreenSaver` on the session bus. The guard is a
/// passive subscriber; only the lock-state signal is used.
#[proxy(
    gen_blocking = false,
    interface = "org.freedesktop.ScreenSaver",
    default_service = "org.freedesktop.ScreenSaver",
    default_path = "/org/freedesktop/ScreenSaver"
)]
pub trait ScreenSaver {
    /// Emitted when the screen lock engages (`true`) or releases.
    #[zbus(signal)]
    fn active_changed(&self, active: bool) -> zbus::Result<()>;
}
