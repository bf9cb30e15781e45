//! Session-manager lifecycle integration.
//!
//! Entirely optional: the client only exists when the session manager
//! handed the process an autostart token through the environment. The
//! token is consumed (and removed from the environment, so spawned helpers
//! never re-trigger registration) during startup. Once registered, the
//! guard answers three inbound requests — query-end-of-session, end
//! session, stop — and unregisters exactly once before exit.
//!
//! All session-bus traffic runs under the unprivileged identity.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy, Connection};

use crate::privilege::{Identity, PrivilegeContext, PrivilegeError};

/// Environment variable carrying the autostart token.
pub const AUTOSTART_ID_VAR: &str = "DESKTOP_AUTOSTART_ID";

/// `org.gnome.SessionManager` main interface (registration only).
#[proxy(
    gen_blocking = false,
    interface = "org.gnome.SessionManager",
    default_service = "org.gnome.SessionManager",
    default_path = "/org/gnome/SessionManager"
)]
pub trait SessionManager {
    fn register_client(
        &self,
        app_id: &str,
        client_startup_id: &str,
    ) -> zbus::Result<OwnedObjectPath>;

    fn unregister_client(
        &self,
        client_id: &zbus::zvariant::ObjectPath<'_>,
    ) -> zbus::Result<()>;
}

/// Per-client private interface at the object path returned by
/// registration.
#[proxy(
    gen_blocking = false,
    interface = "org.gnome.SessionManager.ClientPrivate",
    default_service = "org.gnome.SessionManager"
)]
pub trait ClientPrivate {
    fn end_session_response(&self, is_ok: bool, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn query_end_session(&self, flags: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn end_session(&self, flags: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn stop(&self) -> zbus::Result<()>;
}

/// Registration/communication failures. All of them degrade the feature.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Bus-level failure.
    #[error(transparent)]
    Bus(#[from] zbus::Error),

    /// The unprivileged identity could not be acquired.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

/// The three lifecycle signal streams, handed to the event hub.
pub struct SessionStreams {
    pub query_end_session: QueryEndSessionStream,
    pub end_session: EndSessionStream,
    pub stop: StopStream,
}

/// Answers the session manager's lifecycle requests. The dispatch loop
/// only sees this seam, which keeps end-of-session ordering testable.
#[allow(async_fn_in_trait)]
pub trait LifecycleResponder {
    /// Acknowledges `QueryEndSession` ("ready to end").
    async fn respond_ready(&mut self);

    /// Acknowledges `EndSession` after the local effects completed.
    async fn acknowledge_end(&mut self);

    /// Releases the registration. Idempotent.
    async fn unregister(&mut self);
}

/// Live registration with the session manager.
pub struct SessionLifecycleClient {
    manager: SessionManagerProxy<'static>,
    client: ClientPrivateProxy<'static>,
    client_path: OwnedObjectPath,
    privilege: Arc<PrivilegeContext>,
    registered: bool,
}

impl SessionLifecycleClient {
    /// Registers with the session manager if an autostart token is present
    /// in the environment. The token is removed from the environment
    /// either way. Any failure is logged and reported as "no client" —
    /// the guard runs without session-manager integration then.
    pub async fn register(
        connection: &Connection,
        privilege: Arc<PrivilegeContext>,
        app_id: &str,
    ) -> Option<(Self, SessionStreams)> {
        let token = match std::env::var(AUTOSTART_ID_VAR) {
            Ok(token) => token,
            Err(_) => {
                debug!("no autostart token; running without session manager");
                return None;
            }
        };
        std::env::remove_var(AUTOSTART_ID_VAR);

        match Self::register_with_token(connection, privilege, app_id, &token).await {
            Ok(pair) => Some(pair),
            Err(err) => {
                warn!(error = %err, "session-manager registration unavailable");
                None
            }
        }
    }

    async fn register_with_token(
        connection: &Connection,
        privilege: Arc<PrivilegeContext>,
        app_id: &str,
        token: &str,
    ) -> Result<(Self, SessionStreams), SessionError> {
        let _guard = privilege.scoped(Identity::Unprivileged)?;

        let manager = SessionManagerProxy::new(connection).await?;
        let client_path = manager.register_client(app_id, token).await?;
        let client = ClientPrivateProxy::builder(connection)
            .path(client_path.clone())?
            .build()
            .await?;

        let streams = SessionStreams {
            query_end_session: client.receive_query_end_session().await?,
            end_session: client.receive_end_session().await?,
            stop: client.receive_stop().await?,
        };

        info!(client = %client_path, "registered with session manager");
        Ok((
            Self {
                manager,
                client,
                client_path,
                privilege,
                registered: true,
            },
            streams,
        ))
    }

    async fn send_end_session_response(&self) {
        let result: Result<(), SessionError> = async {
            let _guard = self.privilege.scoped(Identity::Unprivileged)?;
            self.client.end_session_response(true, "").await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to answer session manager");
        }
    }
}

impl LifecycleResponder for SessionLifecycleClient {
    async fn respond_ready(&mut self) {
        self.send_end_session_response().await;
    }

    async fn acknowledge_end(&mut self) {
        self.send_end_session_response().await;
    }

    async fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let result: Result<(), SessionError> = async {
            let _guard = self.privilege.scoped(Identity::Unprivileged)?;
            self.manager.unregister_client(&self.client_path).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => debug!(client = %self.client_path, "unregistered from session manager"),
            Err(err) => warn!(error = %err, "failed to unregister from session manager"),
        }
    }
}
