//! Audio-server connection for mute-on-lock.
//!
//! The connection runs over the audio server's native protocol with its own
//! callback thread; every callback only forwards a notification into the
//! guard's single event queue, so all decisions stay on the control loop.
//! "Not yet ready" is an expected state — any mute request while the
//! connection is down or still handshaking is silently skipped.

use libpulse_binding as pulse;
use pulse::context::{Context, FlagSet, State};
use pulse::mainloop::threaded::Mainloop;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Notifications from the audio connection, delivered on the guard's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
    /// The connection state moved; the loop re-queries readiness.
    StateChanged,
    /// Reply to a server-info query with the default sink name, if any.
    DefaultSink(Option<String>),
}

/// Audio connection setup errors. All of them degrade the mute feature
/// rather than aborting startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AudioError {
    /// The callback mainloop could not be created.
    #[error("failed to create audio mainloop")]
    MainloopCreate,

    /// The callback mainloop could not be started.
    #[error("failed to start audio mainloop: {0}")]
    MainloopStart(pulse::error::PAErr),

    /// The server context could not be created.
    #[error("failed to create audio context")]
    ContextCreate,

    /// The connection attempt was rejected outright.
    #[error("failed to connect to audio server: {0}")]
    Connect(pulse::error::PAErr),
}

/// Handle to the audio server. Owned by the effect executor; all methods
/// lock the callback mainloop around the underlying context calls.
pub struct AudioClient {
    mainloop: Mainloop,
    context: Context,
    events: UnboundedSender<AudioEvent>,
}

impl AudioClient {
    /// Starts the callback mainloop and begins connecting. The connection
    /// completes asynchronously; progress arrives as
    /// [`AudioEvent::StateChanged`] on `events`. The server is never
    /// auto-spawned.
    ///
    /// # Errors
    ///
    /// Returns an error when the mainloop or context cannot be set up; the
    /// caller disables the mute feature for the process lifetime.
    pub fn connect(
        client_name: &str,
        events: UnboundedSender<AudioEvent>,
    ) -> Result<Self, AudioError> {
        let mut mainloop = Mainloop::new().ok_or(AudioError::MainloopCreate)?;
        mainloop.start().map_err(AudioError::MainloopStart)?;

        mainloop.lock();
        let mut context = match Context::new(&mainloop, client_name) {
            Some(context) => context,
            None => {
                mainloop.unlock();
                mainloop.stop();
                return Err(AudioError::ContextCreate);
            }
        };
        {
            let events = events.clone();
            context.set_state_callback(Some(Box::new(move || {
                let _ = events.send(AudioEvent::StateChanged);
            })));
        }
        if let Err(err) = context.connect(None, FlagSet::NOAUTOSPAWN, None) {
            mainloop.unlock();
            mainloop.stop();
            return Err(AudioError::Connect(err));
        }
        mainloop.unlock();

        debug!(client = client_name, "audio connection started");
        Ok(Self {
            mainloop,
            context,
            events,
        })
    }

    /// Whether the server connection is live and ready for commands.
    #[must_use]
    pub fn is_ready(&mut self) -> bool {
        self.mainloop.lock();
        let state = self.context.get_state();
        self.mainloop.unlock();
        matches!(state, State::Ready)
    }

    /// Asks the server for its info; the default sink name arrives as
    /// [`AudioEvent::DefaultSink`].
    pub fn request_default_sink(&mut self) {
        let events = self.events.clone();
        self.mainloop.lock();
        let _operation = self.context.introspect().get_server_info(move |info| {
            let sink = info
                .default_sink_name
                .as_ref()
                .map(|name| name.to_string());
            let _ = events.send(AudioEvent::DefaultSink(sink));
        });
        self.mainloop.unlock();
    }

    /// Mutes the named sink. Fire-and-forget.
    pub fn mute_sink(&mut self, sink: &str) {
        debug!(sink, "muting sink");
        self.mainloop.lock();
        let mut introspector = self.context.introspect();
        let _operation = introspector.set_sink_mute_by_name(sink, true, None);
        self.mainloop.unlock();
    }

    /// Tears the connection down. Called once from finalize.
    pub fn shutdown(&mut self) {
        self.mainloop.lock();
        self.context.disconnect();
        self.mainloop.unlock();
        self.mainloop.stop();
    }
}
