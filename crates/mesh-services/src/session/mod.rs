//! Framed sessions — one byte stream turned into a sequence of typed messages.
//!
//! A session runs three activities that coordinate only through the `closed`
//! flag: the receive loop (one task reading frames and dispatching them), the
//! periodic timers (heartbeat plus any application timers), and sends from
//! arbitrary callers serialized by the write lock.
//!
//! Lifecycle: `Connecting` → `Active` → `Closing` → `Closed`. Closed is
//! terminal; reconnecting builds a new `Session` through its [`Connector`].

mod connector;
mod table;

pub use connector::Connector;
pub use table::SessionTable;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use mesh_core::config::SessionConfig;
use mesh_core::message::UserLogin;
use mesh_core::wire::read_message;
use mesh_core::{Message, WireError};

use crate::dispatch::HandlerTable;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            heartbeat: config.heartbeat(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Credentials presented during the handshake and reused on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account: String,
}

impl Identity {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    /// Messages sent, in order, before a session counts as active.
    pub fn handshake(&self) -> [Message; 2] {
        [
            Message::ClientPing,
            Message::UserLogin(UserLogin {
                account: self.account.clone(),
            }),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[source] WireError),
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    account: String,
    peer: String,
    state: AtomicU8,
    /// Set exactly once, by whichever caller wins the close race.
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    writer: Mutex<Option<BoxedWriter>>,
    token: RwLock<Option<String>>,
    /// Heartbeat and application timers; aborted on close.
    timers: StdMutex<Vec<JoinHandle<()>>>,
    /// Pending delayed reconnect, armed after a fatal peer notice.
    reconnect: StdMutex<Option<JoinHandle<()>>>,
    connector: Option<Connector>,
    options: SessionOptions,
}

impl Session {
    /// Run a session over an already-open stream without reconnect support.
    pub async fn start<S>(
        stream: S,
        peer: impl Into<String>,
        identity: &Identity,
        handlers: Arc<HandlerTable>,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::launch(stream, peer.into(), identity, handlers, options, None).await
    }

    pub(crate) async fn launch<S>(
        stream: S,
        peer: String,
        identity: &Identity,
        handlers: Arc<HandlerTable>,
        options: SessionOptions,
        connector: Option<Connector>,
    ) -> Result<Arc<Self>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = Arc::new(Self::new(
            identity.account.clone(),
            peer,
            Some(Box::new(writer)),
            connector,
            options,
        ));

        tokio::spawn(receive_loop(session.clone(), reader, handlers));

        for message in identity.handshake() {
            if let Err(e) = session.send(&message).await {
                session.close().await;
                return Err(SessionError::Handshake(e));
            }
        }

        if session.transition(SessionState::Connecting, SessionState::Active) {
            session.arm_periodic(options.heartbeat, || Message::ClientPing);
            tracing::info!(account = %session.account, peer = %session.peer, "session established");
        }
        Ok(session)
    }

    fn new(
        account: String,
        peer: String,
        writer: Option<BoxedWriter>,
        connector: Option<Connector>,
        options: SessionOptions,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            account,
            peer,
            state: AtomicU8::new(SessionState::Connecting as u8),
            closed: AtomicBool::new(false),
            closed_tx,
            writer: Mutex::new(writer),
            token: RwLock::new(None),
            timers: StdMutex::new(Vec::new()),
            reconnect: StdMutex::new(None),
            connector,
            options,
        }
    }

    /// An active session with no stream behind it. Sends are dropped.
    #[cfg(test)]
    pub(crate) fn detached(account: &str) -> Arc<Self> {
        let session = Self::new(
            account.to_string(),
            "detached".to_string(),
            None,
            None,
            SessionOptions::default(),
        );
        session.set_state(SessionState::Active);
        Arc::new(session)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Resolves once the session has begun closing.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !self.is_closed() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Frame and write `message`. A no-op once the session is closing.
    ///
    /// A write failure closes the session before the error is returned.
    pub async fn send(&self, message: &Message) -> Result<(), WireError> {
        let frame = message.encode()?;

        let mut guard = self.writer.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        // A write stalled on a peer that stopped reading must not keep the
        // lock from `close`.
        let result = tokio::select! {
            biased;
            _ = self.wait_closed() => return Ok(()),
            result = write_frame(writer, &frame) => result,
        };
        drop(guard);

        if let Err(e) = result {
            tracing::warn!(
                account = %self.account,
                message_id = ?message.id(),
                error = %e,
                "session write failed"
            );
            self.close().await;
            return Err(WireError::Io(e));
        }
        Ok(())
    }

    /// Release the stream and timers once. The table entry is left alone so
    /// a scheduled reconnect stays reachable from `SessionTable::close_all`.
    async fn teardown(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.set_state(SessionState::Closing);
        self.closed_tx.send_replace(true);

        // Timers go before the first await. A timer task that is itself
        // closing after a failed send is left to finish the teardown.
        let current = tokio::task::try_id();
        for timer in lock(&self.timers).drain(..) {
            if Some(timer.id()) != current {
                timer.abort();
            }
        }
        if let Some(pending) = lock(&self.reconnect).take() {
            pending.abort();
        }

        // An in-flight send sees `closed` and releases the lock.
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(account = %self.account, error = %e, "stream shutdown failed");
            }
        }

        self.set_state(SessionState::Closed);
        tracing::info!(account = %self.account, peer = %self.peer, "session closed");
        true
    }

    /// Close the session and drop its table entry. Returns true only for
    /// the caller that performed the teardown; every other call is a no-op.
    pub async fn close(&self) -> bool {
        if !self.teardown().await {
            return false;
        }
        self.leave_table();
        true
    }

    /// Remove the table entry if it still points at this session.
    fn leave_table(&self) {
        if let Some(connector) = &self.connector {
            connector.table().remove_session(self);
        }
    }

    /// Send `make()` every `period`, first after one full period. Cancelled
    /// with the session; arming a closed session does nothing.
    pub fn arm_periodic<F>(self: &Arc<Self>, period: Duration, make: F)
    where
        F: Fn() -> Message + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(periodic(weak, period, make));

        let mut timers = lock(&self.timers);
        if self.is_closed() {
            handle.abort();
        } else {
            timers.push(handle);
        }
    }

    /// Drop a pending delayed reconnect, if any.
    pub fn cancel_reconnect(&self) -> bool {
        match lock(&self.reconnect).take() {
            Some(pending) => {
                pending.abort();
                true
            }
            None => false,
        }
    }

    pub fn reconnect_pending(&self) -> bool {
        lock(&self.reconnect)
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }

    /// Arm a one-shot reconnect after the configured delay. The closed
    /// session keeps its table entry until the replacement takes it over.
    fn schedule_reconnect(self: &Arc<Self>) {
        let Some(connector) = self.connector.clone() else {
            tracing::warn!(account = %self.account, "peer requested reconnect but session has no connector");
            return;
        };
        if connector.table().is_shutting_down() {
            self.leave_table();
            return;
        }

        let delay = self.options.reconnect_delay;
        tracing::info!(
            account = %self.account,
            peer = %self.peer,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        let previous = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if connector.table().is_shutting_down() {
                return;
            }
            if let Err(e) = connector.connect().await {
                tracing::error!(
                    account = %connector.identity().account,
                    error = %e,
                    "reconnect failed"
                );
                if let Some(previous) = previous.upgrade() {
                    previous.leave_table();
                }
            }
        });
        *lock(&self.reconnect) = Some(handle);
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn periodic<F>(session: Weak<Session>, period: Duration, make: F)
where
    F: Fn() -> Message + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() || session.send(&make()).await.is_err() {
            return;
        }
    }
}

async fn receive_loop<R>(session: Arc<Session>, mut reader: R, handlers: Arc<HandlerTable>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut closed = session.closed_tx.subscribe();

    while !session.is_closed() {
        let result = tokio::select! {
            biased;
            _ = closed.changed() => break,
            result = read_message(&mut reader) => result,
        };

        match result {
            Ok(message) if message.is_fatal_notice() => {
                tracing::warn!(account = %session.account, peer = %session.peer, "peer reported system error");
                if session.teardown().await {
                    session.schedule_reconnect();
                }
                break;
            }
            Ok(message) => {
                handlers.dispatch(&session, message).await;
            }
            Err(e) => {
                if session.is_closed() {
                    tracing::debug!(account = %session.account, error = %e, "read ended after close");
                } else {
                    match e {
                        WireError::UnknownMessageType(id) => tracing::warn!(
                            account = %session.account,
                            type_id = id,
                            "unknown message type, closing session"
                        ),
                        WireError::ShortRead(_) => tracing::info!(
                            account = %session.account,
                            peer = %session.peer,
                            "stream ended, closing session"
                        ),
                        ref other => tracing::warn!(
                            account = %session.account,
                            error = %other,
                            "frame decode failed, closing session"
                        ),
                    }
                    session.close().await;
                }
                break;
            }
        }
    }
}
