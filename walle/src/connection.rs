use std::{
    collections::BTreeSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Mutex, watch};

use crate::{
    InterfaceKey, ServerAddress, ServerUrl, State,
    app::AppShared,
    error::{Error, ErrorKind, Result},
    msg::{BizRequest, BizResponse, Message},
    session::Session,
};

/// Lifecycle of a [`Connection`]. `Init` is the only entry state and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Closed,
}

/// One stateful session to a single server address.
///
/// The address is fixed at construction and is the identity of the
/// connection: equality and hashing look at nothing else. Transitions are
/// serialized by an async mutex that also guards the live session, so
/// concurrent `open`, `reconnect` and `close` calls never interleave.
pub struct Connection {
    url: ServerUrl,
    interfaces: BTreeSet<InterfaceKey>,
    state: Arc<State>,
    app: Option<Weak<AppShared>>,
    session: Mutex<Option<Session>>,
    status: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
}

impl Connection {
    /// Creates a connection that is not owned by any app. Reconnects are
    /// never refused for it.
    #[must_use]
    pub fn standalone(
        state: Arc<State>,
        url: ServerUrl,
        interfaces: BTreeSet<InterfaceKey>,
    ) -> Arc<Self> {
        Self::new(state, url, interfaces, None)
    }

    pub(crate) fn new(
        state: Arc<State>,
        url: ServerUrl,
        interfaces: BTreeSet<InterfaceKey>,
        app: Option<Weak<AppShared>>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionState::Init);
        Arc::new(Self {
            url,
            interfaces,
            state,
            app,
            session: Mutex::new(None),
            status,
            reconnecting: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.url.address
    }

    #[must_use]
    pub fn url(&self) -> &ServerUrl {
        &self.url
    }

    #[must_use]
    pub fn interfaces(&self) -> &BTreeSet<InterfaceKey> {
        &self.interfaces
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        let old = self.status.send_replace(state);
        if old != state {
            tracing::debug!("connection {} {old:?} -> {state:?}", self.address());
        }
    }

    /// Establishes a session. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once the connection is closing or closed,
    /// and `ConnectFailed` if the transport fails or the connect timeout
    /// elapses. A failed open leaves the connection `Disconnected` and
    /// eligible for retry.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let mut session = self.session.lock().await;
        self.open_locked(&mut session).await
    }

    async fn open_locked(self: &Arc<Self>, session: &mut Option<Session>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(Error::new(
                    ErrorKind::ConnectionClosed,
                    format!("connection {} is closed", self.address()),
                ));
            }
            ConnectionState::Init
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {}
        }

        self.set_state(ConnectionState::Connecting);
        let timeout = self.state.config.connect_timeout;
        let connect = self.state.connector.connect(self.address());
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(Error::new(
                    ErrorKind::ConnectFailed,
                    format!("connect to {} timed out after {timeout:?}", self.address()),
                ));
            }
        };

        if let Some(old) = session.take() {
            tracing::info!("close stale session {} of {}", old.id(), self.address());
        }

        let id = self.state.next_session_id();
        let this = Arc::downgrade(self);
        *session = Some(Session::start(
            id,
            stream,
            &self.state.session_options(),
            self.state.pending.clone(),
            move |err| {
                if let Some(this) = this.upgrade() {
                    tokio::spawn(async move { this.handle_session_lost(id, err).await });
                }
            },
        ));
        self.set_state(ConnectionState::Connected);
        tracing::info!("connection {} established, session {id}", self.address());
        self.after_connect();
        Ok(())
    }

    fn after_connect(self: &Arc<Self>) {
        for key in &self.interfaces {
            self.state.registry.add(key, self);
        }
        if let Some(app) = self.app.as_ref().and_then(Weak::upgrade) {
            app.attach(self);
        }
    }

    fn deregister(&self) {
        for key in &self.interfaces {
            self.state.registry.remove(key, self);
        }
    }

    /// Re-establishes the session after a disconnect.
    ///
    /// # Errors
    ///
    /// Returns `ReconnectRefused` if the owning app no longer lists this
    /// address, `DiscoveryFailed` if the listing itself fails, otherwise
    /// whatever [`open`](Self::open) returns.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        if !self.still_listed().await? {
            return Err(Error::new(
                ErrorKind::ReconnectRefused,
                format!("{} is no longer listed", self.address()),
            ));
        }

        let mut session = self.session.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(Error::new(
                ErrorKind::ConnectionClosed,
                format!("connection {} is closed", self.address()),
            ));
        }
        if let Some(old) = session.take() {
            self.deregister();
            tracing::info!("drop session {} of {} to reconnect", old.id(), self.address());
            self.set_state(ConnectionState::Disconnected);
        }
        self.open_locked(&mut session).await
    }

    /// A failed listing is an error, not a refusal: the address may well
    /// still be listed.
    async fn still_listed(&self) -> Result<bool> {
        let Some(app) = &self.app else {
            return Ok(true);
        };
        let Some(app) = app.upgrade() else {
            return Ok(false);
        };
        let addresses = app.server_addresses().await.map_err(|e| {
            Error::new(
                ErrorKind::DiscoveryFailed,
                format!("list servers for {} failed: {}", self.address(), e.msg),
            )
        })?;
        Ok(addresses.contains(self.address()))
    }

    /// Sends `request` and waits for its response, connecting first if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrives within the call timeout,
    /// `DuplicateRequestId` if the id is already in flight, and connect or
    /// send errors otherwise.
    pub async fn send(self: &Arc<Self>, request: &BizRequest) -> Result<BizResponse> {
        if !self.is_connected() {
            self.open().await?;
        }

        let (session_id, sender) = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(session) if self.is_connected() => (session.id(), session.sender()),
                _ => {
                    return Err(Error::new(
                        ErrorKind::ConnectionClosed,
                        format!("connection {} is not connected", self.address()),
                    ));
                }
            }
        };

        let config = &self.state.config;
        let guard = self.state.pending.register_wait(&request.request_id)?;
        let msg = Message::request(session_id, request, config.use_msgpack)?;
        let bytes = self.state.codec().encode_to_bytes(&msg)?;
        sender.send(bytes).await.map_err(|_| {
            Error::new(
                ErrorKind::SendFailed,
                format!("session {session_id} of {} is gone", self.address()),
            )
        })?;
        guard.wait(config.call_timeout).await
    }

    /// Releases the session and leaves every invoker and the owning app.
    /// Idempotent.
    pub async fn close(self: &Arc<Self>) {
        let mut session = self.session.lock().await;
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.deregister();
        session.take();
        self.set_state(ConnectionState::Closed);
        drop(session);

        if let Some(app) = self.app.as_ref().and_then(Weak::upgrade) {
            app.detach(self);
        }
        tracing::info!("connection {} closed", self.address());
    }

    /// Closes without waiting, for an owner that is being dropped. Falls
    /// back to a spawned [`close`](Self::close) while a transition holds the
    /// session.
    pub(crate) fn release(self: Arc<Self>) {
        self.deregister();
        let released = if let Ok(mut session) = self.session.try_lock() {
            if self.state() != ConnectionState::Closed {
                self.set_state(ConnectionState::Closing);
                session.take();
                self.set_state(ConnectionState::Closed);
                tracing::info!("connection {} released", self.address());
            }
            true
        } else {
            false
        };
        if released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { self.close().await });
        }
    }

    async fn handle_session_lost(self: Arc<Self>, session_id: u64, err: Error) {
        {
            let mut session = self.session.lock().await;
            if session.as_ref().map(Session::id) != Some(session_id) {
                tracing::debug!("ignore loss of stale session {session_id}");
                return;
            }
            tracing::warn!("session {session_id} of {} lost: {err}", self.address());
            self.deregister();
            session.take();
            self.set_state(ConnectionState::Disconnected);
        }

        if let Some(app) = self.app.as_ref().and_then(Weak::upgrade) {
            app.report(err);
        }
        self.schedule_reconnect();
    }

    /// Starts the reconnect loop if auto reconnect is on and none is running.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if !self.state.config.auto_reconnect {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let this = Arc::downgrade(self);
        let interval = self.state.config.reconnect_interval;
        self.state.supervisor.spawn("reconnect loop", async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(conn) = this.upgrade() else {
                    break;
                };
                match conn.state() {
                    // another open is in flight; look again once it settles.
                    ConnectionState::Connecting => continue,
                    ConnectionState::Connected
                    | ConnectionState::Closing
                    | ConnectionState::Closed => {
                        conn.reconnecting.store(false, Ordering::Release);
                        break;
                    }
                    ConnectionState::Init | ConnectionState::Disconnected => {}
                }
                match conn.reconnect().await {
                    Ok(()) => {
                        tracing::info!("reconnected to {}", conn.address());
                        conn.reconnecting.store(false, Ordering::Release);
                        break;
                    }
                    Err(e) if matches!(
                        e.kind,
                        ErrorKind::ReconnectRefused | ErrorKind::ConnectionClosed
                    ) =>
                    {
                        tracing::info!("stop reconnecting to {}: {e}", conn.address());
                        conn.reconnecting.store(false, Ordering::Release);
                        break;
                    }
                    Err(e) if e.kind == ErrorKind::DiscoveryFailed => {
                        if let Some(app) = conn.app.as_ref().and_then(Weak::upgrade) {
                            app.report(e);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("reconnect to {} failed: {e}", conn.address());
                    }
                }
            }
        });
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("interfaces", &self.interfaces)
            .finish()
    }
}
