use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinSet,
};

use crate::{
    AppConfig, ChildUpdatePolicy, Connection, Discovery, InterfaceKey, ServerAddress, ServerInfo,
    ServerUrl, State, TaskSupervisor,
    discovery::{ChildEvent, ChildEventKind},
    error::{Error, ErrorKind, Result},
};

const ERROR_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Init,
    Inited,
    Closed,
}

pub(crate) struct AppShared {
    config: AppConfig,
    state: Arc<State>,
    discovery: Arc<dyn Discovery>,
    lifecycle: Mutex<AppState>,
    connections: DashMap<ServerAddress, Arc<Connection>, RandomState>,
    errors: broadcast::Sender<Error>,
    supervisor: TaskSupervisor,
}

impl AppShared {
    /// Inserts `connection` unless the address is already owned.
    pub(crate) fn attach(&self, connection: &Arc<Connection>) {
        if self.supervisor.is_stopped() {
            return;
        }
        self.connections
            .entry(connection.address().clone())
            .or_insert_with(|| connection.clone());
    }

    /// Removes `connection` if it is the one owned under its address.
    pub(crate) fn detach(&self, connection: &Connection) {
        self.connections.remove_if(connection.address(), |_, owned| {
            std::ptr::eq(Arc::as_ptr(owned), connection)
        });
    }

    pub(crate) fn report(&self, err: Error) {
        tracing::warn!("app {}: {err}", self.config.name);
        let _ = self.errors.send(err);
    }

    /// Addresses currently listed by discovery. Unparsable children are
    /// skipped.
    pub(crate) async fn server_addresses(&self) -> Result<BTreeSet<ServerAddress>> {
        let children = self
            .discovery
            .list_children(&self.config.servers_path())
            .await?;
        Ok(children
            .iter()
            .filter_map(|child| match child.parse::<ServerUrl>() {
                Ok(url) => Some(url.address),
                Err(e) => {
                    tracing::warn!("skip child {child:?}: {e}");
                    None
                }
            })
            .collect())
    }

    fn create_connection(
        self: &Arc<Self>,
        url: ServerUrl,
        interfaces: BTreeSet<InterfaceKey>,
    ) -> Option<Arc<Connection>> {
        match self.connections.entry(url.address.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let app = Some(Arc::downgrade(self));
                let connection = Connection::new(self.state.clone(), url, interfaces, app);
                entry.insert(connection.clone());
                Some(connection)
            }
        }
    }

    async fn open_connection(&self, connection: &Arc<Connection>) {
        if let Err(e) = connection.open().await {
            self.report(e);
            connection.schedule_reconnect();
        }
    }
}

impl Drop for AppShared {
    fn drop(&mut self) {
        self.supervisor.stop();
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for connection in connections {
            connection.release();
        }
    }
}

/// Discovery-driven owner of the connections of one application.
///
/// `init` builds a connection per listed server and then follows child
/// events on `/<name>/servers`: added servers get a connection, removed ones
/// lose theirs. Errors raised while following events never stop the watch;
/// they are published on [`errors`](Self::errors).
///
/// Dropping the last clone has the effect of [`close`](Self::close): every
/// owned connection leaves its invokers and is closed.
#[derive(Clone)]
pub struct App {
    shared: Arc<AppShared>,
}

impl App {
    pub(crate) fn new(state: Arc<State>, config: AppConfig, discovery: Arc<dyn Discovery>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_SIZE);
        Self {
            shared: Arc::new(AppShared {
                config,
                state,
                discovery,
                lifecycle: Mutex::new(AppState::Init),
                connections: DashMap::default(),
                errors,
                supervisor: TaskSupervisor::create(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub async fn lifecycle_state(&self) -> AppState {
        *self.shared.lifecycle.lock().await
    }

    /// Errors raised by background work: watch events, failed opens, lost
    /// sessions.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<Error> {
        self.shared.errors.subscribe()
    }

    /// Owned connections, ordered by address.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by(|a, b| a.address().cmp(b.address()));
        connections
    }

    #[must_use]
    pub fn connection(&self, address: &ServerAddress) -> Option<Arc<Connection>> {
        self.shared.connections.get(address).map(|c| c.clone())
    }

    /// # Errors
    pub async fn server_addresses(&self) -> Result<BTreeSet<ServerAddress>> {
        self.shared.server_addresses().await
    }

    /// Connects to every listed server and starts following discovery.
    /// Returns at once when already initialized.
    ///
    /// A server that cannot be reached is reported on the error channel and
    /// retried in the background; it does not fail `init`.
    ///
    /// # Errors
    ///
    /// Returns `AppClosed` after [`close`](Self::close), and the discovery or
    /// parse error when listing the servers fails.
    pub async fn init(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        match *lifecycle {
            AppState::Inited => return Ok(()),
            AppState::Closed => {
                return Err(Error::new(
                    ErrorKind::AppClosed,
                    format!("app {} is closed", self.shared.config.name),
                ));
            }
            AppState::Init => {}
        }

        let (events, servers) = self.list_servers().await.inspect_err(|e| {
            tracing::error!("init app {} failed: {e}", self.shared.config.name);
        })?;

        let mut opening = JoinSet::new();
        for (url, interfaces) in servers {
            let Some(connection) = self.shared.create_connection(url, interfaces) else {
                continue;
            };
            let shared = self.shared.clone();
            opening.spawn(async move { shared.open_connection(&connection).await });
        }
        while opening.join_next().await.is_some() {}

        self.spawn_watch(events);
        *lifecycle = AppState::Inited;
        tracing::info!(
            "app {} inited with {} connections",
            self.shared.config.name,
            self.shared.connections.len()
        );
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    async fn list_servers(
        &self,
    ) -> Result<(
        tokio::sync::mpsc::UnboundedReceiver<ChildEvent>,
        Vec<(ServerUrl, BTreeSet<InterfaceKey>)>,
    )> {
        let discovery = &self.shared.discovery;
        if discovery.is_register() {
            discovery.register().await?;
        }

        let path = self.shared.config.servers_path();
        // subscribe first so nothing between listing and watching is lost.
        let events = discovery.watch_children(&path).await?;
        let mut servers = vec![];
        for child in discovery.list_children(&path).await? {
            let url: ServerUrl = child.parse()?;
            let data = discovery.get_data(&format!("{path}/{child}")).await?;
            let interfaces = ServerInfo::parse(&data)?.interface_keys();
            servers.push((url, interfaces));
        }
        Ok((events, servers))
    }

    fn spawn_watch(&self, mut events: tokio::sync::mpsc::UnboundedReceiver<ChildEvent>) {
        let shared = Arc::downgrade(&self.shared);
        self.shared.supervisor.spawn("discovery watch", async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = Weak::upgrade(&shared) else {
                    break;
                };
                let app = App { shared };
                if let Err(e) = app.handle_event(event).await {
                    app.shared.report(e);
                }
            }
        });
    }

    /// Applies one discovery child event. Safe to call concurrently with
    /// itself and with every other operation.
    ///
    /// # Errors
    ///
    /// Returns `StaleConnectionEvent` when a removed child is not owned, and
    /// parse or discovery errors for malformed events.
    pub async fn handle_event(&self, event: ChildEvent) -> Result<()> {
        if self.shared.supervisor.is_stopped() {
            return Err(Error::new(
                ErrorKind::AppClosed,
                format!("app {} is closed", self.shared.config.name),
            ));
        }

        let url: ServerUrl = event.child_name().parse()?;
        match event.kind {
            ChildEventKind::Added => {
                let interfaces = self.interfaces_of(&event).await?;
                match self.shared.create_connection(url, interfaces) {
                    Some(connection) => self.shared.open_connection(&connection).await,
                    None => tracing::debug!("{} is already owned", event.child_name()),
                }
            }
            ChildEventKind::Removed => {
                let Some((_, connection)) = self.shared.connections.remove(&url.address) else {
                    return Err(Error::new(
                        ErrorKind::StaleConnectionEvent,
                        format!("removed child {} is not owned", url.address),
                    ));
                };
                connection.close().await;
            }
            ChildEventKind::Updated => match self.shared.config.child_update {
                ChildUpdatePolicy::Ignore => {
                    tracing::info!("ignore update of {}", event.child_name());
                }
                ChildUpdatePolicy::Refresh => {
                    let interfaces = self.interfaces_of(&event).await?;
                    self.refresh(url, interfaces).await;
                }
            },
        }
        Ok(())
    }

    async fn interfaces_of(&self, event: &ChildEvent) -> Result<BTreeSet<InterfaceKey>> {
        let data = match &event.data {
            Some(data) => data.clone(),
            None => self.shared.discovery.get_data(&event.path).await?,
        };
        Ok(ServerInfo::parse(&data)?.interface_keys())
    }

    async fn refresh(&self, url: ServerUrl, interfaces: BTreeSet<InterfaceKey>) {
        let owned = self.connection(&url.address);
        if let Some(old) = owned {
            if old.interfaces() == &interfaces {
                tracing::debug!("interfaces of {} unchanged", url.address);
                return;
            }
            tracing::info!("interfaces of {} changed, rebuild connection", url.address);
            self.shared.detach(&old);
            old.close().await;
        }
        if let Some(connection) = self.shared.create_connection(url, interfaces) {
            self.shared.open_connection(&connection).await;
        }
    }

    /// Closes every owned connection and stops following discovery.
    /// Idempotent; a closed app cannot be initialized again.
    pub async fn close(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if *lifecycle == AppState::Closed {
            return;
        }
        *lifecycle = AppState::Closed;
        self.shared.supervisor.stop();

        let connections = self.connections();
        for connection in &connections {
            connection.close().await;
        }
        self.shared.connections.clear();
        tracing::info!(
            "app {} closed, {} connections released",
            self.shared.config.name,
            connections.len()
        );
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.shared.config)
            .field("discovery", &self.shared.discovery)
            .field("connections", &self.connections())
            .finish()
    }
}
