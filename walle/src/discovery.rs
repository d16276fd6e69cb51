use std::{
    collections::BTreeMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::{
    ServerInfo, ServerUrl,
    error::{Error, ErrorKind, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Removed,
    Updated,
}

/// A change below a watched path. `path` is the full child path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub path: String,
    pub data: Option<Bytes>,
}

impl ChildEvent {
    /// Last segment of the path, e.g. `host:port#version@protocol`.
    #[must_use]
    pub fn child_name(&self) -> &str {
        child_name(&self.path)
    }
}

fn child_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// Service discovery backend, consumed at its boundary only.
#[async_trait]
pub trait Discovery: Send + Sync + std::fmt::Debug + 'static {
    /// Whether this participant publishes a presence node.
    fn is_register(&self) -> bool;

    async fn register(&self) -> Result<()>;

    /// Child names of `path`, in backend order.
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    async fn get_data(&self, path: &str) -> Result<Bytes>;

    /// Subscribes to child changes of `path`. The subscription ends when the
    /// receiver is dropped.
    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ChildEvent>>;
}

/// In-process discovery backend.
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    presence: Option<String>,
    registered: AtomicBool,
    nodes: RwLock<BTreeMap<String, BTreeMap<String, Bytes>>>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<ChildEvent>)>>,
}

impl MemoryDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that registers a presence node at `path` on `register`.
    #[must_use]
    pub fn with_presence(path: impl Into<String>) -> Self {
        Self {
            presence: Some(path.into()),
            ..Self::default()
        }
    }

    /// Loads `{ "/app/servers/host:port": { "interfaceDetailList": [..] } }`.
    ///
    /// # Errors
    pub fn from_json_str(json: &str) -> Result<Self> {
        let snapshot: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut nodes: BTreeMap<String, BTreeMap<String, Bytes>> = BTreeMap::new();
        for (path, data) in snapshot {
            let data = Bytes::from(serde_json::to_vec(&data)?);
            nodes
                .entry(parent_path(&path).to_string())
                .or_default()
                .insert(child_name(&path).to_string(), data);
        }
        Ok(Self {
            nodes: RwLock::new(nodes),
            ..Self::default()
        })
    }

    /// # Errors
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("read discovery snapshot {} failed: {e}", path.display()),
            )
        })?;
        Self::from_json_str(&json)
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Creates or replaces the node at `path` and notifies watchers of its
    /// parent.
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let existed = self
            .nodes
            .write()
            .await
            .entry(parent_path(path).to_string())
            .or_default()
            .insert(child_name(path).to_string(), data.clone())
            .is_some();
        let kind = if existed {
            ChildEventKind::Updated
        } else {
            ChildEventKind::Added
        };
        self.notify(ChildEvent {
            kind,
            path: path.to_string(),
            data: Some(data),
        })
        .await;
    }

    /// Deletes the node at `path`. Returns `false` if it did not exist.
    pub async fn remove(&self, path: &str) -> bool {
        let removed = self
            .nodes
            .write()
            .await
            .get_mut(parent_path(path))
            .and_then(|children| children.remove(child_name(path)))
            .is_some();
        if removed {
            self.notify(ChildEvent {
                kind: ChildEventKind::Removed,
                path: path.to_string(),
                data: None,
            })
            .await;
        }
        removed
    }

    /// Publishes `url` under `servers_path` with the interfaces in `info`.
    ///
    /// # Errors
    pub async fn add_server(
        &self,
        servers_path: &str,
        url: &ServerUrl,
        info: &ServerInfo,
    ) -> Result<()> {
        let data = serde_json::to_vec(info)?;
        self.put(&format!("{servers_path}/{url}"), data).await;
        Ok(())
    }

    pub async fn remove_server(&self, servers_path: &str, url: &ServerUrl) -> bool {
        self.remove(&format!("{servers_path}/{url}")).await
    }

    async fn notify(&self, event: ChildEvent) {
        let parent = parent_path(&event.path);
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|(path, tx)| path != parent || tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    fn is_register(&self) -> bool {
        self.presence.is_some()
    }

    async fn register(&self) -> Result<()> {
        let Some(path) = &self.presence else {
            return Ok(());
        };
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.put(path, Bytes::new()).await;
            tracing::info!("registered presence node {path}");
        }
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .read()
            .await
            .get(path)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_data(&self, path: &str) -> Result<Bytes> {
        self.nodes
            .read()
            .await
            .get(parent_path(path))
            .and_then(|children| children.get(child_name(path)))
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::DiscoveryFailed, format!("no node at {path}")))
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ChildEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().await.push((path.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InterfaceKey, ServerAddress};

    #[tokio::test]
    async fn test_memory_discovery() {
        let discovery = MemoryDiscovery::new();
        let mut events = discovery.watch_children("/demo/servers").await.unwrap();

        let url = ServerUrl::new(ServerAddress::new("127.0.0.1", 9000));
        let info = ServerInfo::from_keys(&[InterfaceKey::new("Foo", "1")]);
        discovery.add_server("/demo/servers", &url, &info).await.unwrap();
        discovery.put("/other/servers/x:1", "{}").await;

        assert_eq!(
            discovery.list_children("/demo/servers").await.unwrap(),
            vec!["127.0.0.1:9000".to_string()]
        );
        let data = discovery.get_data("/demo/servers/127.0.0.1:9000").await.unwrap();
        assert_eq!(ServerInfo::parse(&data).unwrap(), info);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ChildEventKind::Added);
        assert_eq!(event.child_name(), "127.0.0.1:9000");

        discovery.add_server("/demo/servers", &url, &info).await.unwrap();
        assert_eq!(events.recv().await.unwrap().kind, ChildEventKind::Updated);

        assert!(discovery.remove_server("/demo/servers", &url).await);
        assert!(!discovery.remove_server("/demo/servers", &url).await);
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ChildEventKind::Removed);
        assert_eq!(event.data, None);
        assert!(events.try_recv().is_err());

        let err = discovery.get_data("/demo/servers/127.0.0.1:9000").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DiscoveryFailed);
    }

    #[tokio::test]
    async fn test_snapshot_and_presence() {
        let json = r#"{
            "/demo/servers/10.0.0.1:8000#1.0@walle": {
                "interfaceDetailList": [{ "className": "Foo", "version": "1" }]
            },
            "/demo/servers/10.0.0.2:8000": { "interfaceDetailList": [] }
        }"#;
        let discovery = MemoryDiscovery::from_json_str(json).unwrap();
        assert!(!discovery.is_register());
        assert_eq!(
            discovery.list_children("/demo/servers").await.unwrap(),
            vec!["10.0.0.1:8000#1.0@walle".to_string(), "10.0.0.2:8000".to_string()]
        );

        let discovery = MemoryDiscovery::with_presence("/demo/clients/me");
        assert!(discovery.is_register());
        discovery.register().await.unwrap();
        discovery.register().await.unwrap();
        assert!(discovery.is_registered());
        assert_eq!(
            discovery.list_children("/demo/clients").await.unwrap(),
            vec!["me".to_string()]
        );
    }
}
