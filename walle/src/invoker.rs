use std::{
    collections::BTreeSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use rand::Rng;

use crate::{
    Connection, InterfaceKey, ServerAddress,
    config::SelectorKind,
    error::{Error, ErrorKind, Result},
};

/// Picks one connection out of the live members of an invoker.
pub trait Selector: Send + Sync + std::fmt::Debug {
    /// `candidates` is non-empty and ordered by address.
    fn select(&self, key: &InterfaceKey, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>>;
}

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl Selector for RoundRobinSelector {
    fn select(&self, _: &InterfaceKey, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        candidates.get(idx % candidates.len()).cloned()
    }
}

#[derive(Debug, Default)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&self, _: &InterfaceKey, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(idx).cloned()
    }
}

#[derive(Debug, Default)]
pub struct FirstSelector;

impl Selector for FirstSelector {
    fn select(&self, _: &InterfaceKey, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        candidates.first().cloned()
    }
}

impl SelectorKind {
    #[must_use]
    pub fn build(self) -> Box<dyn Selector> {
        match self {
            SelectorKind::RoundRobin => Box::new(RoundRobinSelector::default()),
            SelectorKind::Random => Box::new(RandomSelector),
            SelectorKind::First => Box::new(FirstSelector),
        }
    }
}

/// The connections currently able to serve one interface.
///
/// Members are held weakly: an invoker never keeps a connection alive.
/// Connections of different apps may share an address, so each address
/// keeps every live member.
pub struct Invoker {
    key: InterfaceKey,
    connections: DashMap<ServerAddress, Vec<Weak<Connection>>, RandomState>,
}

impl Invoker {
    fn new(key: InterfaceKey) -> Self {
        Self {
            key,
            connections: DashMap::default(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &InterfaceKey {
        &self.key
    }

    /// Live members, ordered by address.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter_map(Weak::upgrade)
                    .collect::<Vec<_>>()
            })
            .collect();
        connections.sort_by(|a, b| a.address().cmp(b.address()));
        connections
    }

    #[must_use]
    pub fn addresses(&self) -> BTreeSet<ServerAddress> {
        self.connections().iter().map(|c| c.address().clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections().is_empty()
    }

    fn add(&self, connection: &Arc<Connection>) -> bool {
        let mut members = self
            .connections
            .entry(connection.address().clone())
            .or_default();
        members.retain(|member| member.strong_count() > 0);
        if members
            .iter()
            .any(|member| std::ptr::eq(member.as_ptr(), Arc::as_ptr(connection)))
        {
            return false;
        }
        members.push(Arc::downgrade(connection));
        true
    }

    fn remove(&self, connection: &Connection) -> bool {
        let removed = {
            let Some(mut members) = self.connections.get_mut(connection.address()) else {
                return false;
            };
            let removed = members
                .iter()
                .any(|member| std::ptr::eq(member.as_ptr(), connection));
            members.retain(|member| {
                member.strong_count() > 0 && !std::ptr::eq(member.as_ptr(), connection)
            });
            removed
        };
        self.connections
            .remove_if(connection.address(), |_, members| members.is_empty());
        removed
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("key", &self.key)
            .field("connections", &self.addresses())
            .finish()
    }
}

/// Maps every interface key ever declared by a connection to its invoker.
///
/// Invokers are created on first use and kept for the lifetime of the
/// registry; an empty invoker means "currently unreachable".
pub struct InvokerRegistry {
    invokers: DashMap<InterfaceKey, Arc<Invoker>, RandomState>,
    selector: Box<dyn Selector>,
}

impl InvokerRegistry {
    #[must_use]
    pub fn new(selector: Box<dyn Selector>) -> Self {
        Self {
            invokers: DashMap::default(),
            selector,
        }
    }

    fn get_or_create(&self, key: &InterfaceKey) -> Arc<Invoker> {
        if let Some(invoker) = self.invokers.get(key) {
            return invoker.clone();
        }
        self.invokers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Invoker::new(key.clone())))
            .clone()
    }

    /// Adds `connection` to the invoker of `key`. Returns `false` if it was
    /// already a member.
    pub fn add(&self, key: &InterfaceKey, connection: &Arc<Connection>) -> bool {
        let added = self.get_or_create(key).add(connection);
        if added {
            tracing::info!("invoker {key} add connection {}", connection.address());
        }
        added
    }

    pub fn remove(&self, key: &InterfaceKey, connection: &Connection) -> bool {
        let removed = self
            .invokers
            .get(key)
            .map(|invoker| invoker.remove(connection))
            .unwrap_or(false);
        if removed {
            tracing::info!("invoker {key} remove connection {}", connection.address());
        }
        removed
    }

    /// # Errors
    ///
    /// Returns `NotFound` if no connection ever declared `key`.
    pub fn resolve(&self, key: &InterfaceKey) -> Result<Arc<Invoker>> {
        self.invokers
            .get(key)
            .map(|invoker| invoker.clone())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no invoker for {key}")))
    }

    /// # Errors
    ///
    /// Returns `NoAvailableConnection` if the invoker has no connected member.
    pub fn select_connection(&self, invoker: &Invoker) -> Result<Arc<Connection>> {
        let candidates: Vec<_> = invoker
            .connections()
            .into_iter()
            .filter(|c| c.is_connected())
            .collect();
        self.selector
            .select(invoker.key(), &candidates)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NoAvailableConnection,
                    format!("no connection available for {}", invoker.key()),
                )
            })
    }

    #[must_use]
    pub fn keys(&self) -> BTreeSet<InterfaceKey> {
        self.invokers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("invokers", &self.keys())
            .field("selector", &self.selector)
            .finish()
    }
}
