use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_util::sync::DropGuard;

use crate::{
    ClientConfig, Connector, InvokerRegistry, PendingCalls, TaskSupervisor, codec::WalleCodec,
    session::SessionOptions,
};

/// Everything one client runtime owns: configuration, transport, the invoker
/// registry, the pending call table and the background tasks.
///
/// Two states never share a table, so independent runtimes can coexist in one
/// process and be torn down separately.
pub struct State {
    pub config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) registry: InvokerRegistry,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) supervisor: TaskSupervisor,
    session_ids: AtomicU64,
    request_ids: AtomicU64,
}

impl State {
    /// Must be called inside a tokio runtime; starts the timeout sweeper.
    #[must_use]
    pub fn create(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let supervisor = TaskSupervisor::create();
        let pending = Arc::new(PendingCalls::new(config.call_timeout));
        pending.spawn_sweeper(&supervisor);
        Self {
            registry: InvokerRegistry::new(config.selector.build()),
            config,
            connector,
            pending,
            supervisor,
            session_ids: AtomicU64::new(1),
            request_ids: AtomicU64::new(1),
        }
    }

    pub(crate) fn codec(&self) -> WalleCodec {
        WalleCodec::new(self.config.max_frame_size)
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions {
            codec: self.codec(),
            heartbeat_interval: self.config.heartbeat_interval,
            read_idle_timeout: self.config.read_idle_timeout,
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.session_ids.fetch_add(1, Ordering::AcqRel)
    }

    #[must_use]
    pub fn next_request_id(&self) -> String {
        self.request_ids.fetch_add(1, Ordering::AcqRel).to_string()
    }

    #[must_use]
    pub fn registry(&self) -> &InvokerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn pending_calls(&self) -> &PendingCalls {
        &self.pending
    }

    pub(crate) fn drop_guard(&self) -> DropGuard {
        self.supervisor.drop_guard()
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .field("registry", &self.registry)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}
