use std::{collections::BTreeSet, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::DropGuard;

use crate::{
    App, AppConfig, ClientConfig, Connection, Connector, Discovery, InterfaceKey,
    InvokerRegistry, Result, ServerUrl, State, TcpConnector,
    msg::{BizRequest, BizResponse},
};

/// Handle to one client runtime. Cheap to clone; dropping the last clone
/// stops the sweeper and every supervised background task.
#[derive(Clone)]
pub struct Context {
    pub state: Arc<State>,
    drop_guard: Arc<DropGuard>,
}

impl Context {
    /// A runtime speaking plain TCP.
    #[must_use]
    pub fn create(config: &ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    #[must_use]
    pub fn with_connector(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let state = Arc::new(State::create(config.clone(), connector));
        Self {
            drop_guard: Arc::new(state.drop_guard()),
            state,
        }
    }

    /// An application bound to this runtime. Call [`App::init`] to connect.
    #[must_use]
    pub fn app(&self, config: AppConfig, discovery: Arc<dyn Discovery>) -> App {
        App::new(self.state.clone(), config, discovery)
    }

    /// A connection outside of any app, e.g. to a fixed address.
    #[must_use]
    pub fn connection(
        &self,
        url: ServerUrl,
        interfaces: BTreeSet<InterfaceKey>,
    ) -> Arc<Connection> {
        Connection::standalone(self.state.clone(), url, interfaces)
    }

    #[must_use]
    pub fn registry(&self) -> &InvokerRegistry {
        &self.state.registry
    }

    /// Sends `request` to a connection serving `key`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown key and `NoAvailableConnection` when no
    /// connection serving it is connected; both fail without waiting.
    pub async fn invoke(&self, key: &InterfaceKey, request: BizRequest) -> Result<BizResponse> {
        let invoker = self.state.registry.resolve(key)?;
        let connection = self.state.registry.select_connection(&invoker)?;
        tracing::trace!(
            "invoke {key}.{} #{} via {}",
            request.method_name,
            request.request_id,
            connection.address()
        );
        connection.send(&request).await
    }

    /// Calls `method` of `key` with a single argument and decodes the result.
    ///
    /// # Errors
    ///
    /// Fails like [`invoke`](Self::invoke), or with the error the server
    /// returned.
    pub async fn call<Req, Rsp>(&self, key: &InterfaceKey, method: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let request = BizRequest::new(self.state.next_request_id(), &key.name, method)
            .with_param(std::any::type_name::<Req>(), req)?;
        self.invoke(key, request).await?.into_result()
    }

    /// Stops background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        self.state.supervisor.stop();
        self.state.supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("state", &self.state).finish()
    }
}
