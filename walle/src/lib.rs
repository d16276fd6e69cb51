#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod config;
pub use config::{AppConfig, ChildUpdatePolicy, ClientConfig, SelectorKind};

mod address;
pub use address::{InterfaceDetail, InterfaceKey, ServerAddress, ServerInfo, ServerUrl};

mod msg;
pub use msg::{BizRequest, BizResponse, Body, Header, Message, MessageType};

mod codec;
pub use codec::{DEFAULT_MAX_FRAME_SIZE, FRAME_PREFIX_SIZE, WalleCodec};

mod transport;
pub use transport::{BoxStream, Connector, RawStream, TcpConnector};

mod pending;
pub use pending::{PendingCalls, PendingGuard};

mod supervisor;
pub use supervisor::TaskSupervisor;

mod session;

mod connection;
pub use connection::{Connection, ConnectionState};

mod invoker;
pub use invoker::{
    FirstSelector, Invoker, InvokerRegistry, RandomSelector, RoundRobinSelector, Selector,
};

mod discovery;
pub use discovery::{ChildEvent, ChildEventKind, Discovery, MemoryDiscovery};

mod app;
pub use app::{App, AppState};

mod state;
pub use state::State;

mod context;
pub use context::Context;
