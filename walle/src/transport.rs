use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    ServerAddress,
    error::{Error, ErrorKind, Result},
};

/// An ordered, reliable byte stream to one server.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn RawStream>;

/// Opens byte streams to servers.
///
/// Callers bound `connect` with their own timeout; implementations need not.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug + 'static {
    async fn connect(&self, addr: &ServerAddress) -> Result<BoxStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &ServerAddress) -> Result<BoxStream> {
        let stream = tokio::net::TcpStream::connect((addr.host(), addr.port()))
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectFailed, format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::new(ErrorKind::ConnectFailed, format!("{addr}: {e}")))?;
        Ok(Box::new(stream))
    }
}
