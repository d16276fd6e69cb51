use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::Decoder;
use walle::{
    BizRequest, BizResponse, Body, Error, ErrorKind, InterfaceKey, Message, MessageType, Result,
    ServerInfo, WalleCodec,
};

pub const APP_NAME: &str = "demo";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request(pub String);

#[must_use]
pub fn echo_service() -> InterfaceKey {
    InterfaceKey::new("demo.EchoService", "1.0")
}

#[must_use]
pub fn greet_service() -> InterfaceKey {
    InterfaceKey::new("demo.GreetService", "1.0")
}

#[must_use]
pub fn server_info() -> ServerInfo {
    ServerInfo::from_keys(&[echo_service(), greet_service()])
}

/// A toy server answering `echo` and `greet` so the client has someone to
/// talk to.
#[derive(Default)]
pub struct DemoServer {
    idx: AtomicU64,
}

impl DemoServer {
    /// Accepts streams until the listener fails.
    ///
    /// # Errors
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("accepted {peer}");
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_stream(stream).await {
                    tracing::info!("stream of {peer} ended: {e}");
                }
            });
        }
    }

    async fn serve_stream(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(1024);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut codec = WalleCodec::default();
        let mut buf = BytesMut::with_capacity(64 << 10);
        loop {
            while let Some(msg) = codec.decode(&mut buf)? {
                if let Some(reply) = self.reply(&msg)? {
                    let bytes = codec.encode_to_bytes(&reply)?;
                    if tx.send(bytes).await.is_err() {
                        return Ok(());
                    }
                }
            }
            if reader.read_buf(&mut buf).await? == 0 {
                return Err(Error::new(ErrorKind::RecvFailed, "socket eof"));
            }
        }
    }

    fn reply(&self, msg: &Message) -> Result<Option<Message>> {
        let session_id = msg.header.session_id;
        match msg.header.msg_type {
            MessageType::HeartbeatReq => Ok(Some(Message::heartbeat(
                session_id,
                MessageType::HeartbeatRsp,
            ))),
            MessageType::Request => {
                let Body::Request(request) = msg.body()? else {
                    return Ok(None);
                };
                let use_msgpack = msg.body.first() != Some(&b'{');
                let response = self.handle(&request);
                Message::response(session_id, &response, use_msgpack).map(Some)
            }
            MessageType::Response | MessageType::HeartbeatRsp => Ok(None),
        }
    }

    fn handle(&self, request: &BizRequest) -> BizResponse {
        let id = request.request_id.clone();
        let arg = request
            .parameters
            .first()
            .and_then(|value| serde_json::from_value::<Request>(value.clone()).ok());
        let Some(Request(value)) = arg else {
            let err = Error::new(ErrorKind::InvalidArgument, "expect one Request");
            return BizResponse::err(id, err);
        };
        match (request.class_name.as_str(), request.method_name.as_str()) {
            ("demo.EchoService", "echo") => BizResponse::ok(id, serde_json::json!(value)),
            ("demo.GreetService", "greet") => {
                let idx = self.idx.fetch_add(1, Ordering::AcqRel);
                BizResponse::ok(id, serde_json::json!(format!("hello {value}({idx})!")))
            }
            (class, method) => BizResponse::err(
                id,
                Error::new(ErrorKind::NotFound, format!("no method {class}.{method}")),
            ),
        }
    }
}
