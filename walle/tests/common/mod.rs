#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use walle::{
    AppConfig, BizRequest, BizResponse, Body, ClientConfig, Context, Error, ErrorKind,
    InterfaceKey, MemoryDiscovery, Message, MessageType, ServerAddress, ServerInfo, ServerUrl,
    WalleCodec,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn foo_v1() -> InterfaceKey {
    InterfaceKey::new("demo.Foo", "v1")
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        call_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        reconnect_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Answers requests by method name:
/// - `echo`: returns `"<name>:<arg>"`
/// - `sleep`: sleeps `arg` milliseconds, then returns `"<name>"`
/// - `silent`: never answers
/// - `corrupt`: answers with a frame whose checksum is wrong
/// - `fail`: answers with a `NotFound` error
pub struct MockServer {
    pub name: String,
    pub address: ServerAddress,
    accepted: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl MockServer {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self::serve(name, listener, ServerAddress::new("127.0.0.1", port))
    }

    /// Listens again on an address a stopped server used.
    pub async fn restart(name: &str, address: &ServerAddress) -> Self {
        // the old accept loop may still hold the port for a moment.
        for _ in 0..100 {
            if let Ok(listener) = TcpListener::bind((address.host(), address.port())).await {
                return Self::serve(name, listener, address.clone());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("cannot listen on {address} again");
    }

    fn serve(name: &str, listener: TcpListener, address: ServerAddress) -> Self {
        let accepted = Arc::new(AtomicUsize::default());
        let stop = CancellationToken::new();
        tokio::spawn({
            let name = name.to_string();
            let accepted = accepted.clone();
            let stop = stop.clone();
            async move {
                loop {
                    let stream = tokio::select! {
                        () = stop.cancelled() => break,
                        r = listener.accept() => match r {
                            Ok((stream, _)) => stream,
                            Err(_) => break,
                        },
                    };
                    accepted.fetch_add(1, Ordering::AcqRel);
                    let name = name.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = stop.cancelled() => {}
                            () = serve_stream(name, stream) => {}
                        }
                    });
                }
            }
        });
        Self {
            name: name.to_string(),
            address,
            accepted,
            stop,
        }
    }

    pub fn url(&self) -> ServerUrl {
        ServerUrl::new(self.address.clone())
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    /// Closes the listener and every accepted stream.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn serve_stream(name: String, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut codec = WalleCodec::default();
    let mut buf = BytesMut::new();
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(msg)) => handle(&name, msg, &tx),
            Ok(None) => match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
            Err(_) => return,
        }
    }
}

fn handle(name: &str, msg: Message, tx: &mpsc::Sender<Bytes>) {
    let session_id = msg.header.session_id;
    match msg.header.msg_type {
        MessageType::HeartbeatReq => {
            let pong = Message::heartbeat(session_id, MessageType::HeartbeatRsp);
            let _ = tx.try_send(WalleCodec::default().encode_to_bytes(&pong).unwrap());
        }
        MessageType::Request => {
            let use_msgpack = msg.body.first() != Some(&b'{');
            let Ok(Body::Request(request)) = msg.body() else {
                return;
            };
            let name = name.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(bytes) = respond(&name, session_id, &request, use_msgpack).await {
                    let _ = tx.send(bytes).await;
                }
            });
        }
        _ => {}
    }
}

async fn respond(
    name: &str,
    session_id: u64,
    request: &BizRequest,
    use_msgpack: bool,
) -> Option<Bytes> {
    let arg = request.parameters.first().cloned().unwrap_or_default();
    let id = request.request_id.clone();
    let rsp = match request.method_name.as_str() {
        "echo" => BizResponse::ok(id, serde_json::json!(format!("{name}:{}", arg.as_str()?))),
        "sleep" => {
            tokio::time::sleep(Duration::from_millis(arg.as_u64()?)).await;
            BizResponse::ok(id, serde_json::json!(name))
        }
        "silent" => return None,
        "corrupt" => {
            let rsp = BizResponse::ok(id, serde_json::json!(name));
            let msg = Message::response(session_id, &rsp, use_msgpack).ok()?;
            let mut bytes = BytesMut::from(&WalleCodec::default().encode_to_bytes(&msg).ok()?[..]);
            bytes[4] ^= 0xFF;
            return Some(bytes.freeze());
        }
        _ => BizResponse::err(id, Error::new(ErrorKind::NotFound, "no such method")),
    };
    let msg = Message::response(session_id, &rsp, use_msgpack).ok()?;
    WalleCodec::default().encode_to_bytes(&msg).ok()
}

/// A discovery backend listing `servers` under `/<app>/servers`, each
/// serving `keys`.
pub async fn discovery_with(
    app: &AppConfig,
    servers: &[&MockServer],
    keys: &[InterfaceKey],
) -> Arc<MemoryDiscovery> {
    let discovery = Arc::new(MemoryDiscovery::new());
    for server in servers {
        add_server(&discovery, app, server, keys).await;
    }
    discovery
}

pub async fn add_server(
    discovery: &MemoryDiscovery,
    app: &AppConfig,
    server: &MockServer,
    keys: &[InterfaceKey],
) {
    discovery
        .add_server(&app.servers_path(), &server.url(), &ServerInfo::from_keys(keys))
        .await
        .unwrap();
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn echo(ctx: &Context, key: &InterfaceKey, arg: &str) -> walle::Result<String> {
    ctx.call(key, "echo", &arg).await
}
