use std::{io::IoSlice, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tokio_util::codec::Decoder;

use crate::{
    codec::WalleCodec,
    error::{Error, ErrorKind, Result},
    msg::{Body, Message, MessageType},
    pending::PendingCalls,
    supervisor::TaskSupervisor,
    transport::BoxStream,
};

const SEND_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub codec: WalleCodec,
    pub heartbeat_interval: Option<Duration>,
    pub read_idle_timeout: Option<Duration>,
}

/// A live session over one byte stream.
///
/// Outbound frames go through a bounded queue drained by the send loop; the
/// recv loop decodes inbound frames and hands responses to the pending call
/// table. Dropping the session stops both loops and closes the stream.
pub(crate) struct Session {
    id: u64,
    sender: mpsc::Sender<Bytes>,
    _supervisor: TaskSupervisor,
}

impl Session {
    /// `on_lost` runs at most once, when either loop fails.
    pub fn start<F>(
        id: u64,
        stream: BoxStream,
        options: &SessionOptions,
        pending: Arc<PendingCalls>,
        on_lost: F,
    ) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let (recv_stream, send_stream) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_SIZE);
        let (lost_tx, mut lost_rx) = mpsc::channel::<Error>(1);
        let supervisor = TaskSupervisor::create();

        supervisor.spawn("session watchdog", async move {
            if let Some(err) = lost_rx.recv().await {
                on_lost(err);
            }
        });

        supervisor.spawn("session send loop", {
            let lost_tx = lost_tx.clone();
            async move {
                if let Err(e) = Self::start_send_loop(send_stream, receiver).await {
                    let _ = lost_tx.try_send(e);
                }
            }
        });

        supervisor.spawn("session recv loop", {
            let codec = options.codec;
            let read_idle_timeout = options.read_idle_timeout;
            let sender = sender.clone();
            async move {
                let r = Self::start_recv_loop(
                    id,
                    recv_stream,
                    codec,
                    read_idle_timeout,
                    &pending,
                    &sender,
                )
                .await;
                if let Err(e) = r {
                    let _ = lost_tx.try_send(e);
                }
            }
        });

        if let Some(period) = options.heartbeat_interval {
            let codec = options.codec;
            let sender = sender.clone();
            supervisor.spawn("session heartbeat", async move {
                let start = tokio::time::Instant::now() + period;
                let mut interval = tokio::time::interval_at(start, period);
                loop {
                    interval.tick().await;
                    let ping = Message::heartbeat(id, MessageType::HeartbeatReq);
                    let Ok(bytes) = codec.encode_to_bytes(&ping) else {
                        break;
                    };
                    if sender.send(bytes).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            id,
            sender,
            _supervisor: supervisor,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.sender.clone()
    }

    async fn start_recv_loop(
        id: u64,
        mut recv_stream: ReadHalf<BoxStream>,
        mut codec: WalleCodec,
        read_idle_timeout: Option<Duration>,
        pending: &PendingCalls,
        sender: &mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(64 << 10);
        loop {
            if let Some(msg) = codec.decode(&mut buffer)? {
                Self::handle_message(id, msg, &codec, pending, sender);
                continue;
            }

            let read = recv_stream.read_buf(&mut buffer);
            let n = match read_idle_timeout {
                Some(idle) => tokio::time::timeout(idle, read).await.map_err(|_| {
                    Error::new(
                        ErrorKind::RecvFailed,
                        format!("nothing read for {idle:?}"),
                    )
                })?,
                None => read.await,
            }
            .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
            if n == 0 {
                return Err(Error::new(ErrorKind::RecvFailed, "socket eof"));
            }
        }
    }

    fn handle_message(
        id: u64,
        msg: Message,
        codec: &WalleCodec,
        pending: &PendingCalls,
        sender: &mpsc::Sender<Bytes>,
    ) {
        if msg.header.session_id != id {
            tracing::debug!(
                "drop stale frame of session {} on session {id}",
                msg.header.session_id
            );
            return;
        }

        match msg.header.msg_type {
            MessageType::Response => match msg.body() {
                Ok(Body::Response(rsp)) => {
                    let request_id = rsp.request_id.clone();
                    pending.deliver(&request_id, rsp);
                }
                Ok(body) => tracing::warn!("unexpected response body: {body:?}"),
                Err(e) => tracing::warn!("drop undecodable response on session {id}: {e}"),
            },
            MessageType::HeartbeatReq => {
                let pong = Message::heartbeat(id, MessageType::HeartbeatRsp);
                if let Ok(bytes) = codec.encode_to_bytes(&pong) {
                    let _ = sender.try_send(bytes);
                }
            }
            MessageType::HeartbeatRsp => {
                tracing::trace!("heartbeat reply on session {id}");
            }
            MessageType::Request => {
                tracing::warn!("client session {id} received a request frame, ignored");
            }
        }
    }

    async fn start_send_loop(
        mut send_stream: WriteHalf<BoxStream>,
        mut receiver: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut msgs, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                match send_stream.write_vectored(slices).await {
                    Ok(0) => {
                        return Err(Error::new(ErrorKind::SendFailed, "write zero"));
                    }
                    Ok(n) => IoSlice::advance_slices(&mut slices, n),
                    Err(e) => return Err(Error::new(ErrorKind::SendFailed, e.to_string())),
                }
            }
            send_stream
                .flush()
                .await
                .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
            msgs.clear();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{BizRequest, BizResponse};
    use tokio_util::codec::Encoder;

    fn options() -> SessionOptions {
        SessionOptions {
            codec: WalleCodec::default(),
            heartbeat_interval: None,
            read_idle_timeout: None,
        }
    }

    async fn read_message(stream: &mut tokio::io::DuplexStream, buf: &mut BytesMut) -> Message {
        let mut codec = WalleCodec::default();
        loop {
            if let Some(msg) = codec.decode(buf).unwrap() {
                return msg;
            }
            assert!(stream.read_buf(buf).await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_session_delivers_response() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pending = Arc::new(PendingCalls::new(Duration::from_secs(5)));
        let session = Session::start(7, Box::new(client), &options(), pending.clone(), |_| {});

        let guard = pending.register_wait("r1").unwrap();
        let request = BizRequest::new("r1", "Foo", "bar");
        let bytes = WalleCodec::default()
            .encode_to_bytes(&Message::request(session.id(), &request, false).unwrap())
            .unwrap();
        session.sender().send(bytes).await.unwrap();

        let mut buf = BytesMut::new();
        let msg = read_message(&mut server, &mut buf).await;
        assert_eq!(msg.header.session_id, 7);
        assert_eq!(msg.body().unwrap(), Body::Request(request));

        // a frame of another session is ignored, the matching one delivered.
        let mut out = BytesMut::new();
        let mut codec = WalleCodec::default();
        let rsp = BizResponse::ok("r1", serde_json::json!("stale"));
        codec.encode(Message::response(6, &rsp, false).unwrap(), &mut out).unwrap();
        let rsp = BizResponse::ok("r1", serde_json::json!("fresh"));
        codec.encode(Message::response(7, &rsp, true).unwrap(), &mut out).unwrap();
        server.write_all(&out).await.unwrap();

        let rsp = guard.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rsp.result, Ok(serde_json::json!("fresh")));
    }

    #[tokio::test]
    async fn test_session_lost_on_framing_error() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pending = Arc::new(PendingCalls::new(Duration::from_secs(5)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _session = Session::start(1, Box::new(client), &options(), pending, move |e| {
            let _ = tx.send(e);
        });

        let mut bytes = BytesMut::from(
            &WalleCodec::default()
                .encode_to_bytes(&Message::heartbeat(1, MessageType::HeartbeatRsp))
                .unwrap()[..],
        );
        bytes[4] ^= 0xFF;
        server.write_all(&bytes).await.unwrap();

        let err = rx.await.unwrap();
        assert_eq!(err.kind, ErrorKind::FramingError);
    }

    #[tokio::test]
    async fn test_session_heartbeat_and_idle_timeout() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pending = Arc::new(PendingCalls::new(Duration::from_secs(5)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let options = SessionOptions {
            codec: WalleCodec::default(),
            heartbeat_interval: Some(Duration::from_millis(20)),
            read_idle_timeout: Some(Duration::from_millis(200)),
        };
        let _session = Session::start(3, Box::new(client), &options, pending, move |e| {
            let _ = tx.send(e);
        });

        let mut buf = BytesMut::new();
        let ping = read_message(&mut server, &mut buf).await;
        assert_eq!(ping.header.msg_type, MessageType::HeartbeatReq);
        assert_eq!(ping.header.session_id, 3);

        // the server never answers, so the session goes idle.
        let err = rx.await.unwrap();
        assert_eq!(err.kind, ErrorKind::RecvFailed);
    }

    #[tokio::test]
    async fn test_session_answers_server_heartbeat() {
        let (client, mut server) = tokio::io::duplex(4096);
        let pending = Arc::new(PendingCalls::new(Duration::from_secs(5)));
        let _session = Session::start(4, Box::new(client), &options(), pending, |_| {});

        let ping = WalleCodec::default()
            .encode_to_bytes(&Message::heartbeat(4, MessageType::HeartbeatReq))
            .unwrap();
        server.write_all(&ping).await.unwrap();

        let mut buf = BytesMut::new();
        let pong = read_message(&mut server, &mut buf).await;
        assert_eq!(pong.header.msg_type, MessageType::HeartbeatRsp);
    }
}
