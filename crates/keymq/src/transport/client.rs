//! Client connection handler.
//!
//! One read loop per socket feeds puts and registrations straight into the
//! slot store. Each get waits on its own task and writes through the shared
//! [`PacketWriter`], so a get on an empty key never holds up reading or gets
//! on other keys. Gets for the same key are chained and answered in request order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::ConnectionError;
use super::writer::PacketWriter;
use crate::bridge::codec::{DEFAULT_MAX_BODY_SIZE, PacketCodec};
use crate::bridge::protocol::{ClientMessageType, Packet, ProtocolViolation, Role, RoutingKey};
use crate::slot::{DequeueError, SlotStore, WebhookBinding};

pub struct ClientConnection {
    store: Arc<SlotStore>,
    peer: SocketAddr,
    max_body_size: usize,
    cancel: CancellationToken,
}

/// Gets read from one connection that have not been answered yet.
struct PendingGets {
    tasks: JoinSet<()>,
    /// Completion signal of the newest get per key.
    tails: HashMap<RoutingKey, oneshot::Receiver<()>>,
}

impl PendingGets {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            tails: HashMap::new(),
        }
    }

    /// Queue behind the previous get for `key`, if it is still pending.
    fn chain(&mut self, key: RoutingKey) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        let (done, tail) = oneshot::channel();
        (self.tails.insert(key, tail), done)
    }
}

impl ClientConnection {
    /// `cancel` ends the connection from outside; pass a child of the server's token.
    pub fn new(store: Arc<SlotStore>, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            store,
            peer,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            cancel,
        }
    }

    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    pub async fn serve(self, stream: TcpStream) -> Result<(), ConnectionError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        self.run(reader, writer).await
    }

    /// Run until reading ends and every get already read has been answered.
    ///
    /// A clean end of stream only stops reading: the peer may have half-closed
    /// and still be waiting for responses. A read error, a failed write or
    /// `cancel` abandons pending gets; a body taken for a response that could
    /// not be written goes back to the front of its queue.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = PacketCodec::new(Role::Client).with_max_body_size(self.max_body_size);
        let mut reader = FramedRead::new(reader, codec);
        let writer = Arc::new(PacketWriter::new(writer, Role::Client));
        let mut gets = PendingGets::new();

        let result = self.read_loop(&mut reader, &writer, &mut gets).await;
        if result.is_err() {
            self.cancel.cancel();
        } else if !gets.tasks.is_empty() {
            tracing::debug!(peer = %self.peer, pending = gets.tasks.len(), "Read side closed, answering pending gets");
        }

        while let Some(joined) = gets.tasks.join_next().await {
            self.reap(joined);
        }
        result
    }

    async fn read_loop<R, W>(
        &self,
        reader: &mut FramedRead<R, PacketCodec>,
        writer: &Arc<PacketWriter<W>>,
        gets: &mut PendingGets,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                Some(joined) = gets.tasks.join_next(), if !gets.tasks.is_empty() => {
                    self.reap(joined);
                    continue;
                }
                next = reader.next() => match next {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            };
            self.handle(packet, writer, gets);
        }
    }

    fn handle<W>(&self, packet: Packet, writer: &Arc<PacketWriter<W>>, gets: &mut PendingGets)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let key = packet.header.key;
        let kind = match packet.header.client_type() {
            Ok(kind) => kind,
            Err(violation) => {
                tracing::warn!(peer = %self.peer, %key, %violation, "Ignoring packet");
                return;
            }
        };
        tracing::trace!(peer = %self.peer, %key, kind = kind.as_str(), body_size = packet.body.len(), "Packet received");

        match kind {
            ClientMessageType::Put => self.store.enqueue(&key, packet.body),
            ClientMessageType::Get => {
                let (turn, done) = gets.chain(key);
                gets.tasks.spawn(serve_get(
                    Arc::clone(&self.store),
                    Arc::clone(writer),
                    key,
                    turn,
                    done,
                    self.cancel.clone(),
                    self.peer,
                ));
            }
            ClientMessageType::CallRegister => match WebhookBinding::parse(&key, &packet.body) {
                Ok(binding) => {
                    self.store.bind_webhook(&key, binding);
                }
                Err(violation) => {
                    tracing::warn!(peer = %self.peer, %key, %violation, "Rejecting webhook registration");
                }
            },
            ClientMessageType::Error | ClientMessageType::Response => {
                let violation = ProtocolViolation::UnexpectedType {
                    role: Role::Client,
                    name: kind.as_str(),
                };
                tracing::warn!(peer = %self.peer, %key, %violation, "Ignoring packet");
            }
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            tracing::error!(peer = %self.peer, error = %e, "Get task failed");
        }
    }
}

/// Answer one get: wait for the previous get on the same key, take a body, write it.
///
/// `_done` is dropped on return, which releases the next get for this key.
async fn serve_get<W: AsyncWrite + Unpin>(
    store: Arc<SlotStore>,
    writer: Arc<PacketWriter<W>>,
    key: RoutingKey,
    turn: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
    cancel: CancellationToken,
    peer: SocketAddr,
) {
    if let Some(turn) = turn {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = turn => {}
        }
    }

    let body = match store.dequeue(&key, &cancel).await {
        Ok(body) => body,
        Err(DequeueError::Cancelled) => {
            tracing::debug!(%peer, %key, "Abandoning pending get");
            return;
        }
    };

    let response = Packet::client(ClientMessageType::Response, key, body.clone());
    if let Err(e) = writer.send(response).await {
        tracing::error!(%peer, %key, error = %e, "Failed to write response");
        store.requeue(&key, body);
        cancel.cancel();
        return;
    }
    tracing::trace!(%peer, %key, "Response written");
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::SinkExt;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_util::bytes::Bytes;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::webhook::testing::RecordingInvoker;

    /// Writer whose every write fails as if the peer had gone away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        store: Arc<SlotStore>,
        invoker: Arc<RecordingInvoker>,
        peer: Framed<DuplexStream, PacketCodec>,
        handle: JoinHandle<Result<(), ConnectionError>>,
    }

    fn key(n: u8) -> RoutingKey {
        RoutingKey::new([n; 32])
    }

    fn connect() -> Harness {
        let invoker = Arc::new(RecordingInvoker::default());
        let store = Arc::new(SlotStore::new(invoker.clone()));
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);

        let conn = ClientConnection::new(
            Arc::clone(&store),
            "127.0.0.1:1".parse().unwrap(),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(conn.run(reader, writer));

        Harness {
            store,
            invoker,
            peer: Framed::new(theirs, PacketCodec::peer(Role::Client)),
            handle,
        }
    }

    async fn send(peer: &mut Framed<DuplexStream, PacketCodec>, kind: ClientMessageType, key: RoutingKey, body: &[u8]) {
        peer.send(Packet::client(kind, key, body.to_vec())).await.unwrap();
    }

    async fn recv(peer: &mut Framed<DuplexStream, PacketCodec>) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("response timed out")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_body() {
        let mut h = connect();
        send(&mut h.peer, ClientMessageType::Put, key(1), b"hello").await;
        send(&mut h.peer, ClientMessageType::Get, key(1), b"").await;

        let response = recv(&mut h.peer).await;
        assert_eq!(response.header.client_type().unwrap(), ClientMessageType::Response);
        assert_eq!(response.key(), &key(1));
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(response.header.body_size, 5);
    }

    #[tokio::test]
    async fn get_waits_for_put_from_another_producer() {
        let mut h = connect();
        send(&mut h.peer, ClientMessageType::Get, key(2), b"").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.store.enqueue(&key(2), Bytes::from_static(b"late"));

        let response = recv(&mut h.peer).await;
        assert_eq!(&response.body[..], b"late");
    }

    #[tokio::test]
    async fn waiting_get_does_not_block_other_keys() {
        let mut h = connect();
        send(&mut h.peer, ClientMessageType::Get, key(1), b"").await;
        send(&mut h.peer, ClientMessageType::Get, key(2), b"").await;
        send(&mut h.peer, ClientMessageType::Put, key(2), b"two").await;

        let response = recv(&mut h.peer).await;
        assert_eq!(response.key(), &key(2));
        assert_eq!(&response.body[..], b"two");

        send(&mut h.peer, ClientMessageType::Put, key(1), b"one").await;
        let response = recv(&mut h.peer).await;
        assert_eq!(response.key(), &key(1));
        assert_eq!(&response.body[..], b"one");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_responses_follow_request_order() {
        let mut h = connect();
        for _ in 0..5 {
            send(&mut h.peer, ClientMessageType::Get, key(7), b"").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 0..5u8 {
            h.store.enqueue(&key(7), Bytes::from(vec![n]));
        }

        for n in 0..5u8 {
            assert_eq!(&recv(&mut h.peer).await.body[..], &[n]);
        }
    }

    #[tokio::test]
    async fn call_register_binds_and_fires() {
        let mut h = connect();
        send(
            &mut h.peer,
            ClientMessageType::CallRegister,
            key(3),
            b"http://hooks.local/a\n{\"job\":1}",
        )
        .await;
        send(&mut h.peer, ClientMessageType::CallRegister, key(3), b"http://hooks.local/b").await;
        send(&mut h.peer, ClientMessageType::Put, key(3), b"x").await;
        send(&mut h.peer, ClientMessageType::Get, key(3), b"").await;
        recv(&mut h.peer).await;

        let posts = h.invoker.posts();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|(url, body)| url == "http://hooks.local/a" && body == r#"{"job":1}"#));
        assert_eq!(h.store.slot(&key(3)).binding().unwrap().url(), "http://hooks.local/a");
    }

    #[tokio::test]
    async fn violations_keep_connection_open() {
        let mut h = connect();
        send(&mut h.peer, ClientMessageType::Response, key(4), b"").await;
        send(&mut h.peer, ClientMessageType::Error, key(4), b"").await;
        send(&mut h.peer, ClientMessageType::CallRegister, key(4), b"\n").await;
        h.peer
            .send(Packet::new(crate::bridge::protocol::PacketHeader { kind: 42, key: key(4), body_size: 0 }, Bytes::new()))
            .await
            .unwrap();

        send(&mut h.peer, ClientMessageType::Put, key(4), b"still here").await;
        send(&mut h.peer, ClientMessageType::Get, key(4), b"").await;
        assert_eq!(&recv(&mut h.peer).await.body[..], b"still here");
        assert!(h.store.slot(&key(4)).binding().is_none());
        assert!(h.invoker.posts().is_empty());
    }

    #[tokio::test]
    async fn half_closed_peer_still_gets_responses() {
        let mut h = connect();
        h.store.enqueue(&key(5), Bytes::from_static(b"ready"));
        send(&mut h.peer, ClientMessageType::Get, key(5), b"").await;
        send(&mut h.peer, ClientMessageType::Get, key(5), b"").await;
        h.peer.get_mut().shutdown().await.unwrap();

        assert_eq!(&recv(&mut h.peer).await.body[..], b"ready");

        h.store.enqueue(&key(5), Bytes::from_static(b"later"));
        assert_eq!(&recv(&mut h.peer).await.body[..], b"later");

        tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.store.slot(&key(5)).is_empty());
    }

    #[tokio::test]
    async fn closed_peer_loses_no_body() {
        let h = connect();
        let mut peer = h.peer;
        send(&mut peer, ClientMessageType::Get, key(5), b"").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        h.store.enqueue(&key(5), Bytes::from_static(b"kept"));
        tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(h.store.slot(&key(5)).len(), 1);
        assert_eq!(h.store.dequeue(&key(5), &cancel).await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn failed_response_write_requeues_body_at_front() {
        let invoker = Arc::new(RecordingInvoker::default());
        let store = Arc::new(SlotStore::new(invoker));
        store.enqueue(&key(8), Bytes::from_static(b"first"));
        store.enqueue(&key(8), Bytes::from_static(b"second"));

        let (ours, theirs) = tokio::io::duplex(1024);
        let (reader, _unused) = tokio::io::split(ours);
        let conn = ClientConnection::new(Arc::clone(&store), "127.0.0.1:1".parse().unwrap(), CancellationToken::new());
        let handle = tokio::spawn(conn.run(reader, BrokenPipe));

        let mut peer = Framed::new(theirs, PacketCodec::peer(Role::Client));
        send(&mut peer, ClientMessageType::Get, key(8), b"").await;

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(store.slot(&key(8)).len(), 2);
        assert_eq!(store.dequeue(&key(8), &cancel).await.unwrap(), "first");
        assert_eq!(store.dequeue(&key(8), &cancel).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn oversized_body_closes_connection() {
        let invoker = Arc::new(RecordingInvoker::default());
        let store = Arc::new(SlotStore::new(invoker));
        let (ours, theirs) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(ours);
        let conn = ClientConnection::new(Arc::clone(&store), "127.0.0.1:1".parse().unwrap(), CancellationToken::new())
            .with_max_body_size(4);
        let handle = tokio::spawn(conn.run(reader, writer));

        let mut peer = Framed::new(theirs, PacketCodec::peer(Role::Client));
        send(&mut peer, ClientMessageType::Put, key(6), b"too long").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Codec(crate::bridge::codec::CodecError::BodyTooLarge { size: 8, max: 4 })
        ));
        assert!(store.get(&key(6)).is_none());
    }

    #[tokio::test]
    async fn cancel_ends_connection() {
        let invoker = Arc::new(RecordingInvoker::default());
        let store = Arc::new(SlotStore::new(invoker));
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(ours);
        let cancel = CancellationToken::new();
        let conn = ClientConnection::new(store, "127.0.0.1:1".parse().unwrap(), cancel.child_token());
        let handle = tokio::spawn(conn.run(reader, writer));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
