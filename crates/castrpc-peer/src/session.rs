use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use castrpc_codec::{CodecConfig, Value};
use castrpc_transport::endpoint::BoxedReader;
use castrpc_transport::{Connection, Endpoint, EnvelopeCodec, DEFAULT_MAX_MESSAGE};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PeerError, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleObserver, LifecycleState, Transition};
use crate::multiplexer::{Multiplexer, NotificationHandler};
use crate::reply::PendingReply;
use crate::writer::spawn_writer;

type SharedMux = Arc<Mutex<Multiplexer<mpsc::UnboundedSender<Bytes>>>>;

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long [`Session::connect`] waits for the transport.
    pub connect_timeout: Duration,
    /// Deadline applied by [`Session::request`].
    pub call_timeout: Duration,
    /// Largest message accepted in either direction.
    pub max_message_size: usize,
    /// Decoding limits for inbound messages.
    pub codec: CodecConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE,
            codec: CodecConfig::default(),
        }
    }
}

/// An async client over one connection.
///
/// Owns a [`Multiplexer`] and the two tasks that feed it: a reader that routes
/// every inbound message and a writer that drains the outbound queue. When
/// the connection ends, for whatever reason, the multiplexer closes and every
/// pending call is rejected. A session never reconnects.
///
/// Must be created inside a Tokio runtime.
pub struct Session {
    mux: SharedMux,
    peer: String,
    config: SessionConfig,
    closed: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to `endpoint` and start the session.
    pub async fn connect(endpoint: &Endpoint, config: SessionConfig) -> Result<Self> {
        let connection = tokio::time::timeout(config.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| PeerError::Timeout(config.connect_timeout))??;
        info!(%endpoint, peer = connection.peer(), "session connected");
        Ok(Self::start(connection, config))
    }

    /// Run a session over an already established connection.
    pub fn start(connection: Connection, config: SessionConfig) -> Self {
        let peer = connection.peer().to_string();
        let (reader, writer) = connection.into_split();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let mut mux = Multiplexer::new(queue_tx)
            .with_codec_config(config.codec.clone())
            .with_max_message(config.max_message_size);
        mux.observe(Arc::new(CloseSignal(closed_tx)));
        let opened = mux.open();
        let mux = Arc::new(Mutex::new(mux));

        let shutdown = CancellationToken::new();
        let codec = EnvelopeCodec::with_max_message(config.max_message_size);

        let weak = Arc::downgrade(&mux);
        let writer = spawn_writer(
            writer,
            codec.clone(),
            queue_rx,
            shutdown.clone(),
            move |err| close_weak(&weak, format!("transport error: {err}")),
        );
        let reader = tokio::spawn(read_loop(
            FramedRead::new(reader, codec),
            Arc::clone(&mux),
            shutdown.clone(),
        ));

        opened.deliver();

        Self {
            mux,
            peer,
            config,
            closed: closed_rx,
            shutdown,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Send a call; the returned future resolves with its reply.
    pub fn call(&self, code: u16, args: Vec<Value>) -> Result<PendingReply> {
        lock(&self.mux).call(code, args)
    }

    /// Send a call and wait at most `timeout` for the reply.
    ///
    /// On timeout the call is forgotten; a late reply is dropped.
    pub async fn call_with_timeout(
        &self,
        code: u16,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let reply = self.call(code, args)?;
        let id = reply.id();
        match tokio::time::timeout(timeout, reply).await {
            Ok(outcome) => outcome,
            Err(_) => {
                lock(&self.mux).cancel(id);
                debug!(id, code, ?timeout, "call timed out");
                Err(PeerError::Timeout(timeout))
            }
        }
    }

    /// [`call_with_timeout`](Self::call_with_timeout) with the configured call timeout.
    pub async fn request(&self, code: u16, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call_with_timeout(code, args, self.config.call_timeout)
            .await
    }

    /// Register or, with `None`, remove the handler for `event`.
    ///
    /// Handlers run on the reader task, outside the session lock.
    pub fn notify(
        &self,
        event: u16,
        handler: Option<NotificationHandler>,
    ) -> Option<NotificationHandler> {
        lock(&self.mux).notify(event, handler)
    }

    pub fn on_notification<F>(&self, event: u16, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        lock(&self.mux).on_notification(event, handler);
    }

    pub fn clear_notification(&self, event: u16) -> bool {
        lock(&self.mux).clear_notification(event)
    }

    /// Register a lifecycle observer.
    ///
    /// The session is already open by the time it exists, so an observer
    /// added now hears `opened` immediately, or `closed` if it has ended.
    pub fn observe(&self, observer: Arc<dyn LifecycleObserver>) {
        let state = {
            let mut mux = lock(&self.mux);
            mux.observe(Arc::clone(&observer));
            mux.state()
        };

        let event = match state {
            LifecycleState::Connecting => return,
            LifecycleState::Open => LifecycleEvent::Opened,
            LifecycleState::Closed => LifecycleEvent::Closed {
                reason: self.close_reason().unwrap_or_default(),
            },
        };
        Transition::new(event, vec![observer]).deliver();
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.mux).state()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.mux).pending_len()
    }

    /// Remote side as reported by the transport.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Wait until the session closes and return the reason.
    pub async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "session dropped".to_string(),
        };
        reason
    }

    /// Close the session.
    ///
    /// Pending calls are rejected, messages already queued are flushed, and
    /// the connection is shut down.
    pub async fn close(mut self) {
        let transition = lock(&self.mux).close("closed by client");
        transition.deliver();
        self.shutdown.cancel();

        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let transition = lock(&self.mux).close("session dropped");
        transition.deliver();
        self.shutdown.cancel();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Publishes the close reason to [`Session::closed`] waiters.
struct CloseSignal(watch::Sender<Option<String>>);

impl LifecycleObserver for CloseSignal {
    fn closed(&self, reason: &str) {
        self.0.send_replace(Some(reason.to_string()));
    }
}

fn lock(
    mux: &Mutex<Multiplexer<mpsc::UnboundedSender<Bytes>>>,
) -> MutexGuard<'_, Multiplexer<mpsc::UnboundedSender<Bytes>>> {
    mux.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close_weak(mux: &Weak<Mutex<Multiplexer<mpsc::UnboundedSender<Bytes>>>>, reason: String) {
    if let Some(mux) = mux.upgrade() {
        let transition = lock(&mux).close(reason);
        transition.deliver();
    }
}

async fn read_loop(
    mut frames: FramedRead<BoxedReader, EnvelopeCodec>,
    mux: SharedMux,
    shutdown: CancellationToken,
) {
    let reason = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                let dispatch = lock(&mux).route(&frame);
                dispatch.deliver();
            }
            Some(Err(err)) => break format!("transport error: {err}"),
            None => break "connection closed by peer".to_string(),
        }
    };

    let transition = lock(&mux).close(reason);
    transition.deliver();
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use castrpc_codec::{Message, RawMessage, Side, NOTIFICATION_ID, RESPONSE_ERROR, RESPONSE_OK};
    use castrpc_transport::endpoint::BoxedWriter;
    use castrpc_transport::TransportError;
    use futures_util::SinkExt;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::FramedWrite;

    use super::*;

    /// The far end of a session's connection, speaking raw envelopes.
    struct FakeServer {
        frames: FramedRead<BoxedReader, EnvelopeCodec>,
        sink: FramedWrite<BoxedWriter, EnvelopeCodec>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> (u16, u16, Vec<Value>) {
            let frame = self
                .frames
                .next()
                .await
                .expect("stream ended")
                .expect("envelope");
            match Message::parse(&frame, Side::Server).expect("parse request") {
                Message::Request { id, method, args } => (id, method, args),
                other => panic!("expected request, got {other:?}"),
            }
        }

        async fn send(&mut self, id: u16, code: u16, args: Vec<Value>) {
            let wire = RawMessage::new(id, code, args).serialize().unwrap();
            self.sink.send(wire).await.expect("send to session");
        }
    }

    fn pair(config: SessionConfig) -> (Session, FakeServer) {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let session = Session::start(Connection::from_stream(client, "duplex"), config);
        let (reader, writer) = Connection::from_stream(server, "client").into_split();
        let server = FakeServer {
            frames: FramedRead::new(reader, EnvelopeCodec::new()),
            sink: FramedWrite::new(writer, EnvelopeCodec::new()),
        };
        (session, server)
    }

    #[tokio::test]
    async fn call_resolves_with_reply_args() {
        let (session, mut server) = pair(SessionConfig::default());
        assert_eq!(session.state(), LifecycleState::Open);

        let reply = session.call(5, vec![Value::from("x")]).unwrap();
        let (id, method, args) = server.next_request().await;
        assert_eq!((id, method), (0, 5));
        assert_eq!(args, vec![Value::from("x")]);

        server
            .send(id, RESPONSE_OK, vec![Value::Int32(1), Value::from("y")])
            .await;
        assert_eq!(
            reply.await.unwrap(),
            vec![Value::Int32(1), Value::from("y")]
        );
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn remote_failure_rejects_call() {
        let (session, mut server) = pair(SessionConfig::default());
        let reply = session.call(9, vec![]).unwrap();
        let (id, _, _) = server.next_request().await;

        server
            .send(id, RESPONSE_ERROR, vec![Value::from("denied")])
            .await;
        let err = reply.await.unwrap_err();
        assert_eq!(err.remote_payload(), Some(&Value::from("denied")));
    }

    #[tokio::test]
    async fn notifications_reach_handlers() {
        let (session, mut server) = pair(SessionConfig::default());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        session.on_notification(7, move |args| {
            let _ = seen_tx.send(args.to_vec());
        });

        server.send(NOTIFICATION_ID, 8, vec![Value::from("skip")]).await;
        server
            .send(NOTIFICATION_ID, 7, vec![Value::from("alice"), Value::from("hi")])
            .await;

        let args = seen_rx.recv().await.unwrap();
        assert_eq!(args, vec![Value::from("alice"), Value::from("hi")]);
    }

    #[tokio::test]
    async fn peer_disconnect_rejects_pending_calls() {
        let (session, mut server) = pair(SessionConfig::default());
        let first = session.call(1, vec![]).unwrap();
        let second = session.call(2, vec![]).unwrap();
        server.next_request().await;
        server.next_request().await;

        drop(server);

        assert!(matches!(first.await, Err(PeerError::ConnectionClosed(_))));
        assert!(matches!(second.await, Err(PeerError::ConnectionClosed(_))));
        assert_eq!(session.closed().await, "connection closed by peer");
        assert_eq!(session.state(), LifecycleState::Closed);
        assert!(matches!(session.call(3, vec![]), Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn closed_resolves_again_once_session_is_closed() {
        let (session, server) = pair(SessionConfig::default());
        drop(server);

        assert_eq!(session.closed().await, "connection closed by peer");
        assert_eq!(session.closed().await, "connection closed by peer");
        assert_eq!(
            session.close_reason().as_deref(),
            Some("connection closed by peer")
        );
    }

    #[tokio::test]
    async fn garbage_on_stream_closes_session() {
        let (client, mut server) = tokio::io::duplex(1024);
        let session = Session::start(
            Connection::from_stream(client, "duplex"),
            SessionConfig::default(),
        );
        let pending = session.call(1, vec![]).unwrap();

        server.write_all(b"XX\0\0\0\0").await.unwrap();

        assert!(matches!(pending.await, Err(PeerError::ConnectionClosed(_))));
        assert!(session.closed().await.contains("invalid envelope magic"));
    }

    #[tokio::test]
    async fn malformed_message_is_skipped() {
        let (session, mut server) = pair(SessionConfig::default());
        let reply = session.call(1, vec![]).unwrap();
        let (id, _, _) = server.next_request().await;

        server
            .sink
            .send(Bytes::from_static(&[0, 0, 0, 1, 0xEE]))
            .await
            .unwrap();
        server.send(id, RESPONSE_OK, vec![Value::Null]).await;

        assert_eq!(reply.await.unwrap(), vec![Value::Null]);
        assert_eq!(session.state(), LifecycleState::Open);
    }

    #[tokio::test]
    async fn call_with_timeout_gives_up_and_forgets_the_call() {
        let (session, mut server) = pair(SessionConfig::default());
        let err = session
            .call_with_timeout(4, vec![], Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, PeerError::Timeout(_)));
        assert_eq!(session.pending_len(), 0);

        let (id, _, _) = server.next_request().await;
        server.send(id, RESPONSE_OK, vec![]).await;
        assert_eq!(session.state(), LifecycleState::Open);
    }

    #[tokio::test]
    async fn oversized_call_fails_without_closing() {
        let (session, _server) = pair(SessionConfig {
            max_message_size: 16,
            ..SessionConfig::default()
        });

        let err = session
            .call(1, vec![Value::from("this does not fit")])
            .unwrap_err();
        assert!(matches!(
            err,
            PeerError::Transport(TransportError::MessageTooLarge { .. })
        ));
        assert_eq!(session.state(), LifecycleState::Open);
    }

    #[tokio::test]
    async fn notification_handler_may_issue_calls() {
        let (session, mut server) = pair(SessionConfig::default());
        let session = Arc::new(session);
        let replies = Arc::new(Mutex::new(Vec::new()));

        let handle = Arc::clone(&session);
        let sink = Arc::clone(&replies);
        session.on_notification(3, move |_| {
            let reply = handle.call(10, vec![Value::from("ack")]);
            sink.lock().unwrap().push(reply);
        });

        server.send(NOTIFICATION_ID, 3, vec![]).await;
        let (_, method, args) = server.next_request().await;
        assert_eq!(method, 10);
        assert_eq!(args, vec![Value::from("ack")]);
        assert!(replies.lock().unwrap()[0].is_ok());
    }

    #[derive(Default)]
    struct Counter {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl LifecycleObserver for Counter {
        fn opened(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn closed(&self, _reason: &str) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn late_observer_hears_current_state() {
        let (session, server) = pair(SessionConfig::default());
        let counter = Arc::new(Counter::default());
        session.observe(counter.clone());
        assert_eq!(counter.opened.load(Ordering::SeqCst), 1);

        drop(server);
        session.closed().await;
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);

        let late = Arc::new(Counter::default());
        session.observe(late.clone());
        assert_eq!(late.opened.load(Ordering::SeqCst), 0);
        assert_eq!(late.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_flushes_queued_calls_and_rejects_them() {
        let (session, mut server) = pair(SessionConfig::default());
        let reply = session.call(6, vec![Value::from("last words")]).unwrap();

        session.close().await;

        assert!(matches!(reply.await, Err(PeerError::ConnectionClosed(_))));
        let (_, method, args) = server.next_request().await;
        assert_eq!(method, 6);
        assert_eq!(args, vec![Value::from("last words")]);
        assert!(server.frames.next().await.is_none());
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let endpoint: Endpoint = "unix:///nonexistent/castrpc/session.sock".parse().unwrap();
        let err = Session::connect(&endpoint, SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PeerError::Transport(TransportError::Connect { .. })
        ));
    }
}
