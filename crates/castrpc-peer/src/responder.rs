use bytes::Bytes;
use castrpc_codec::{CodecConfig, Message, RawMessage, Side, Value, NOTIFICATION_ID};
use castrpc_transport::{Connection, EnvelopeCodec, TransportError, DEFAULT_MAX_MESSAGE};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{PeerError, Result};
use crate::writer::spawn_writer;

/// Answers calls on the serving side of a connection.
///
/// `Ok(args)` is sent back as a success response carrying `args`;
/// `Err(payload)` as a failure response whose only argument is `payload`.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, method: u16, args: Vec<Value>) -> std::result::Result<Vec<Value>, Value>;
}

impl<F> Dispatcher for F
where
    F: Fn(u16, Vec<Value>) -> std::result::Result<Vec<Value>, Value> + Send + Sync + 'static,
{
    fn dispatch(&self, method: u16, args: Vec<Value>) -> std::result::Result<Vec<Value>, Value> {
        self(method, args)
    }
}

/// Configuration for a [`Responder`].
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Largest message accepted in either direction.
    pub max_message_size: usize,
    /// Decoding limits for inbound messages.
    pub codec: CodecConfig,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            codec: CodecConfig::default(),
        }
    }
}

/// Counters reported when a connection has been served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub requests: u64,
    pub failures: u64,
    pub notifications: u64,
    pub malformed: u64,
}

/// Pushes notifications to the client of a [`Responder`].
#[derive(Debug, Clone)]
pub struct Notifier {
    queue: mpsc::UnboundedSender<Bytes>,
    max_message: usize,
}

impl Notifier {
    /// Queue a notification for `event`.
    pub fn notify(&self, event: u16, args: Vec<Value>) -> Result<()> {
        let message = RawMessage::new(NOTIFICATION_ID, event, args).serialize()?;
        if message.len() > self.max_message {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max: self.max_message,
            }
            .into());
        }
        self.queue
            .send(message)
            .map_err(|_| PeerError::Transport(TransportError::Closed))
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Serves a single connection: answers its requests and carries notifications.
pub struct Responder {
    notifier: Notifier,
    task: JoinHandle<Result<ServeSummary>>,
}

impl Responder {
    /// Start serving `connection` in the background.
    pub fn start<D: Dispatcher>(connection: Connection, dispatcher: D, config: ResponderConfig) -> Self {
        let peer = connection.peer().to_string();
        let (reader, writer) = connection.into_split();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let codec = EnvelopeCodec::with_max_message(config.max_message_size);
        let shutdown = CancellationToken::new();

        let write_failed = shutdown.clone();
        let writer = spawn_writer(writer, codec.clone(), queue_rx, shutdown.clone(), move |_| {
            write_failed.cancel();
        });

        let notifier = Notifier {
            queue: queue_tx,
            max_message: config.max_message_size,
        };
        let worker = Worker {
            dispatcher,
            replies: notifier.clone(),
            codec: config.codec,
            summary: ServeSummary::default(),
        };

        info!(%peer, "serving connection");
        let task = tokio::spawn(async move {
            let result = worker
                .run(FramedRead::new(reader, codec), shutdown.clone())
                .await;
            shutdown.cancel();
            let _ = writer.await;
            match &result {
                Ok(summary) => info!(%peer, ?summary, "connection finished"),
                Err(err) => warn!(%peer, error = %err, "connection failed"),
            }
            result
        });

        Self { notifier, task }
    }

    /// Serve `connection` until the client disconnects.
    pub async fn serve<D: Dispatcher>(
        connection: Connection,
        dispatcher: D,
        config: ResponderConfig,
    ) -> Result<ServeSummary> {
        Self::start(connection, dispatcher, config).join().await
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Wait for the client to disconnect.
    ///
    /// Notifications queued before the disconnect are still flushed.
    pub async fn join(self) -> Result<ServeSummary> {
        let Self { notifier, task } = self;
        drop(notifier);
        match task.await {
            Ok(result) => result,
            Err(err) => Err(PeerError::ConnectionClosed(format!("responder task failed: {err}"))),
        }
    }
}

struct Worker<D> {
    dispatcher: D,
    replies: Notifier,
    codec: CodecConfig,
    summary: ServeSummary,
}

impl<D: Dispatcher> Worker<D> {
    async fn run(
        mut self,
        mut frames: FramedRead<castrpc_transport::endpoint::BoxedReader, EnvelopeCodec>,
        shutdown: CancellationToken,
    ) -> Result<ServeSummary> {
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                () = shutdown.cancelled() => {
                    return Err(PeerError::ConnectionClosed("write side failed".to_string()));
                }
            };
            match frame {
                Some(Ok(frame)) => self.handle(&frame),
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(self.summary),
            }
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        let raw = match RawMessage::parse_with_config(frame, &self.codec) {
            Ok(raw) => raw,
            Err(err) => {
                self.summary.malformed += 1;
                warn!(error = %err, len = frame.len(), "dropping malformed frame");
                return;
            }
        };

        match Message::classify(raw, Side::Server) {
            Message::Request { id, method, args } => self.answer(id, method, args),
            Message::Notification { event, args } => {
                self.summary.notifications += 1;
                trace!(event, args = args.len(), "ignoring client notification");
            }
            Message::Response { id, .. } => debug!(id, "ignoring response sent to server"),
        }
    }

    fn answer(&mut self, id: u16, method: u16, args: Vec<Value>) {
        self.summary.requests += 1;
        let response = match self.dispatcher.dispatch(method, args) {
            Ok(args) => Message::Response { id, ok: true, args },
            Err(payload) => {
                self.summary.failures += 1;
                Message::Response {
                    id,
                    ok: false,
                    args: vec![payload],
                }
            }
        };
        debug!(id, method, "answering call");

        if let Err(err) = self.send(&response) {
            warn!(id, method, error = %err, "reply could not be sent");
            // Fall back to a failure the client can still decode.
            let fallback = Message::Response {
                id,
                ok: false,
                args: vec![Value::from(err.to_string())],
            };
            if let Err(err) = self.send(&fallback) {
                warn!(id, error = %err, "fallback reply could not be sent");
            }
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        let wire = message.serialize()?;
        if wire.len() > self.replies.max_message {
            return Err(TransportError::MessageTooLarge {
                size: wire.len(),
                max: self.replies.max_message,
            }
            .into());
        }
        self.replies
            .queue
            .send(wire)
            .map_err(|_| PeerError::Transport(TransportError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use castrpc_codec::{RESPONSE_ERROR, RESPONSE_OK};
    use castrpc_transport::endpoint::BoxedWriter;
    use futures_util::SinkExt;
    use tokio_util::codec::FramedWrite;

    use super::*;

    fn echo(method: u16, args: Vec<Value>) -> std::result::Result<Vec<Value>, Value> {
        if method == 13 {
            return Err(args.into_iter().next().unwrap_or(Value::Null));
        }
        Ok(args)
    }

    struct Client {
        frames: FramedRead<castrpc_transport::endpoint::BoxedReader, EnvelopeCodec>,
        sink: FramedWrite<BoxedWriter, EnvelopeCodec>,
    }

    impl Client {
        async fn send(&mut self, id: u16, code: u16, args: Vec<Value>) {
            let wire = RawMessage::new(id, code, args).serialize().unwrap();
            self.sink.send(wire).await.expect("send to responder");
        }

        async fn recv(&mut self) -> RawMessage {
            let frame = self
                .frames
                .next()
                .await
                .expect("stream ended")
                .expect("envelope");
            RawMessage::parse(&frame).expect("parse")
        }
    }

    fn pair(config: ResponderConfig) -> (Responder, Client) {
        pair_with(echo, config)
    }

    fn pair_with<D: Dispatcher>(dispatcher: D, config: ResponderConfig) -> (Responder, Client) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let responder =
            Responder::start(Connection::from_stream(server, "duplex"), dispatcher, config);
        let (reader, writer) = Connection::from_stream(client, "server").into_split();
        let client = Client {
            frames: FramedRead::new(reader, EnvelopeCodec::new()),
            sink: FramedWrite::new(writer, EnvelopeCodec::new()),
        };
        (responder, client)
    }

    #[tokio::test]
    async fn answers_requests_with_dispatcher_result() {
        let (responder, mut client) = pair(ResponderConfig::default());

        client.send(4, 2, vec![Value::from("x"), Value::Int32(9)]).await;
        assert_eq!(
            client.recv().await,
            RawMessage::new(4, RESPONSE_OK, vec![Value::from("x"), Value::Int32(9)])
        );

        client.send(5, 13, vec![Value::from("nope")]).await;
        assert_eq!(
            client.recv().await,
            RawMessage::new(5, RESPONSE_ERROR, vec![Value::from("nope")])
        );

        drop(client);
        let summary = responder.join().await.unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.failures, 1);
    }

    #[tokio::test]
    async fn notifier_pushes_sentinel_frames() {
        let (responder, mut client) = pair(ResponderConfig::default());
        let notifier = responder.notifier();

        notifier
            .notify(7, vec![Value::from("alice"), Value::from("hi")])
            .unwrap();
        let pushed = client.recv().await;
        assert!(pushed.is_notification());
        assert_eq!(pushed.code, 7);
        assert_eq!(pushed.args, vec![Value::from("alice"), Value::from("hi")]);

        drop(client);
        responder.join().await.unwrap();
        assert!(notifier.notify(7, vec![]).is_err());
    }

    #[tokio::test]
    async fn malformed_and_client_notifications_are_counted_not_answered() {
        let (responder, mut client) = pair(ResponderConfig::default());

        client
            .sink
            .send(Bytes::from_static(&[0, 1, 0, 1, 0x42]))
            .await
            .unwrap();
        client.send(NOTIFICATION_ID, 3, vec![]).await;
        client.send(8, 1, vec![Value::Bool(true)]).await;

        assert_eq!(
            client.recv().await,
            RawMessage::new(8, RESPONSE_OK, vec![Value::Bool(true)])
        );

        drop(client);
        let summary = responder.join().await.unwrap();
        assert_eq!(
            summary,
            ServeSummary {
                requests: 1,
                failures: 0,
                notifications: 1,
                malformed: 1,
            }
        );
    }

    #[tokio::test]
    async fn oversized_reply_becomes_failure() {
        let (responder, mut client) = pair_with(
            |_: u16, _: Vec<Value>| -> std::result::Result<Vec<Value>, Value> {
                Ok(vec![Value::from("x".repeat(100))])
            },
            ResponderConfig {
                max_message_size: 96,
                ..ResponderConfig::default()
            },
        );

        client.send(1, 2, vec![]).await;
        let reply = client.recv().await;
        assert_eq!(reply.id, 1);
        assert_eq!(reply.code, RESPONSE_ERROR);
        assert!(reply.args[0]
            .as_str()
            .is_some_and(|msg| msg.contains("too large")));

        drop(client);
        responder.join().await.unwrap();
    }

    #[tokio::test]
    async fn envelope_error_fails_the_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let responder = Responder::start(
            Connection::from_stream(server, "duplex"),
            echo,
            ResponderConfig::default(),
        );
        let (_, mut writer) = Connection::from_stream(client, "server").into_split();
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"ZZ\0\0\0\0")
            .await
            .unwrap();

        let err = responder.join().await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Transport(TransportError::InvalidMagic)
        ));
    }
}
