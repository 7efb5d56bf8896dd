#![cfg(unix)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use castrpc_codec::Value;
use castrpc_peer::{
    LifecycleObserver, LifecycleState, PeerError, Responder, ResponderConfig, Session,
    SessionConfig,
};
use castrpc_transport::{Endpoint, EnvelopeCodec, Listener};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;

const SAY: u16 = 7;
const JOIN: u16 = 2;
const KICK: u16 = 13;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/castrpc-peer-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn chat(method: u16, args: Vec<Value>) -> Result<Vec<Value>, Value> {
    match method {
        JOIN => Ok(vec![Value::from("welcome"), Value::Int32(args.len() as i32)]),
        KICK => Err(Value::from("not a moderator")),
        _ => Ok(args),
    }
}

async fn bind(tag: &str) -> (Listener, Endpoint) {
    let dir = unique_temp_dir(tag);
    let endpoint = Endpoint::Unix(dir.join("chat.sock"));
    let listener = Listener::bind(&endpoint)
        .await
        .expect("listener should bind");
    (listener, endpoint)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_and_notifications_over_unix_socket() {
    let (listener, endpoint) = bind("roundtrip").await;

    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let connection = listener.accept().await.expect("accept");
        let responder = Responder::start(connection, chat, ResponderConfig::default());
        ready_rx.await.expect("client should signal readiness");
        responder
            .notifier()
            .notify(SAY, vec![Value::from("alice"), Value::from("hello")])
            .expect("notify");
        responder.join().await
    });

    let session = Session::connect(&endpoint, SessionConfig::default())
        .await
        .expect("session should connect");
    let (said_tx, mut said_rx) = mpsc::unbounded_channel();
    session.on_notification(SAY, move |args| {
        let _ = said_tx.send(args.to_vec());
    });
    ready_tx.send(()).expect("server should be waiting");

    let joined = session
        .request(JOIN, vec![Value::from("bob")])
        .await
        .expect("join should succeed");
    assert_eq!(joined, vec![Value::from("welcome"), Value::Int32(1)]);

    let kicked = session
        .request(KICK, vec![Value::from("alice")])
        .await
        .unwrap_err();
    assert_eq!(kicked.remote_payload(), Some(&Value::from("not a moderator")));

    let echoed = session
        .request(
            40,
            vec![Value::Map(vec![(Value::from("n"), Value::Float64(0.5))])],
        )
        .await
        .expect("echo");
    assert_eq!(echoed[0].get("n"), Some(&Value::Float64(0.5)));

    let said = tokio::time::timeout(Duration::from_secs(2), said_rx.recv())
        .await
        .expect("notification should arrive")
        .expect("handler should still be registered");
    assert_eq!(said, vec![Value::from("alice"), Value::from("hello")]);

    session.close().await;
    let summary = server
        .await
        .expect("server task")
        .expect("server should finish cleanly");
    assert_eq!(summary.requests, 3);
    assert_eq!(summary.failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_are_correlated() {
    let (listener, endpoint) = bind("concurrent").await;
    let server = tokio::spawn(async move {
        let connection = listener.accept().await.expect("accept");
        Responder::serve(connection, chat, ResponderConfig::default()).await
    });

    let session = Arc::new(
        Session::connect(&endpoint, SessionConfig::default())
            .await
            .expect("connect"),
    );

    let mut tasks = Vec::new();
    for i in 0..50 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            let reply = session
                .request(100, vec![Value::Int32(i)])
                .await
                .expect("echo call");
            assert_eq!(reply, vec![Value::Int32(i)]);
        }));
    }
    for task in tasks {
        task.await.expect("call task");
    }
    assert_eq!(session.pending_len(), 0);

    let session = Arc::into_inner(session).expect("sole owner");
    session.close().await;
    let summary = server.await.expect("server task").expect("serve");
    assert_eq!(summary.requests, 50);
}

#[derive(Default)]
struct Room {
    events: Mutex<Vec<String>>,
}

impl LifecycleObserver for Room {
    fn opened(&self) {
        self.events.lock().unwrap().push("load".to_string());
    }

    fn closed(&self, reason: &str) {
        self.events.lock().unwrap().push(format!("unload: {reason}"));
    }
}

#[tokio::test]
async fn server_going_away_rejects_outstanding_calls() {
    let (listener, endpoint) = bind("server-away").await;
    let server = tokio::spawn(async move {
        let connection = listener.accept().await.expect("accept");
        let (reader, _writer) = connection.into_split();
        let mut frames = FramedRead::new(reader, EnvelopeCodec::new());
        // Read the call, then hang up without answering.
        frames
            .next()
            .await
            .expect("a call should arrive")
            .expect("envelope");
    });

    let session = Session::connect(&endpoint, SessionConfig::default())
        .await
        .expect("connect");
    let room = Arc::new(Room::default());
    session.observe(room.clone());

    let pending = session.call(JOIN, vec![]).expect("call should be queued");
    server.await.expect("server task");

    assert!(matches!(
        pending.await,
        Err(PeerError::ConnectionClosed(_))
    ));
    assert_eq!(session.closed().await, "connection closed by peer");
    assert_eq!(session.state(), LifecycleState::Closed);
    assert_eq!(
        *room.events.lock().unwrap(),
        vec![
            "load".to_string(),
            "unload: connection closed by peer".to_string()
        ]
    );
}

#[tokio::test]
async fn connect_to_missing_socket_fails() {
    let dir = unique_temp_dir("missing");
    let endpoint = Endpoint::Unix(dir.join("absent.sock"));
    let err = Session::connect(&endpoint, SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Transport(_)));
}
